//! Gmail API HTTP client
//!
//! Every call goes through the shared [`Transport`] (normally a
//! [`RetryTransport`](crate::transport::RetryTransport)) with the caller's
//! [`Cancellation`] attached to the request.

use std::sync::Arc;

use http::{Method, header};
use log::debug;
use serde::de::DeserializeOwned;
use url::Url;

use super::api::{
    GmailMessage, HistoryResponse, LabelInfo, ListLabelsResponse, ListMessagesResponse,
    WatchRequest, WatchResponse,
};
use super::{GmailError, MailService, MessageFormat, TokenSource};
use crate::error::{ApiError, ErrorKind};
use crate::transport::{Cancellation, HttpResponse, RequestBody, Transport, TransportError};

/// Largest error body kept for diagnostics
const ERROR_BODY_LIMIT: u64 = 64 * 1024;

/// Headers requested with `format=metadata`
const METADATA_HEADERS: [&str; 4] = ["From", "To", "Subject", "Date"];

/// Gmail API client
pub struct GmailClient {
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenSource>,
    base_url: String,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Maximum history records per page
    const HISTORY_PAGE_SIZE: u32 = 100;

    /// Create a new Gmail client
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            transport,
            tokens,
            base_url: Self::BASE_URL.to_string(),
        }
    }

    /// Point the client at another API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, GmailError> {
        let mut url = Url::parse(&format!("{}/users/me/{}", self.base_url, path))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    fn send(
        &self,
        method: Method,
        url: Url,
        body: RequestBody,
        cancel: &Cancellation,
    ) -> Result<HttpResponse, GmailError> {
        let access_token = self
            .tokens
            .access_token(cancel)
            .map_err(GmailError::Auth)?;

        let mut builder = http::Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
            .header(header::ACCEPT, "application/json");
        if !matches!(body, RequestBody::Empty) {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let mut request = builder.body(body).map_err(TransportError::from)?;
        request.extensions_mut().insert(cancel.clone());

        let response = self.transport.round_trip(request)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .into_body()
            .read_limited(ERROR_BODY_LIMIT)
            .map_err(TransportError::from)?;
        let err = ApiError::from_body(status.as_u16(), &body);
        debug!("Gmail API error on {}: {}", url.path(), err);
        Err(err.into())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        what: &'static str,
        url: Url,
        cancel: &Cancellation,
    ) -> Result<T, GmailError> {
        let response = self.send(Method::GET, url, RequestBody::Empty, cancel)?;
        read_json(what, response)
    }

    /// List message IDs from the user's mailbox, newest first
    ///
    /// # Arguments
    /// * `max_results` - Maximum number of messages to return per page (1-500)
    /// * `page_token` - Optional page token for pagination
    pub fn list_messages(
        &self,
        max_results: usize,
        page_token: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<ListMessagesResponse, GmailError> {
        let mut query = vec![("maxResults", max_results.clamp(1, 500).to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let url = self.url("messages", &query)?;
        self.get_json("list messages", url, cancel)
    }

    /// Get a message by ID
    pub fn get_message(
        &self,
        id: &str,
        format: MessageFormat,
        cancel: &Cancellation,
    ) -> Result<GmailMessage, GmailError> {
        let mut query = vec![("format", format.as_str().to_string())];
        if format == MessageFormat::Metadata {
            query.extend(METADATA_HEADERS.iter().map(|h| ("metadataHeaders", h.to_string())));
        }
        let url = self.url(&format!("messages/{}", urlencoding::encode(id)), &query)?;
        self.get_json("get message", url, cancel)
    }

    /// List all labels in the mailbox
    pub fn list_labels(&self, cancel: &Cancellation) -> Result<ListLabelsResponse, GmailError> {
        let url = self.url("labels", &[])?;
        self.get_json("list labels", url, cancel)
    }

    /// List `messageAdded` history since a given history ID
    ///
    /// Returns [`GmailError::HistoryExpired`] if the history ID is too old.
    pub fn list_history(
        &self,
        start_history_id: u64,
        page_token: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<HistoryResponse, GmailError> {
        let mut query = vec![
            ("startHistoryId", start_history_id.to_string()),
            ("historyTypes", "messageAdded".to_string()),
            ("maxResults", Self::HISTORY_PAGE_SIZE.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let url = self.url("history", &query)?;

        match self.get_json("history", url, cancel) {
            Err(err)
                if matches!(
                    err.kind(),
                    Some(ErrorKind::StaleHistory | ErrorKind::NotFound)
                ) =>
            {
                Err(GmailError::HistoryExpired)
            }
            other => other,
        }
    }

    /// Start (or renew) push notifications to a Pub/Sub topic
    pub fn watch(
        &self,
        request: &WatchRequest,
        cancel: &Cancellation,
    ) -> Result<WatchResponse, GmailError> {
        let url = self.url("watch", &[])?;
        let body = RequestBody::json(request).map_err(|source| GmailError::Decode {
            what: "watch request",
            source,
        })?;
        let response = self.send(Method::POST, url, body, cancel)?;
        read_json("watch", response)
    }

    /// Stop push notifications for the mailbox
    pub fn stop(&self, cancel: &Cancellation) -> Result<(), GmailError> {
        let url = self.url("stop", &[])?;
        let response = self.send(Method::POST, url, RequestBody::Empty, cancel)?;
        response
            .into_body()
            .drain()
            .map_err(TransportError::from)?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(what: &'static str, response: HttpResponse) -> Result<T, GmailError> {
    response
        .into_body()
        .read_json()
        .map_err(|source| GmailError::Decode { what, source })
}

impl MailService for GmailClient {
    fn list_history(
        &self,
        start_history_id: u64,
        page_token: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<HistoryResponse, GmailError> {
        GmailClient::list_history(self, start_history_id, page_token, cancel)
    }

    fn get_message(
        &self,
        id: &str,
        format: MessageFormat,
        cancel: &Cancellation,
    ) -> Result<GmailMessage, GmailError> {
        GmailClient::get_message(self, id, format, cancel)
    }

    fn list_recent_message_ids(
        &self,
        max: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<String>, GmailError> {
        let response = self.list_messages(max, None, cancel)?;
        Ok(response
            .messages
            .unwrap_or_default()
            .into_iter()
            .take(max)
            .map(|m| m.id)
            .collect())
    }

    fn list_labels(&self, cancel: &Cancellation) -> Result<Vec<LabelInfo>, GmailError> {
        Ok(GmailClient::list_labels(self, cancel)?.labels.unwrap_or_default())
    }
}
