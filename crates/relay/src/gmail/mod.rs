//! Gmail API integration
//!
//! This module provides:
//! - Access-token sources backed by the secret store
//! - Gmail API client for history, messages, labels and watch calls
//! - Response normalization to hook messages

mod auth;
mod client;
mod normalize;

use std::sync::Arc;

pub use auth::{StaticToken, StoredToken, StoredTokenSource, TokenSource};
pub use client::GmailClient;
pub(crate) use normalize::decode_base64;
pub use normalize::{extract_header, extract_plain_text_body, hook_message, truncate_utf8};

use crate::error::{ApiError, ErrorKind, classify};
use crate::transport::{Cancellation, TransportError};
use api::{GmailMessage, HistoryResponse, LabelInfo};

/// Errors from the Gmail client
#[derive(Debug, thiserror::Error)]
pub enum GmailError {
    /// The start history ID is too old for Gmail to diff from
    #[error("History ID expired or invalid")]
    HistoryExpired,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Failed to parse {what} response: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid request url: {0}")]
    Url(#[from] url::ParseError),
    #[error("Failed to obtain access token: {0:#}")]
    Auth(anyhow::Error),
}

impl GmailError {
    /// Provider classification, when the error came from the provider
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::HistoryExpired => Some(ErrorKind::StaleHistory),
            Self::Api(err) => Some(classify(err)),
            _ => None,
        }
    }
}

/// Which representation of a message to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// Headers (From/To/Subject/Date), labels and snippet
    Metadata,
    /// Everything including body parts
    Full,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Full => "full",
        }
    }
}

/// The mail operations the push relay needs
pub trait MailService: Send + Sync {
    /// One page of `messageAdded` history since `start_history_id`
    ///
    /// Returns [`GmailError::HistoryExpired`] when the cursor is too old.
    fn list_history(
        &self,
        start_history_id: u64,
        page_token: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<HistoryResponse, GmailError>;

    fn get_message(
        &self,
        id: &str,
        format: MessageFormat,
        cancel: &Cancellation,
    ) -> Result<GmailMessage, GmailError>;

    /// IDs of the newest `max` messages, newest first
    fn list_recent_message_ids(
        &self,
        max: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<String>, GmailError>;

    fn list_labels(&self, cancel: &Cancellation) -> Result<Vec<LabelInfo>, GmailError>;
}

impl<T: MailService + ?Sized> MailService for Arc<T> {
    fn list_history(
        &self,
        start_history_id: u64,
        page_token: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<HistoryResponse, GmailError> {
        (**self).list_history(start_history_id, page_token, cancel)
    }

    fn get_message(
        &self,
        id: &str,
        format: MessageFormat,
        cancel: &Cancellation,
    ) -> Result<GmailMessage, GmailError> {
        (**self).get_message(id, format, cancel)
    }

    fn list_recent_message_ids(
        &self,
        max: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<String>, GmailError> {
        (**self).list_recent_message_ids(max, cancel)
    }

    fn list_labels(&self, cancel: &Cancellation) -> Result<Vec<LabelInfo>, GmailError> {
        (**self).list_labels(cancel)
    }
}

impl<T: MailService + ?Sized> MailService for &T {
    fn list_history(
        &self,
        start_history_id: u64,
        page_token: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<HistoryResponse, GmailError> {
        (**self).list_history(start_history_id, page_token, cancel)
    }

    fn get_message(
        &self,
        id: &str,
        format: MessageFormat,
        cancel: &Cancellation,
    ) -> Result<GmailMessage, GmailError> {
        (**self).get_message(id, format, cancel)
    }

    fn list_recent_message_ids(
        &self,
        max: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<String>, GmailError> {
        (**self).list_recent_message_ids(max, cancel)
    }

    fn list_labels(&self, cancel: &Cancellation) -> Result<Vec<LabelInfo>, GmailError> {
        (**self).list_labels(cancel)
    }
}

/// Gmail API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Response from listing messages
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
    }

    /// Message from Gmail API (metadata or full format)
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        #[serde(default)]
        pub internal_date: String,
        pub history_id: Option<String>,
        pub payload: Option<MessagePayload>,
    }

    /// Message payload containing headers and body
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
        pub mime_type: Option<String>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Message body (may be base64 encoded)
    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct MessageBody {
        pub size: Option<u32>,
        pub data: Option<String>,
    }

    /// Message part (for multipart messages)
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    /// One page of history
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        /// Mailbox history ID at the time of the request
        pub history_id: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: Option<String>,
        pub messages_added: Option<Vec<MessageAdded>>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct MessageAdded {
        pub message: MessageRef,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct ListLabelsResponse {
        pub labels: Option<Vec<LabelInfo>>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    pub struct LabelInfo {
        pub id: String,
        pub name: String,
    }

    /// Body of `users.watch`
    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WatchRequest {
        pub topic_name: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub label_ids: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub label_filter_behavior: Option<String>,
    }

    /// Response of `users.watch`
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WatchResponse {
        #[serde(deserialize_with = "crate::models::string_or_number")]
        pub history_id: String,
        /// Expiration as epoch milliseconds
        #[serde(default, deserialize_with = "crate::models::string_or_number")]
        pub expiration: String,
    }
}
