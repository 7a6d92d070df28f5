//! Gmail OAuth2 access tokens
//!
//! Tokens are imported once (`relayd token import`) into the secret store
//! and refreshed with the refresh-token grant when they are about to expire.
//! Refresh requests go through the shared [`Transport`].

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::GmailCredentials;
use crate::storage::SecretStore;
use crate::transport::{Cancellation, HttpRequest, RequestBody, Transport};

/// Seconds before expiry at which a token is treated as expired
const EXPIRY_BUFFER_SECS: i64 = 300;

/// Supplies bearer tokens for Gmail API calls
pub trait TokenSource: Send + Sync {
    fn access_token(&self, cancel: &Cancellation) -> Result<String>;
}

/// A fixed token, for tests and short-lived runs
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn access_token(&self, _cancel: &Cancellation) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Stored token data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Expiry as epoch seconds
    pub expires_at: Option<i64>,
}

impl StoredToken {
    /// Whether the access token is usable for at least the expiry buffer
    pub fn is_fresh(&self, now: i64) -> bool {
        !self.access_token.is_empty()
            && self
                .expires_at
                .is_some_and(|expires_at| expires_at > now + EXPIRY_BUFFER_SECS)
    }
}

/// Token response from Google
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Tokens for one account, loaded from a [`SecretStore`]
pub struct StoredTokenSource {
    account: String,
    credentials: GmailCredentials,
    secrets: Arc<dyn SecretStore>,
    transport: Arc<dyn Transport>,
    cached: Mutex<Option<StoredToken>>,
    token_url: String,
}

impl StoredTokenSource {
    /// OAuth2 token endpoint
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    pub fn new(
        account: impl Into<String>,
        credentials: GmailCredentials,
        secrets: Arc<dyn SecretStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            account: account.into(),
            credentials,
            secrets,
            transport,
            cached: Mutex::new(None),
            token_url: Self::TOKEN_URL.to_string(),
        }
    }

    /// Override the token endpoint
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Secret store key for an account's token
    pub fn secret_key(account: &str) -> String {
        format!("token:{}", account.trim().to_ascii_lowercase())
    }

    /// Save a token for `account`
    pub fn store_token(secrets: &dyn SecretStore, account: &str, token: &StoredToken) -> Result<()> {
        let content = serde_json::to_string(token)?;
        secrets
            .set(&Self::secret_key(account), &content)
            .with_context(|| format!("Failed to store token for {account}"))
    }

    fn load_token(&self) -> Result<Option<StoredToken>> {
        let Some(content) = self.secrets.get(&Self::secret_key(&self.account))? else {
            return Ok(None);
        };
        let token = serde_json::from_str(&content)
            .with_context(|| format!("Stored token for {} is corrupt", self.account))?;
        Ok(Some(token))
    }

    /// Refresh an access token using a refresh token
    fn refresh_access_token(&self, refresh_token: &str, cancel: &Cancellation) -> Result<TokenResponse> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("client_secret", &self.credentials.client_secret)
            .append_pair("refresh_token", refresh_token)
            .append_pair("grant_type", "refresh_token")
            .finish();

        let mut request: HttpRequest = http::Request::post(self.token_url.as_str())
            .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(http::header::ACCEPT, "application/json")
            .body(RequestBody::Bytes(form.into_bytes()))
            .context("Failed to build token refresh request")?;
        request.extensions_mut().insert(cancel.clone());

        let response = self
            .transport
            .round_trip(request)
            .context("Failed to refresh access token")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.into_body().read_limited(4096).unwrap_or_default();
            bail!(
                "Token refresh failed with {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body).trim()
            );
        }

        response
            .into_body()
            .read_json()
            .context("Failed to parse refresh token response")
    }
}

impl TokenSource for StoredTokenSource {
    fn access_token(&self, cancel: &Cancellation) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(token) = cached.as_ref()
            && token.is_fresh(now)
        {
            return Ok(token.access_token.clone());
        }

        let stored = self.load_token()?.with_context(|| {
            format!(
                "No stored token for {}; run `relayd token import` first",
                self.account
            )
        })?;
        if stored.is_fresh(now) {
            let access_token = stored.access_token.clone();
            *cached = Some(stored);
            return Ok(access_token);
        }

        let refresh_token = stored
            .refresh_token
            .context("Stored token expired and has no refresh token")?;
        debug!("Refreshing access token for {}", self.account);
        let response = self.refresh_access_token(&refresh_token, cancel)?;

        // Preserve the refresh token if not returned
        let token = StoredToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(Some(refresh_token)),
            expires_at: response.expires_in.map(|d| now + d as i64),
        };
        Self::store_token(self.secrets.as_ref(), &self.account, &token)?;
        info!("Refreshed access token for {}", self.account);

        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }
}
