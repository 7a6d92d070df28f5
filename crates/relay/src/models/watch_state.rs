//! Watch state tracking for push-driven Gmail sync

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default body budget when a hook asks for message bodies
pub const DEFAULT_HOOK_MAX_BYTES: usize = 20_000;

/// Where and how decoded notifications are forwarded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub include_body: bool,
    /// Body byte budget; 0 means [`DEFAULT_HOOK_MAX_BYTES`]
    #[serde(default)]
    pub max_bytes: usize,
}

impl HookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            include_body: false,
            max_bytes: 0,
        }
    }

    pub fn effective_max_bytes(&self) -> usize {
        if self.max_bytes == 0 {
            DEFAULT_HOOK_MAX_BYTES
        } else {
            self.max_bytes
        }
    }
}

/// Result of the last hook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Ok,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Persisted watch for one Gmail account
///
/// Stored as a single JSON record. `history_id` is the last fully processed
/// cursor and only moves forward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchState {
    pub account: String,
    /// Pub/Sub topic the watch publishes to
    pub topic: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Gmail historyId, decimal string; empty until the first baseline
    #[serde(default)]
    pub history_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_expiration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_after_ms: Option<i64>,
    #[serde(default)]
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_status: Option<DeliveryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_status_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_message_id: Option<String>,
}

impl WatchState {
    /// Create a new watch record
    ///
    /// Labels are kept sorted and unique.
    pub fn new(
        account: impl Into<String>,
        topic: impl Into<String>,
        labels: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut labels: Vec<String> = labels
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        labels.sort();
        labels.dedup();

        Self {
            account: account.into(),
            topic: topic.into(),
            labels,
            ..Default::default()
        }
    }

    /// Parsed history cursor, None when unset or unparseable
    pub fn history_cursor(&self) -> Option<u64> {
        parse_history_id(&self.history_id)
    }

    /// Whether the next push should set the baseline cursor
    ///
    /// Gmail never issues historyId 0, so a stored "0" counts as unset. A
    /// garbage cursor does not: it needs fixing, not silent replacement.
    pub fn needs_baseline(&self) -> bool {
        self.history_id.trim().is_empty() || self.history_cursor() == Some(0)
    }

    /// Move the cursor forward to `history_id`
    ///
    /// Returns false (and leaves the cursor alone) when `history_id` is not
    /// ahead of the stored one.
    pub fn advance_history(&mut self, history_id: u64) -> bool {
        if self
            .history_cursor()
            .is_some_and(|current| history_id <= current)
        {
            return false;
        }
        self.history_id = history_id.to_string();
        true
    }

    /// Record the outcome of a hook delivery
    pub fn record_delivery(&mut self, status: DeliveryStatus, note: Option<String>, at_ms: i64) {
        self.last_delivery_status = Some(status);
        self.last_delivery_at_ms = Some(at_ms);
        self.last_delivery_status_note = note;
    }

    /// Set the advisory expirations after a `watch` call
    ///
    /// The watch expires after `ttl` or when Gmail says so, whichever comes
    /// first. Renewal is due halfway there.
    pub fn apply_expiration(&mut self, now_ms: i64, ttl: Duration, provider_expiration_ms: Option<i64>) {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let mut expires = now_ms.saturating_add(ttl_ms);
        if let Some(provider) = provider_expiration_ms.filter(|p| *p > now_ms) {
            expires = expires.min(provider);
        }
        self.expiration_ms = Some(expires);
        self.provider_expiration_ms = provider_expiration_ms;
        self.renew_after_ms = Some(now_ms + (expires - now_ms) / 2);
    }

    /// Whether the watch should be renewed at `now_ms`
    pub fn renewal_due(&self, now_ms: i64) -> bool {
        self.renew_after_ms.is_none_or(|at| now_ms >= at)
    }
}

/// Parse a string-encoded Gmail historyId
pub fn parse_history_id(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value.parse().ok()
}
