//! Hook delivery
//!
//! One POST per handled push, no retries. Failures are reported back to the
//! caller as a short note for the watch state.

use std::sync::Arc;
use std::time::Duration;

use http::header;
use log::{debug, warn};

use super::reconcile::Delta;
use crate::config::DEFAULT_HOOK_TIMEOUT;
use crate::gmail::{hook_message, truncate_utf8};
use crate::models::{DeliveryStatus, HookConfig, HookPayload};
use crate::transport::{Cancellation, HttpRequest, RequestBody, Transport, TransportError};

/// Longest delivery note kept in the watch state
pub const NOTE_MAX_BYTES: usize = 200;

/// Response bytes quoted in a failure note
const ERROR_BODY_LIMIT: u64 = 1024;

/// Why a hook delivery failed
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("hook returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("hook request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to encode hook payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// No hook configured
    Skipped,
    Delivered { status: u16 },
    Failed { note: String },
}

impl DeliveryOutcome {
    /// Status to record, None when nothing was attempted
    pub fn status(&self) -> Option<DeliveryStatus> {
        match self {
            Self::Skipped => None,
            Self::Delivered { .. } => Some(DeliveryStatus::Ok),
            Self::Failed { .. } => Some(DeliveryStatus::Error),
        }
    }

    pub fn note(&self) -> Option<String> {
        match self {
            Self::Failed { note } => Some(note.clone()),
            _ => None,
        }
    }
}

/// Build the hook payload for a reconciled delta
pub fn build_payload(account: &str, delta: &Delta, hook: Option<&HookConfig>) -> HookPayload {
    let messages = delta
        .messages
        .iter()
        .map(|m| hook_message(m, &delta.label_names, hook))
        .collect();
    let mut payload = HookPayload::new(account, delta.history_id, messages);
    payload.resync = delta.resync;
    payload
}

/// Posts payloads to the configured hook
pub struct HookDispatcher {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl HookDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Bound each delivery by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deliver `payload` to `hook`
    pub fn dispatch(
        &self,
        hook: Option<&HookConfig>,
        payload: &HookPayload,
        cancel: &Cancellation,
    ) -> DeliveryOutcome {
        let Some(hook) = hook else {
            return DeliveryOutcome::Skipped;
        };

        match self.deliver(hook, payload, cancel) {
            Ok(status) => {
                debug!(
                    "Delivered {} message(s) to {} ({})",
                    payload.messages.len(),
                    hook.url,
                    status
                );
                DeliveryOutcome::Delivered { status }
            }
            Err(e) => {
                warn!("Hook delivery to {} failed: {}", hook.url, e);
                let note = e.to_string();
                DeliveryOutcome::Failed {
                    note: truncate_utf8(&note, NOTE_MAX_BYTES).0.to_string(),
                }
            }
        }
    }

    fn deliver(
        &self,
        hook: &HookConfig,
        payload: &HookPayload,
        cancel: &Cancellation,
    ) -> Result<u16, DeliveryError> {
        let mut builder = http::Request::post(hook.url.as_str())
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = hook.token.as_deref().filter(|t| !t.is_empty()) {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let mut request: HttpRequest = builder
            .body(RequestBody::json(payload)?)
            .map_err(TransportError::from)?;
        request
            .extensions_mut()
            .insert(cancel.clone().with_timeout(self.timeout));

        let response = self.transport.round_trip(request)?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .read_limited(ERROR_BODY_LIMIT)
            .unwrap_or_default();

        if (200..300).contains(&status) {
            Ok(status)
        } else {
            Err(DeliveryError::Status {
                status,
                body: String::from_utf8_lossy(&body).trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::api::GmailMessage;
    use crate::transport::{Interrupt, MockResponse, MockTransport};
    use std::collections::HashMap;

    fn payload() -> HookPayload {
        HookPayload::new("user@gmail.com", 200, Vec::new())
    }

    fn hook(token: Option<&str>) -> HookConfig {
        let mut hook = HookConfig::new("https://hooks.example.com/gmail");
        hook.token = token.map(String::from);
        hook
    }

    #[test]
    fn test_no_hook_is_skipped() {
        let transport = Arc::new(MockTransport::new(|_| Ok(MockResponse::status(200))));
        let dispatcher = HookDispatcher::new(transport.clone());
        let outcome = dispatcher.dispatch(None, &payload(), &Cancellation::never());
        assert_eq!(outcome, DeliveryOutcome::Skipped);
        assert_eq!(outcome.status(), None);
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn test_delivers_json_with_bearer() {
        let transport = Arc::new(MockTransport::new(|_| Ok(MockResponse::status(204))));
        let dispatcher = HookDispatcher::new(transport.clone());

        let outcome = dispatcher.dispatch(Some(&hook(Some("hook-secret"))), &payload(), &Cancellation::never());
        assert_eq!(outcome, DeliveryOutcome::Delivered { status: 204 });
        assert_eq!(outcome.status(), Some(DeliveryStatus::Ok));

        let request = &transport.requests()[0];
        assert_eq!(request.method, http::Method::POST);
        assert_eq!(request.header("authorization"), Some("Bearer hook-secret"));
        assert_eq!(request.header("content-type"), Some("application/json"));
        let body = request.json().unwrap();
        assert_eq!(body["source"], "gmail");
        assert_eq!(body["historyId"], "200");
    }

    #[test]
    fn test_non_2xx_is_single_attempt_failure() {
        let transport = Arc::new(MockTransport::new(|_| {
            Ok(MockResponse {
                status: 500,
                headers: Vec::new(),
                body: "x".repeat(1000).into_bytes(),
            })
        }));
        let dispatcher = HookDispatcher::new(transport.clone());

        let outcome = dispatcher.dispatch(Some(&hook(None)), &payload(), &Cancellation::never());
        let note = outcome.note().unwrap();
        assert!(note.starts_with("hook returned 500"));
        assert!(note.len() <= NOTE_MAX_BYTES);
        assert_eq!(outcome.status(), Some(DeliveryStatus::Error));
        assert_eq!(transport.calls(), 1);
        assert!(transport.requests()[0].header("authorization").is_none());
    }

    #[test]
    fn test_transport_error_is_failure() {
        let transport = Arc::new(MockTransport::new(|_| {
            Err(TransportError::Interrupted(Interrupt::DeadlineExceeded))
        }));
        let outcome = HookDispatcher::new(transport).dispatch(
            Some(&hook(None)),
            &payload(),
            &Cancellation::never(),
        );
        assert!(matches!(outcome, DeliveryOutcome::Failed { note } if note.contains("deadline")));
    }

    #[test]
    fn test_build_payload_maps_labels_and_resync() {
        let delta = Delta {
            messages: vec![GmailMessage {
                id: "m1".into(),
                thread_id: "t1".into(),
                label_ids: Some(vec!["INBOX".into(), "Label_9".into()]),
                ..Default::default()
            }],
            history_id: 321,
            resync: true,
            label_names: HashMap::from([("INBOX".to_string(), "Inbox".to_string())]),
        };

        let payload = build_payload("user@gmail.com", &delta, None);
        assert!(payload.resync);
        assert_eq!(payload.history_id, "321");
        assert_eq!(payload.messages[0].labels, vec!["Inbox", "Label_9"]);
    }
}
