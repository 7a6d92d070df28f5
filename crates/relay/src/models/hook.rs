//! Payload forwarded to the downstream hook

use serde::Serialize;

/// Source tag for every payload
pub const HOOK_SOURCE: &str = "gmail";

fn is_false(value: &bool) -> bool {
    !*value
}

/// One notification sent to the hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookPayload {
    pub source: String,
    pub account: String,
    pub history_id: String,
    /// Set when messages come from a recent-message listing instead of a history diff
    #[serde(skip_serializing_if = "is_false")]
    pub resync: bool,
    pub messages: Vec<HookMessage>,
}

impl HookPayload {
    pub fn new(account: impl Into<String>, history_id: u64, messages: Vec<HookMessage>) -> Self {
        Self {
            source: HOOK_SOURCE.to_string(),
            account: account.into(),
            history_id: history_id.to_string(),
            resync: false,
            messages,
        }
    }
}

/// A new message, reduced to the fields hooks care about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookMessage {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub body_truncated: bool,
    /// Label names (ids when the name is unknown)
    pub labels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json_shape() {
        let message = HookMessage {
            id: "m1".into(),
            thread_id: "t1".into(),
            subject: "Hi".into(),
            labels: vec!["Inbox".into()],
            ..Default::default()
        };
        let payload = HookPayload::new("user@gmail.com", 200, vec![message]);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["source"], "gmail");
        assert_eq!(json["historyId"], "200");
        assert!(json.get("resync").is_none());
        assert_eq!(json["messages"][0]["threadId"], "t1");
        assert!(json["messages"][0].get("body").is_none());
        assert!(json["messages"][0].get("bodyTruncated").is_none());
    }

    #[test]
    fn test_resync_flag_serialized_when_set() {
        let mut payload = HookPayload::new("user@gmail.com", 1, Vec::new());
        payload.resync = true;
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["resync"], true);
    }
}
