//! Pub/Sub push envelope and the Gmail notification inside it

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

use crate::gmail::decode_base64;

/// Why a push body was rejected
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid push envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("push message has no data")]
    MissingData,
    #[error("push data is not valid base64")]
    InvalidBase64,
    #[error("invalid gmail notification: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("gmail notification has no historyId")]
    MissingHistoryId,
}

/// Push delivery as posted by Pub/Sub
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(default, alias = "publish_time")]
    pub publish_time: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Gmail's notification: which mailbox changed and its current historyId
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    #[serde(default)]
    pub email_address: String,
    /// Decimal string; Gmail sends a JSON number
    #[serde(default, deserialize_with = "string_or_number")]
    pub history_id: String,
}

/// A decoded push: the envelope plus its payload
#[derive(Debug, Clone)]
pub struct Push {
    pub envelope: PushEnvelope,
    pub payload: PushPayload,
}

impl Push {
    pub fn message_id(&self) -> Option<&str> {
        self.envelope.message.message_id.as_deref()
    }
}

/// Decode a raw push request body
pub fn decode_push(body: &[u8]) -> Result<Push, DecodeError> {
    let envelope: PushEnvelope = serde_json::from_slice(body).map_err(DecodeError::Envelope)?;

    let data = envelope
        .message
        .data
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or(DecodeError::MissingData)?;
    let raw = decode_base64(data).ok_or(DecodeError::InvalidBase64)?;

    let payload: PushPayload = serde_json::from_slice(&raw).map_err(DecodeError::Payload)?;
    if payload.history_id.trim().is_empty() {
        return Err(DecodeError::MissingHistoryId);
    }

    Ok(Push { envelope, payload })
}

/// Accept a JSON string or unsigned number as a decimal string
pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
        Null(()),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
        Raw::Null(()) => String::new(),
    })
}
