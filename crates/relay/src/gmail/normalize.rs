//! Gmail API response normalization
//!
//! Converts Gmail API messages to the message shape forwarded to hooks.

use std::collections::HashMap;

use base64::prelude::*;
use chrono::{TimeZone, Utc};

use super::api::{GmailMessage, MessagePart, MessagePayload};
use crate::models::{HookConfig, HookMessage};

/// Reduce a Gmail message to a hook message
///
/// `label_names` maps label ids to display names; unknown ids are passed
/// through. The body is only extracted when the hook asks for it and is
/// truncated to the hook's byte budget.
pub fn hook_message(
    message: &GmailMessage,
    label_names: &HashMap<String, String>,
    hook: Option<&HookConfig>,
) -> HookMessage {
    let payload = message.payload.as_ref();
    let header = |name: &str| {
        payload
            .and_then(|p| extract_header(p, name))
            .unwrap_or_default()
    };

    let date = payload
        .and_then(|p| extract_header(p, "Date"))
        .or_else(|| format_internal_date(&message.internal_date))
        .unwrap_or_default();

    let labels = message
        .label_ids
        .iter()
        .flatten()
        .map(|id| label_names.get(id).cloned().unwrap_or_else(|| id.clone()))
        .collect();

    let mut out = HookMessage {
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        from: header("From"),
        to: header("To"),
        subject: header("Subject"),
        date,
        snippet: decode_html_entities(&message.snippet),
        body: None,
        body_truncated: false,
        labels,
    };

    if let Some(hook) = hook.filter(|h| h.include_body) {
        let text = payload.and_then(extract_plain_text_body).unwrap_or_default();
        let (body, truncated) = truncate_utf8(&text, hook.effective_max_bytes());
        out.body = Some(body.to_string());
        out.body_truncated = truncated;
    }

    out
}

fn format_internal_date(internal_date: &str) -> Option<String> {
    let millis: i64 = internal_date.parse().ok()?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc2822())
}

/// Cut `s` to at most `max_bytes` bytes on a char boundary
///
/// Returns the kept prefix and whether anything was removed.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> (&str, bool) {
    if s.len() <= max_bytes {
        return (s, false);
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    (&s[..end], true)
}

/// Extract a header value by name
pub fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

/// Extract plain text body from message payload
pub fn extract_plain_text_body(payload: &MessagePayload) -> Option<String> {
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && payload
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with("text/plain"))
    {
        return decode_base64_body(data);
    }

    if let Some(parts) = &payload.parts
        && let Some(text) = find_plain_text_in_parts(parts)
    {
        return Some(text);
    }

    // Fall back to any text content
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
    {
        return decode_base64_body(data);
    }

    None
}

/// Recursively search message parts for text/plain content
fn find_plain_text_in_parts(parts: &[MessagePart]) -> Option<String> {
    for part in parts {
        if part
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with("text/plain"))
            && let Some(body) = &part.body
            && let Some(data) = &body.data
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        if let Some(nested) = &part.parts
            && let Some(text) = find_plain_text_in_parts(nested)
        {
            return Some(text);
        }
    }

    None
}

/// Decode base64 data from Gmail or Pub/Sub
///
/// Gmail uses URL-safe base64, Pub/Sub uses standard base64, and padding
/// varies, so several decoders are tried.
pub(crate) fn decode_base64(data: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders.iter().find_map(|decoder| decoder.decode(data).ok())
}

fn decode_base64_body(data: &str) -> Option<String> {
    decode_base64(data).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Decode HTML entities in snippet text
fn decode_html_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}
