//! Domain models for the push relay

mod hook;
mod push;
mod watch_state;

pub use hook::{HOOK_SOURCE, HookMessage, HookPayload};
pub(crate) use push::string_or_number;
pub use push::{DecodeError, Push, PushEnvelope, PushMessage, PushPayload, decode_push};
pub use watch_state::{
    DEFAULT_HOOK_MAX_BYTES, DeliveryStatus, HookConfig, WatchState, parse_history_id,
};
