//! Push relay
//!
//! This module provides:
//! - Push request authentication (shared token, Google OIDC)
//! - History reconciliation from the stored cursor
//! - Hook delivery
//! - The HTTP endpoint tying them together

pub mod auth;
pub mod dispatch;
mod reconcile;
mod server;

pub use auth::{
    AuthError, GoogleOidcVerifier, PushAuthConfig, PushAuthenticator, PushClaims, TokenVerifier,
    public_url,
};
pub use dispatch::{DeliveryError, DeliveryOutcome, HookDispatcher, NOTE_MAX_BYTES, build_payload};
pub use reconcile::{
    DEFAULT_MAX_HISTORY_PAGES, Delta, HistoryReconciler, RESYNC_MAX_MESSAGES, ReconcileOptions,
    Reconciliation,
};
pub use server::{PushRequest, PushResponse, PushServer};
