//! Relay crate - Gmail push notifications to webhooks
//!
//! This crate provides the push relay behind `relayd`:
//! - Domain models (watch state, push envelope, hook payload)
//! - Gmail API client and token refresh over a pluggable transport
//! - A retrying transport guarded by a circuit breaker
//! - Persistent watch state and secret storage
//! - The push endpoint: authenticate, reconcile history, deliver to a hook
//!
//! All upstream I/O is synchronous (ureq); only the inbound server runs on
//! tokio, handing each push to a blocking worker.

pub mod config;
pub mod error;
pub mod gmail;
pub mod models;
pub mod push;
pub mod storage;
pub mod transport;

pub use config::{GmailCredentials, ServeOptions, ServeSettings, UsageError};
pub use error::{ApiError, ErrorKind, classify};
pub use gmail::{GmailClient, GmailError, MailService, StoredTokenSource, TokenSource};
pub use models::{DeliveryStatus, HookConfig, HookPayload, WatchState, decode_push};
pub use push::{
    GoogleOidcVerifier, HistoryReconciler, HookDispatcher, PushAuthConfig, PushAuthenticator,
    PushRequest, PushResponse, PushServer, Reconciliation,
};
pub use storage::{FileSecretStore, SecretStore, StoreError, WatchStateStore};
pub use transport::{
    Cancellation, CircuitBreaker, RetryPolicy, RetryTransport, Transport, TransportError,
    UreqTransport,
};
