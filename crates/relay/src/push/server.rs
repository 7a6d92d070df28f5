//! Push endpoint
//!
//! [`PushServer::handle`] is the synchronous request state machine:
//! authenticate, decode, reconcile, dispatch, persist, respond. The axum
//! router runs it on a blocking worker with a [`Cancellation`] that fires
//! when the client goes away or the request deadline passes.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use super::auth::PushAuthenticator;
use super::dispatch::{DeliveryOutcome, HookDispatcher, build_payload};
use super::reconcile::{HistoryReconciler, ReconcileOptions, Reconciliation};
use crate::config::ServeSettings;
use crate::gmail::MailService;
use crate::models::decode_push;
use crate::storage::{StartCursor, StoreError, WatchStateStore};
use crate::transport::Cancellation;

/// One inbound push, detached from the HTTP framework
#[derive(Debug, Clone, Default)]
pub struct PushRequest {
    pub headers: HeaderMap,
    /// `token` query parameter
    pub query_token: Option<String>,
    /// Request path, used to rebuild the public URL
    pub path: String,
    pub body: Vec<u8>,
}

/// Status plus a small JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct PushResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl PushResponse {
    fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    fn error(status: StatusCode, message: impl std::fmt::Display) -> Self {
        Self::new(status, json!({ "error": message.to_string() }))
    }

    fn accepted(reason: &str) -> Self {
        Self::new(StatusCode::ACCEPTED, json!({ "status": reason }))
    }
}

impl IntoResponse for PushResponse {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.body)).into_response()
    }
}

/// Handles Gmail pushes for one watched account
pub struct PushServer {
    account: String,
    store: Arc<WatchStateStore>,
    auth: PushAuthenticator,
    reconciler: HistoryReconciler<Arc<dyn MailService>>,
    dispatcher: HookDispatcher,
    settings: ServeSettings,
}

impl PushServer {
    pub fn new(
        store: Arc<WatchStateStore>,
        mail: Arc<dyn MailService>,
        auth: PushAuthenticator,
        dispatcher: HookDispatcher,
        settings: ServeSettings,
    ) -> Self {
        Self {
            account: store.get().account,
            store,
            auth,
            reconciler: HistoryReconciler::new(mail),
            dispatcher,
            settings,
        }
    }

    pub fn with_reconcile_options(mut self, options: ReconcileOptions) -> Self {
        self.reconciler = self.reconciler.with_options(options);
        self
    }

    pub fn settings(&self) -> &ServeSettings {
        &self.settings
    }

    /// Handle one push
    pub fn handle(&self, request: &PushRequest, cancel: &Cancellation) -> PushResponse {
        if request.body.len() > self.settings.max_body_bytes {
            return PushResponse::error(StatusCode::PAYLOAD_TOO_LARGE, "push body too large");
        }

        if let Err(e) = self.auth.authorize(
            &request.headers,
            request.query_token.as_deref(),
            &request.path,
            cancel,
        ) {
            warn!("Rejected push: {e}");
            return PushResponse::error(StatusCode::UNAUTHORIZED, "unauthorized");
        }

        let push = match decode_push(&request.body) {
            Ok(push) => push,
            Err(e) => {
                warn!("Malformed push: {e}");
                return PushResponse::error(StatusCode::BAD_REQUEST, e);
            }
        };
        debug!(
            "Push {:?} for {} at historyId {}",
            push.message_id(),
            push.payload.email_address,
            push.payload.history_id
        );

        let email = push.payload.email_address.trim();
        if !email.is_empty() && !email.eq_ignore_ascii_case(&self.account) {
            info!("Ignoring push for {email}; watching {}", self.account);
            return PushResponse::accepted("ignored");
        }

        let old_cursor = match self.store.start_history_id(&push.payload.history_id) {
            Ok(StartCursor::Baseline(_)) => return PushResponse::accepted("baseline"),
            Ok(StartCursor::Resume(cursor)) => cursor,
            Err(e @ StoreError::InvalidHistoryId { .. }) if self.store.get().needs_baseline() => {
                warn!("Cannot adopt push cursor: {e}");
                return PushResponse::error(StatusCode::BAD_REQUEST, e);
            }
            Err(e) => {
                error!("Failed to read watch cursor: {e}");
                return PushResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e);
            }
        };

        let hook = self.store.get().hook;
        let include_body = hook.as_ref().is_some_and(|h| h.include_body);
        let delta = match self
            .reconciler
            .reconcile(old_cursor, &push.payload.history_id, include_body, cancel)
        {
            Ok(Reconciliation::NoNewMessages) => return PushResponse::accepted("duplicate"),
            Ok(Reconciliation::Changes(delta)) => delta,
            Err(e) => {
                error!("Reconciliation from {old_cursor} failed: {e}");
                return PushResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e);
            }
        };

        let payload = build_payload(&self.account, &delta, hook.as_ref());
        let outcome = self.dispatcher.dispatch(hook.as_ref(), &payload, cancel);

        let message_id = push.message_id().map(String::from);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let cursor = self.store.update(|state| {
            state.advance_history(delta.history_id);
            if let Some(status) = outcome.status() {
                state.record_delivery(status, outcome.note(), now_ms);
            }
            if message_id.is_some() {
                state.last_push_message_id = message_id;
            }
            state.history_id.clone()
        });
        let cursor = match cursor {
            Ok(cursor) => cursor,
            Err(e) => {
                error!("Failed to persist watch state: {e}");
                return PushResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e);
            }
        };

        let delivery = match &outcome {
            DeliveryOutcome::Skipped => "skipped",
            DeliveryOutcome::Delivered { .. } => "ok",
            DeliveryOutcome::Failed { .. } => "error",
        };
        info!(
            "Handled push for {}: {} message(s), cursor {}, hook {}",
            self.account,
            payload.messages.len(),
            cursor,
            delivery
        );
        PushResponse::new(
            StatusCode::OK,
            json!({
                "status": "ok",
                "historyId": cursor,
                "messages": payload.messages.len(),
                "resync": delta.resync,
                "delivery": delivery,
            }),
        )
    }

    /// Router serving `POST <path>`
    pub fn router(self: Arc<Self>) -> Router {
        let path = self.settings.path.clone();
        let limit = self.settings.max_body_bytes;
        Router::new()
            .route(&path, post(handle_push))
            .layer(DefaultBodyLimit::max(limit))
            .with_state(self)
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no address")?;
        info!("Push server listening on http://{}{}", addr, self.settings.path);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Push server shutting down...");
            })
            .await
            .context("Push server failed")
    }
}

#[derive(Debug, Deserialize)]
struct PushQuery {
    token: Option<String>,
}

async fn handle_push(
    State(server): State<Arc<PushServer>>,
    Query(query): Query<PushQuery>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Dropping this future (client disconnect) drops the guard and cancels
    let (guard, cancel) = Cancellation::new();
    let cancel = cancel.with_timeout(server.settings.request_timeout);
    let request = PushRequest {
        headers,
        query_token: query.token,
        path: uri.path().to_string(),
        body: body.to_vec(),
    };

    let worker = Arc::clone(&server);
    let result = tokio::task::spawn_blocking(move || worker.handle(&request, &cancel)).await;
    drop(guard);

    match result {
        Ok(response) => response.into_response(),
        Err(e) => {
            error!("Push handler failed: {e}");
            PushResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}
