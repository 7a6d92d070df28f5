//! Integration tests for the relay crate
//!
//! These tests drive the push endpoint end to end: a scripted Gmail API
//! behind the retry transport, a real watch state file, and a scripted hook.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::prelude::*;
use http::StatusCode;
use proptest::prelude::*;
use relay::config::ServeSettings;
use relay::gmail::{GmailClient, StaticToken};
use relay::models::{DeliveryStatus, HookConfig, WatchState};
use relay::push::{HookDispatcher, PushAuthConfig, PushAuthenticator, PushRequest, PushServer};
use relay::storage::WatchStateStore;
use relay::transport::{
    Cancellation, CircuitBreaker, CircuitState, MockResponse, MockTransport, RecordedRequest,
    RetryPolicy, RetryTransport, TransportError, UreqTransport,
};
use serde_json::json;
use tempfile::TempDir;

const ACCOUNT: &str = "user@gmail.com";

type Handler = Box<dyn Fn(&RecordedRequest) -> Result<MockResponse, TransportError> + Send + Sync>;

/// Gmail API double: history reports `m1` and the cursor in `latest`
fn gmail_api(latest: Arc<AtomicU64>) -> Handler {
    Box::new(move |request| {
        let path = request.path();
        let response = if path.ends_with("/history") {
            MockResponse::json(
                200,
                &json!({
                    "history": [{"id": "150", "messagesAdded": [{"message": {"id": "m1", "threadId": "t1"}}]}],
                    "historyId": latest.load(Ordering::SeqCst).to_string(),
                }),
            )
        } else if path.ends_with("/messages") {
            MockResponse::json(200, &json!({"messages": [{"id": "r2"}, {"id": "r1"}]}))
        } else if let Some(id) = path.rsplit('/').next().filter(|_| path.contains("/messages/")) {
            MockResponse::json(200, &message_json(id))
        } else if path.ends_with("/labels") {
            MockResponse::json(
                200,
                &json!({"labels": [{"id": "INBOX", "name": "INBOX"}, {"id": "Label_1", "name": "Receipts"}]}),
            )
        } else {
            MockResponse::status(404)
        };
        Ok(response)
    })
}

fn message_json(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "threadId": format!("t-{id}"),
        "labelIds": ["INBOX", "Label_1"],
        "snippet": "Lunch at noon?",
        "internalDate": "1704103200000",
        "payload": {
            "mimeType": "text/plain",
            "headers": [
                {"name": "From", "value": "Alice <alice@example.com>"},
                {"name": "To", "value": ACCOUNT},
                {"name": "Subject", "value": "Lunch"},
                {"name": "Date", "value": "Mon, 1 Jan 2024 10:00:00 +0000"}
            ],
            "body": {"data": BASE64_URL_SAFE_NO_PAD.encode("Noon at the usual place. Don't be late!")}
        }
    })
}

struct Harness {
    _dir: TempDir,
    dir_path: std::path::PathBuf,
    store: Arc<WatchStateStore>,
    gmail: Arc<MockTransport>,
    hooks: Arc<MockTransport>,
    breaker: Arc<CircuitBreaker>,
    server: Arc<PushServer>,
}

fn harness(cursor: &str, hook: Option<HookConfig>, gmail: Handler, hook_status: u16) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut state = WatchState::new(ACCOUNT, "projects/p/topics/gmail", vec!["INBOX".to_string()]);
    state.history_id = cursor.to_string();
    state.hook = hook;
    let store = Arc::new(WatchStateStore::create(dir.path(), state).unwrap());

    let gmail = Arc::new(MockTransport::new(gmail));
    let breaker = Arc::new(CircuitBreaker::new());
    let retrying = RetryTransport::new(gmail.clone(), breaker.clone()).with_policy(RetryPolicy {
        max_retries_429: 3,
        max_retries_5xx: 1,
        base_delay: Duration::from_millis(1),
    });
    let client = GmailClient::new(Arc::new(retrying), Arc::new(StaticToken::new("access")))
        .with_base_url("https://gmail.test/gmail/v1");

    let hooks = Arc::new(MockTransport::new(move |_| Ok(MockResponse::status(hook_status))));
    let server = PushServer::new(
        store.clone(),
        Arc::new(client),
        PushAuthenticator::new(PushAuthConfig::default(), None),
        HookDispatcher::new(hooks.clone()),
        ServeSettings::default(),
    );

    Harness {
        dir_path: dir.path().to_path_buf(),
        _dir: dir,
        store,
        gmail,
        hooks,
        breaker,
        server: Arc::new(server),
    }
}

fn push_body(history_id: u64) -> Vec<u8> {
    let data = BASE64_STANDARD.encode(
        json!({"emailAddress": ACCOUNT, "historyId": history_id}).to_string(),
    );
    serde_json::to_vec(&json!({
        "message": {"data": data, "messageId": format!("pubsub-{history_id}"), "publishTime": "2024-01-01T10:00:00Z"},
        "subscription": "projects/p/subscriptions/gmail-push"
    }))
    .unwrap()
}

fn push(harness: &Harness, history_id: u64) -> relay::PushResponse {
    let request = PushRequest {
        path: "/gmail-pubsub".into(),
        body: push_body(history_id),
        ..Default::default()
    };
    harness.server.handle(&request, &Cancellation::never())
}

#[test]
fn test_end_to_end_without_hook() {
    let h = harness("100", None, gmail_api(Arc::new(AtomicU64::new(200))), 200);

    let response = push(&h, 200);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["historyId"], "200");
    assert_eq!(response.body["messages"], 1);
    assert_eq!(response.body["delivery"], "skipped");

    let state = h.store.get();
    assert_eq!(state.history_id, "200");
    assert!(state.last_delivery_status.is_none());
    assert_eq!(state.last_push_message_id.as_deref(), Some("pubsub-200"));
    assert_eq!(h.hooks.calls(), 0);

    // The record on disk matches
    let reloaded = WatchStateStore::load(&h.dir_path, ACCOUNT).unwrap();
    assert_eq!(reloaded.get().history_id, "200");

    let history = &h.gmail.requests()[0];
    assert_eq!(history.query_param("startHistoryId").as_deref(), Some("100"));
    assert_eq!(history.header("authorization"), Some("Bearer access"));
}

#[test]
fn test_end_to_end_with_failing_hook() {
    let hook = HookConfig::new("https://hooks.example.com/gmail");
    let h = harness("100", Some(hook), gmail_api(Arc::new(AtomicU64::new(200))), 500);

    let response = push(&h, 200);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["delivery"], "error");

    let state = h.store.get();
    assert_eq!(state.history_id, "200");
    assert_eq!(state.last_delivery_status, Some(DeliveryStatus::Error));
    assert!(state.last_delivery_at_ms.is_some());
    assert!(
        state
            .last_delivery_status_note
            .as_deref()
            .is_some_and(|note| note.contains("500"))
    );
    assert_eq!(h.hooks.calls(), 1);
}

#[test]
fn test_hook_receives_normalized_messages() {
    let mut hook = HookConfig::new("https://hooks.example.com/gmail");
    hook.token = Some("hook-token".into());
    hook.include_body = true;
    hook.max_bytes = 4;
    let h = harness("100", Some(hook), gmail_api(Arc::new(AtomicU64::new(200))), 202);

    let response = push(&h, 200);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(h.store.get().last_delivery_status, Some(DeliveryStatus::Ok));

    let delivered = &h.hooks.requests()[0];
    assert_eq!(delivered.header("authorization"), Some("Bearer hook-token"));
    let body = delivered.json().unwrap();
    assert_eq!(body["source"], "gmail");
    assert_eq!(body["account"], ACCOUNT);
    assert_eq!(body["historyId"], "200");
    assert!(body.get("resync").is_none());

    let message = &body["messages"][0];
    assert_eq!(message["id"], "m1");
    assert_eq!(message["subject"], "Lunch");
    assert_eq!(message["labels"], json!(["INBOX", "Receipts"]));
    assert_eq!(message["body"], "Noon");
    assert_eq!(message["bodyTruncated"], true);

    // Body requested means full format
    let fetch = h
        .gmail
        .requests()
        .into_iter()
        .find(|r| r.path().ends_with("/messages/m1"))
        .unwrap();
    assert_eq!(fetch.query_param("format").as_deref(), Some("full"));
}

#[test]
fn test_duplicate_push_has_no_side_effects() {
    let hook = HookConfig::new("https://hooks.example.com/gmail");
    let h = harness("100", Some(hook), gmail_api(Arc::new(AtomicU64::new(200))), 200);

    assert_eq!(push(&h, 200).status, StatusCode::OK);
    let before = h.store.get();
    let gmail_calls = h.gmail.calls();

    for stale in [200, 150] {
        let response = push(&h, stale);
        assert_eq!(response.status, StatusCode::ACCEPTED);
    }

    assert_eq!(h.store.get(), before);
    assert_eq!(h.gmail.calls(), gmail_calls);
    assert_eq!(h.hooks.calls(), 1);
}

#[test]
fn test_first_push_sets_baseline() {
    let h = harness("", None, gmail_api(Arc::new(AtomicU64::new(0))), 200);

    let response = push(&h, 4242);
    assert_eq!(response.status, StatusCode::ACCEPTED);
    assert_eq!(h.store.get().history_id, "4242");
    assert_eq!(h.gmail.calls(), 0);
}

#[test]
fn test_expired_cursor_resyncs_recent_messages() {
    let gmail: Handler = Box::new(|request| {
        let path = request.path();
        if path.ends_with("/history") {
            return Ok(MockResponse::json(
                404,
                &json!({"error": {"code": 404, "message": "Requested entity was not found.", "errors": [{"reason": "notFound"}]}}),
            ));
        }
        gmail_api(Arc::new(AtomicU64::new(0)))(request)
    });
    let hook = HookConfig::new("https://hooks.example.com/gmail");
    let h = harness("5", Some(hook), gmail, 200);

    let response = push(&h, 900);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["resync"], true);
    assert_eq!(h.store.get().history_id, "900");

    let body = h.hooks.requests()[0].json().unwrap();
    assert_eq!(body["resync"], true);
    let ids: Vec<_> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, ["r2", "r1"]);

    let list = h
        .gmail
        .requests()
        .into_iter()
        .find(|r| r.path().ends_with("/messages"))
        .unwrap();
    assert_eq!(list.query_param("maxResults").as_deref(), Some("25"));
}

#[test]
fn test_upstream_outage_opens_circuit() {
    let gmail: Handler = Box::new(|_| {
        Ok(MockResponse::json(503, &json!({"error": {"code": 503, "message": "Backend Error"}})))
    });
    let h = harness("100", None, gmail, 200);

    for _ in 0..4 {
        let response = push(&h, 200);
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    // Two attempts per push until the fifth failure trips the breaker
    assert_eq!(h.gmail.calls(), 5);
    assert_eq!(h.breaker.state(), CircuitState::Open);
    assert_eq!(h.store.get().history_id, "100");
}

#[test]
fn test_rate_limit_is_retried_transparently() {
    let latest = Arc::new(AtomicU64::new(200));
    let seen = Arc::new(AtomicU64::new(0));
    let inner = gmail_api(latest);
    let gmail: Handler = Box::new(move |request| {
        if request.path().ends_with("/history") && seen.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(MockResponse::status(429).with_header("retry-after", "0"));
        }
        inner(request)
    });
    let h = harness("100", None, gmail, 200);

    assert_eq!(push(&h, 200).status, StatusCode::OK);
    assert_eq!(h.gmail.calls_to("/history"), 2);
    assert_eq!(h.breaker.state(), CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_endpoint() {
    let h = harness("100", None, gmail_api(Arc::new(AtomicU64::new(200))), 200);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(h.server.clone().serve(listener, async move {
        let _ = stopped.await;
    }));

    let url = format!("http://{addr}/gmail-pubsub");
    let statuses = tokio::task::spawn_blocking(move || {
        let transport = UreqTransport::default();
        let send = |body: Vec<u8>| {
            let request = http::Request::post(url.as_str())
                .header("content-type", "application/json")
                .body(relay::transport::RequestBody::Bytes(body))
                .unwrap();
            use relay::transport::Transport;
            transport.round_trip(request).unwrap().status()
        };
        (
            send(push_body(200)),
            send(push_body(200)),
            send(b"{\"message\":{}}".to_vec()),
        )
    })
    .await
    .unwrap();

    assert_eq!(statuses.0, StatusCode::OK);
    assert_eq!(statuses.1, StatusCode::ACCEPTED);
    assert_eq!(statuses.2, StatusCode::BAD_REQUEST);
    assert_eq!(h.store.get().history_id, "200");

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_cursor_never_moves_backwards(hints in proptest::collection::vec(1u64..1_000, 1..8)) {
        let latest = Arc::new(AtomicU64::new(0));
        let h = harness("1", None, gmail_api(latest.clone()), 200);
        let mut expected = 1u64;

        for hint in hints {
            latest.store(hint, Ordering::SeqCst);
            let response = push(&h, hint);
            if hint > expected {
                prop_assert_eq!(response.status, StatusCode::OK);
                expected = hint;
            } else {
                prop_assert_eq!(response.status, StatusCode::ACCEPTED);
            }
            prop_assert_eq!(h.store.get().history_cursor(), Some(expected));
        }
    }
}
