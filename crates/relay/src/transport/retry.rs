//! Retrying transport decorator
//!
//! Retries 429 and 5xx responses with backoff, honoring `Retry-After`, and
//! consults the shared [`CircuitBreaker`] before every attempt. Transport
//! errors are never retried here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode};
use log::{debug, warn};

use super::{
    CircuitBreaker, HttpRequest, HttpResponse, RequestBody, Transport, TransportError,
    request_cancellation,
};

/// Retry limits and backoff base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after a 429 before the response is returned as-is
    pub max_retries_429: u32,
    /// Retries after a 5xx before the response is returned as-is
    pub max_retries_5xx: u32,
    /// First backoff step; doubles per attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries_429: 3,
            max_retries_5xx: 1,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Transport decorator applying [`RetryPolicy`] behind a circuit breaker
pub struct RetryTransport<T> {
    inner: T,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl<T: Transport> RetryTransport<T> {
    pub fn new(inner: T, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            policy: RetryPolicy::default(),
            breaker,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl<T: Transport> Transport for RetryTransport<T> {
    fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let cancel = request_cancellation(&request);
        let (parts, body) = request.into_parts();
        let body = body.into_bytes()?;

        let mut retries_429 = 0;
        let mut retries_5xx = 0;

        loop {
            if self.breaker.is_open() {
                warn!("Circuit open, refusing {} {}", parts.method, parts.uri);
                return Err(TransportError::CircuitOpen);
            }

            let response = self.inner.round_trip(replay(&parts, &body))?;
            let status = response.status();

            let delay = if status == StatusCode::TOO_MANY_REQUESTS {
                if retries_429 >= self.policy.max_retries_429 {
                    return Ok(response);
                }
                let delay = backoff_delay(response.headers(), retries_429, self.policy.base_delay);
                retries_429 += 1;
                delay
            } else if status.is_server_error() {
                if self.breaker.record_failure() {
                    warn!("Circuit opened after repeated upstream failures");
                }
                if retries_5xx >= self.policy.max_retries_5xx {
                    return Ok(response);
                }
                let delay = backoff_delay(response.headers(), retries_5xx, self.policy.base_delay);
                retries_5xx += 1;
                delay
            } else {
                self.breaker.record_success();
                return Ok(response);
            };

            debug!(
                "{} {} returned {}, retrying in {:?}",
                parts.method, parts.uri, status, delay
            );
            if let Err(e) = response.into_body().drain() {
                debug!("Failed to drain discarded response body: {}", e);
            }

            cancel.sleep(delay)?;
        }
    }
}

/// Rebuild an attempt from the buffered request
fn replay(parts: &http::request::Parts, body: &[u8]) -> HttpRequest {
    let body = if body.is_empty() {
        RequestBody::Empty
    } else {
        RequestBody::Bytes(body.to_vec())
    };

    let mut request = http::Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    *request.extensions_mut() = parts.extensions.clone();
    request
}

/// Delay before the next attempt
///
/// `Retry-After` wins when present and parseable; otherwise exponential
/// backoff from `base` with a small jitter.
pub(crate) fn backoff_delay(headers: &HeaderMap, attempt: u32, base: Duration) -> Duration {
    if let Some(delay) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
    {
        return delay;
    }

    let step = base.saturating_mul(2u32.saturating_pow(attempt));
    step + jitter(step / 2)
}

/// Parse `Retry-After` as delta-seconds or an HTTP-date
///
/// Dates in the past and negative values collapse to zero.
pub(crate) fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return Some(Duration::from_secs(seconds.max(0).unsigned_abs()));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        (at.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

/// Random duration in `[0, max)`
fn jitter(max: Duration) -> Duration {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let max_nanos = max.as_nanos() as u64;
    if max_nanos == 0 {
        return Duration::ZERO;
    }
    let hasher = RandomState::new().build_hasher();
    Duration::from_nanos(hasher.finish() % max_nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Cancellation, FAILURE_THRESHOLD, Interrupt, ResponseBody};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Scripted base transport that records every request body it sees
    struct Scripted {
        responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        bodies: Mutex<Vec<Vec<u8>>>,
    }

    impl Scripted {
        fn new(statuses: &[u16]) -> Self {
            let responses = statuses.iter().map(|&s| Ok(respond(s, &[]))).collect();
            Self {
                responses: Mutex::new(responses),
                bodies: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, response: Result<HttpResponse, TransportError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn calls(&self) -> usize {
            self.bodies.lock().unwrap().len()
        }
    }

    impl Transport for Scripted {
        fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let body = request.into_body().into_bytes().unwrap();
            self.bodies.lock().unwrap().push(body);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(respond(200, &[])))
        }
    }

    fn respond(status: u16, headers: &[(&str, &str)]) -> HttpResponse {
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(ResponseBody::from_bytes(b"body".to_vec())).unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries_429: 3,
            max_retries_5xx: 1,
            base_delay: Duration::from_millis(1),
        }
    }

    fn post(body: RequestBody) -> HttpRequest {
        http::Request::post("https://example.test/upload")
            .body(body)
            .unwrap()
    }

    #[test]
    fn test_retries_429_then_succeeds_with_identical_body() {
        let base = Arc::new(Scripted::new(&[429, 429]));
        let transport =
            RetryTransport::new(base.clone(), Arc::new(CircuitBreaker::new())).with_policy(fast_policy());

        // A one-shot reader body must still be resent byte-for-byte
        let reader = io::Cursor::new(b"payload-bytes".to_vec());
        let response = transport
            .round_trip(post(RequestBody::Reader(Box::new(reader))))
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(base.calls(), 3);
        let bodies = base.bodies.lock().unwrap();
        assert!(bodies.iter().all(|b| b == b"payload-bytes"));
    }

    #[test]
    fn test_429_exhaustion_returns_last_response() {
        let base = Arc::new(Scripted::new(&[429, 429, 429, 429, 429]));
        let transport =
            RetryTransport::new(base.clone(), Arc::new(CircuitBreaker::new())).with_policy(fast_policy());

        let response = transport.round_trip(post(RequestBody::Empty)).unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(base.calls(), 4);
    }

    #[test]
    fn test_5xx_exhaustion_records_failures() {
        let base = Arc::new(Scripted::new(&[503, 502]));
        let breaker = Arc::new(CircuitBreaker::new());
        let transport = RetryTransport::new(base.clone(), breaker.clone()).with_policy(fast_policy());

        let response = transport.round_trip(post(RequestBody::Empty)).unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(base.calls(), 2);
        assert_eq!(breaker.failures(), 2);
    }

    #[test]
    fn test_success_resets_breaker() {
        let base = Arc::new(Scripted::new(&[500]));
        let breaker = Arc::new(CircuitBreaker::new());
        let transport = RetryTransport::new(base, breaker.clone()).with_policy(fast_policy());

        let response = transport.round_trip(post(RequestBody::Empty)).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn test_client_errors_not_retried() {
        let base = Arc::new(Scripted::new(&[404]));
        let transport =
            RetryTransport::new(base.clone(), Arc::new(CircuitBreaker::new())).with_policy(fast_policy());

        let response = transport.round_trip(post(RequestBody::Empty)).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(base.calls(), 1);
    }

    #[test]
    fn test_transport_error_not_retried() {
        let base = Arc::new(Scripted::new(&[]));
        base.push(Err(TransportError::Io(io::Error::other("connection reset"))));
        let transport =
            RetryTransport::new(base.clone(), Arc::new(CircuitBreaker::new())).with_policy(fast_policy());

        let err = transport.round_trip(post(RequestBody::Empty)).unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert_eq!(base.calls(), 1);
    }

    #[test]
    fn test_open_circuit_fails_fast() {
        let base = Arc::new(Scripted::new(&[]));
        let breaker = Arc::new(CircuitBreaker::new());
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        let transport = RetryTransport::new(base.clone(), breaker).with_policy(fast_policy());

        let err = transport.round_trip(post(RequestBody::Empty)).unwrap_err();
        assert!(matches!(err, TransportError::CircuitOpen));
        assert_eq!(base.calls(), 0);
    }

    #[test]
    fn test_cancellation_aborts_backoff() {
        let base = Arc::new(Scripted::new(&[]));
        base.push(Ok(respond(429, &[("Retry-After", "120")])));
        let transport =
            RetryTransport::new(base.clone(), Arc::new(CircuitBreaker::new())).with_policy(fast_policy());

        let (guard, cancel) = Cancellation::new();
        let mut request = post(RequestBody::Empty);
        request.extensions_mut().insert(cancel);

        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            (transport.round_trip(request), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);

        let (result, elapsed) = handle.join().unwrap();
        assert!(matches!(
            result,
            Err(TransportError::Interrupted(Interrupt::Cancelled))
        ));
        assert!(elapsed < Duration::from_secs(10));
        assert_eq!(base.calls(), 1);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("7", now), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(" 0 ", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("-5", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        // Past dates collapse to zero
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_backoff_exponential_without_header() {
        let base = Duration::from_millis(100);
        let headers = HeaderMap::new();
        for attempt in 0..4 {
            let step = base * 2u32.pow(attempt);
            let delay = backoff_delay(&headers, attempt, base);
            assert!(delay >= step);
            assert!(delay < step + step / 2 + Duration::from_nanos(1));
        }
    }

    #[test]
    fn test_backoff_prefers_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(
            backoff_delay(&headers, 5, Duration::from_secs(1)),
            Duration::from_secs(3)
        );
    }
}
