//! Outbound HTTP transport
//!
//! This module provides:
//! - The [`Transport`] seam every outbound call goes through
//! - A ureq-backed base transport
//! - A retrying decorator guarded by a circuit breaker
//! - Request-scoped cancellation for blocking waits
//! - A scripted transport for tests

mod base;
mod cancel;
mod circuit;
mod mock;
mod retry;

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use base::UreqTransport;
pub use cancel::{CancelGuard, Cancellation, Interrupt};
pub use circuit::{CircuitBreaker, CircuitState, FAILURE_THRESHOLD, RESET_TIMEOUT};
pub use mock::{MockResponse, MockTransport, RecordedRequest};
pub use retry::{RetryPolicy, RetryTransport};

pub type HttpRequest = http::Request<RequestBody>;
pub type HttpResponse = http::Response<ResponseBody>;

/// Errors raised below the HTTP status level
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The circuit breaker is open; no request was sent
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
    #[error("http: {0}")]
    Http(#[from] ureq::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] http::Error),
}

/// Request body; readers are consumed once
pub enum RequestBody {
    Empty,
    Bytes(Vec<u8>),
    Reader(Box<dyn Read + Send>),
}

impl RequestBody {
    /// Serialize `value` as a JSON body
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::Bytes(serde_json::to_vec(value)?))
    }

    /// Buffer the whole body
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Empty => Ok(Vec::new()),
            Self::Bytes(bytes) => Ok(bytes),
            Self::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// Streaming response body
pub struct ResponseBody(Box<dyn Read + Send>);

impl ResponseBody {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self(Box::new(reader))
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(io::Cursor::new(bytes.into()))
    }

    pub fn empty() -> Self {
        Self::new(io::empty())
    }

    /// Read at most `limit` bytes
    pub fn read_limited(self, limit: u64) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.0.take(limit).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn read_to_vec(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.0.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn read_json<T: DeserializeOwned>(self) -> serde_json::Result<T> {
        serde_json::from_reader(self.0)
    }

    /// Consume and discard the rest of the body so the connection can be reused
    pub fn drain(mut self) -> io::Result<u64> {
        io::copy(&mut self.0, &mut io::sink())
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseBody(..)")
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// A blocking HTTP round trip
///
/// Implementations read the request's [`Cancellation`] from its extensions.
pub trait Transport: Send + Sync {
    fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).round_trip(request)
    }
}

/// The cancellation attached to a request, or one that never fires
pub fn request_cancellation(request: &HttpRequest) -> Cancellation {
    request
        .extensions()
        .get::<Cancellation>()
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_body_buffers() {
        let body = RequestBody::Reader(Box::new(io::Cursor::new(b"hello".to_vec())));
        assert_eq!(body.into_bytes().unwrap(), b"hello");
        assert!(RequestBody::Empty.into_bytes().unwrap().is_empty());
    }

    #[test]
    fn test_response_body_limited_read() {
        let body = ResponseBody::from_bytes(b"0123456789".to_vec());
        assert_eq!(body.read_limited(4).unwrap(), b"0123");
    }

    #[test]
    fn test_request_cancellation_default() {
        let request = http::Request::new(RequestBody::Empty);
        assert!(request_cancellation(&request).check().is_ok());
    }
}
