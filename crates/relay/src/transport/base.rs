//! Base transport backed by a ureq agent
//!
//! Uses synchronous HTTP (ureq) to be executor-agnostic. Status codes are
//! returned as responses, never as errors, so decorators can inspect them.
//!
//! Each call is bounded by the agent timeout and the request's deadline. A
//! call whose [`Cancellation`] is linked to a guard runs on a worker thread so
//! the caller can walk away as soon as the guard drops.

use std::io;
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use super::{
    Cancellation, HttpRequest, HttpResponse, Interrupt, RequestBody, ResponseBody, Transport,
    TransportError, request_cancellation,
};

/// Plain HTTP transport with a bounded per-call timeout
#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
    timeout: Duration,
}

impl UreqTransport {
    /// Default timeout for upstream API calls
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent, timeout }
    }

    /// Timeout for one call: the agent's, cut short by the deadline
    fn call_timeout(&self, cancel: &Cancellation) -> Result<Duration, Interrupt> {
        let timeout = match cancel.remaining() {
            Some(remaining) => remaining.min(self.timeout),
            None => self.timeout,
        };
        if timeout.is_zero() {
            return Err(Interrupt::DeadlineExceeded);
        }
        Ok(timeout)
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

type UreqResult = Result<http::Response<ureq::Body>, ureq::Error>;

fn send(agent: &ureq::Agent, parts: http::request::Parts, body: RequestBody, timeout: Duration) -> UreqResult {
    match body {
        RequestBody::Empty => {
            let request = agent
                .configure_request(http::Request::from_parts(parts, ()))
                .timeout_global(Some(timeout))
                .build();
            agent.run(request)
        }
        body => {
            let bytes = body.into_bytes()?;
            let request = agent
                .configure_request(http::Request::from_parts(parts, bytes))
                .timeout_global(Some(timeout))
                .build();
            agent.run(request)
        }
    }
}

impl Transport for UreqTransport {
    fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let cancel = request_cancellation(&request);
        cancel.check()?;
        let timeout = self.call_timeout(&cancel)?;

        let (parts, body) = request.into_parts();
        trace!("{} {} (timeout {:?})", parts.method, parts.uri, timeout);

        let result = if cancel.is_linked() {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let agent = self.agent.clone();
            thread::Builder::new()
                .name("relay-http".into())
                .spawn(move || {
                    // The caller may have given up already
                    let _ = tx.send(send(&agent, parts, body, timeout));
                })?;
            match cancel.recv(&rx) {
                Ok(Some(result)) => result,
                Ok(None) => return Err(io::Error::other("http worker exited without a response").into()),
                Err(interrupt) => {
                    debug!("Abandoning in-flight request: {}", interrupt);
                    return Err(interrupt.into());
                }
            }
        } else {
            send(&self.agent, parts, body, timeout)
        };

        let response = match result {
            Ok(response) => response,
            // A timeout caused by the deadline is reported as such
            Err(ureq::Error::Timeout(_)) if cancel.check().is_err() => {
                return Err(Interrupt::DeadlineExceeded.into());
            }
            Err(e) => return Err(e.into()),
        };

        let (parts, body) = response.into_parts();
        Ok(http::Response::from_parts(
            parts,
            ResponseBody::new(body.into_reader()),
        ))
    }
}
