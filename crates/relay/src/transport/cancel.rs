//! Request-scoped cancellation for blocking work
//!
//! A [`Cancellation`] travels with each outbound request (in the request
//! extensions) so backoff waits and in-flight calls can be interrupted when
//! the inbound push request goes away or its deadline passes.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, select};

/// Why a wait was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupt {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Owner side of a [`Cancellation`]
///
/// Dropping the guard (or calling [`CancelGuard::cancel`]) cancels every
/// clone of the linked cancellation.
#[derive(Debug)]
pub struct CancelGuard {
    _signal: Sender<()>,
}

impl CancelGuard {
    /// Cancel explicitly
    pub fn cancel(self) {}
}

/// Cancellation signal plus optional deadline
#[derive(Debug, Clone)]
pub struct Cancellation {
    signal: Receiver<()>,
    /// Whether a [`CancelGuard`] can fire `signal`
    linked: bool,
    deadline: Option<Instant>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

impl Cancellation {
    /// Create a linked guard/cancellation pair
    pub fn new() -> (CancelGuard, Self) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (
            CancelGuard { _signal: tx },
            Self {
                signal: rx,
                linked: true,
                deadline: None,
            },
        )
    }

    /// A cancellation that never fires
    pub fn never() -> Self {
        Self {
            signal: crossbeam_channel::never(),
            linked: false,
            deadline: None,
        }
    }

    /// Bound the remaining work by `timeout` from now
    ///
    /// An earlier existing deadline is kept.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a guard can cancel this before the deadline
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Time left before the deadline (None when unbounded)
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Return an error if cancelled or past the deadline
    pub fn check(&self) -> Result<(), Interrupt> {
        match self.signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return Err(Interrupt::Cancelled),
            Err(TryRecvError::Empty) => {}
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Interrupt::DeadlineExceeded);
        }
        Ok(())
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns as soon as the guard is dropped or the deadline passes.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        self.check()?;
        if duration.is_zero() {
            return Ok(());
        }

        let wake = Instant::now() + duration;
        let (until, hits_deadline) = match self.deadline {
            Some(deadline) if deadline < wake => (deadline, true),
            _ => (wake, false),
        };

        match self.signal.recv_deadline(until) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Err(Interrupt::Cancelled),
            Err(RecvTimeoutError::Timeout) if hits_deadline => Err(Interrupt::DeadlineExceeded),
            Err(RecvTimeoutError::Timeout) => Ok(()),
        }
    }

    /// Wait for a value on `rx` unless cancelled first
    ///
    /// `Ok(None)` means the sender went away without sending.
    pub fn recv<T>(&self, rx: &Receiver<T>) -> Result<Option<T>, Interrupt> {
        self.check()?;
        let deadline = self
            .deadline
            .map(crossbeam_channel::at)
            .unwrap_or_else(crossbeam_channel::never);

        select! {
            recv(rx) -> msg => Ok(msg.ok()),
            recv(self.signal) -> _ => Err(Interrupt::Cancelled),
            recv(deadline) -> _ => Err(Interrupt::DeadlineExceeded),
        }
    }
}
