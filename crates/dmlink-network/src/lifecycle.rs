//! Per-exchange stream lifecycle.
//!
//! ```text
//! Idle → Dialing → [ConnectionUpgradePending] → StreamOpen → Writing → Reading → Verifying → Closed
//!          └──────────────── any non-terminal state ──────────────→ Aborting → Closed
//! ```
//!
//! [`StreamLifecycle`] owns the stream of one exchange. Every exit
//! goes through [`StreamLifecycle::finish`], which aborts on error and
//! then closes exactly once. `Closed` is terminal; closing again is a
//! no-op and a close failure after an abort is logged, not returned.

use std::fmt;
use std::time::Duration;

use libp2p::PeerId;
use tokio::time::Instant;

use dmlink_types::{DirectMessageError, Result};

use crate::transport::{Connection, ConnectionStatus, MessageStream};

// ---------------------------------------------------------------------------
// ExchangeState
// ---------------------------------------------------------------------------

/// States of one direct-message exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExchangeState {
    Idle,
    Dialing,
    ConnectionUpgradePending,
    StreamOpen,
    Writing,
    Reading,
    Verifying,
    Aborting,
    Closed,
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::ConnectionUpgradePending => "connection-upgrade-pending",
            Self::StreamOpen => "stream-open",
            Self::Writing => "writing",
            Self::Reading => "reading",
            Self::Verifying => "verifying",
            Self::Aborting => "aborting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side of the exchange a lifecycle belongs to. Log context only.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

// ---------------------------------------------------------------------------
// StreamLifecycle
// ---------------------------------------------------------------------------

/// Owns the stream of one exchange and tracks its state.
pub struct StreamLifecycle<S: MessageStream> {
    peer: PeerId,
    role: Role,
    state: ExchangeState,
    stream: Option<S>,
    aborted: bool,
}

impl<S: MessageStream> StreamLifecycle<S> {
    /// A lifecycle in the `Idle` state with no stream.
    pub fn new(peer: PeerId, role: Role) -> Self {
        Self {
            peer,
            role,
            state: ExchangeState::Idle,
            stream: None,
            aborted: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Whether [`StreamLifecycle::abort`] has run.
    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    fn transition(&mut self, next: ExchangeState) {
        tracing::debug!(
            peer = %self.peer,
            role = %self.role,
            from = %self.state,
            to = %next,
            "exchange state"
        );
        self.state = next;
    }

    pub fn dialing(&mut self) {
        self.transition(ExchangeState::Dialing);
    }

    pub fn upgrade_pending(&mut self) {
        self.transition(ExchangeState::ConnectionUpgradePending);
    }

    pub fn verifying(&mut self) {
        self.transition(ExchangeState::Verifying);
    }

    /// Takes ownership of a freshly opened stream.
    pub fn attach(&mut self, stream: S) {
        self.stream = Some(stream);
        self.transition(ExchangeState::StreamOpen);
    }

    fn stream_mut(&mut self) -> Result<&mut S> {
        self.stream.as_mut().ok_or_else(|| DirectMessageError::StreamIoFailure {
            reason: "no open stream".into(),
        })
    }

    /// Writes one frame.
    ///
    /// # Errors
    ///
    /// [`DirectMessageError::StreamIoFailure`] on any I/O error.
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        self.transition(ExchangeState::Writing);
        self.stream_mut()?
            .write_frame(payload)
            .await
            .map_err(DirectMessageError::stream_io)
    }

    /// Reads one frame of at most `max_len` bytes.
    ///
    /// # Errors
    ///
    /// [`DirectMessageError::StreamIoFailure`] on any I/O error,
    /// including an oversized frame or a remote reset.
    pub async fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.transition(ExchangeState::Reading);
        self.stream_mut()?
            .read_frame(max_len)
            .await
            .map_err(DirectMessageError::stream_io)
    }

    /// Signals cancellation to the remote side. Runs at most once and
    /// never after `Closed`.
    pub fn abort(&mut self) {
        if self.aborted || self.state == ExchangeState::Closed {
            return;
        }
        self.aborted = true;
        self.transition(ExchangeState::Aborting);
        if let Some(stream) = self.stream.as_mut() {
            tracing::warn!(peer = %self.peer, role = %self.role, "aborting stream");
            stream.abort();
        }
    }

    /// Closes the stream. Idempotent.
    pub async fn close(&mut self) {
        if self.state == ExchangeState::Closed {
            return;
        }
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close().await {
                if self.aborted {
                    tracing::debug!(peer = %self.peer, %e, "close after abort failed");
                } else {
                    tracing::warn!(peer = %self.peer, role = %self.role, %e, "stream close failed");
                }
            }
        }
        self.transition(ExchangeState::Closed);
    }

    /// Ends the exchange: abort if `outcome` is an error, then close.
    pub async fn finish<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if outcome.is_err() {
            self.abort();
        }
        self.close().await;
        outcome
    }
}

impl<S: MessageStream> Drop for StreamLifecycle<S> {
    // A dropped exchange future must not leave the remote waiting.
    fn drop(&mut self) {
        if self.state != ExchangeState::Closed {
            if let Some(stream) = self.stream.as_mut() {
                tracing::debug!(peer = %self.peer, state = %self.state, "exchange dropped mid-flight");
                stream.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection upgrade wait
// ---------------------------------------------------------------------------

/// Polls `connection` every `interval` until it reports
/// [`ConnectionStatus::Open`] or `max_wait` has elapsed.
///
/// # Errors
///
/// [`DirectMessageError::ConnectionUpgradeTimeout`] when the bound is
/// exceeded.
pub async fn wait_for_upgrade<C>(connection: &C, interval: Duration, max_wait: Duration) -> Result<()>
where
    C: Connection + ?Sized,
{
    let started = Instant::now();
    loop {
        if connection.status().await == ConnectionStatus::Open {
            tracing::debug!(
                peer = %connection.remote_peer(),
                waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "connection upgraded"
            );
            return Ok(());
        }

        let waited = started.elapsed();
        if waited >= max_wait {
            return Err(DirectMessageError::ConnectionUpgradeTimeout {
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            });
        }

        tokio::time::sleep(interval.min(max_wait - waited)).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
