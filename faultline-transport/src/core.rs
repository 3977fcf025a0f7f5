//! Shared connection state machine, statistics, and event channel
//!
//! Every binding embeds a [`TransportCore`]. State transitions are the only
//! mutation path for [`ConnectionState`] and each one emits a
//! [`TransportEvent::StateChange`], so the lifecycle observed through the
//! event stream is exactly the lifecycle the instance went through.

use crate::{target::TargetKind, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Whether moving from `from` to `to` is a defined lifecycle transition
///
/// `Error -> Connecting` exists so `connect_with_retry` can re-enter the
/// handshake on an instance whose previous attempt failed; `-> Disconnected`
/// from anywhere covers `close()`, which must always settle there.
pub fn is_legal_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Error)
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
            | (Connected, Error)
            | (Error, Connecting)
            | (Error, Disconnected)
    )
}

/// Traffic counters owned by a single transport instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    /// Messages written to the wire
    pub sent: u64,
    /// Messages parsed off the wire
    pub received: u64,
    /// Total payload bytes in both directions
    pub bytes_transferred: u64,
    /// Milliseconds the successful connect took
    pub connect_time_ms: Option<u64>,
    /// Unix milliseconds of the most recent send or receive
    pub last_message_at_ms: Option<i64>,
}

/// Typed transport events
///
/// A finite event set over a broadcast channel replaces ad hoc string-keyed
/// listener registration: every subscriber sees every kind.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The lifecycle state changed
    StateChange {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A protocol message arrived
    Message(Value),
    /// A transport-internal failure
    Error(String),
    /// The connection ended
    Closed { code: Option<u16>, reason: String },
    /// Non-protocol output (e.g. the child's stderr) or a dropped frame
    Diagnostic(String),
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared lifecycle and bookkeeping for one transport instance
pub struct TransportCore {
    kind: TargetKind,
    state: Mutex<ConnectionState>,
    stats: Mutex<TransportStats>,
    last_error: Mutex<Option<String>>,
    events: broadcast::Sender<TransportEvent>,
    connect_started: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl TransportCore {
    pub fn new(kind: TargetKind) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kind,
            state: Mutex::new(ConnectionState::Disconnected),
            stats: Mutex::new(TransportStats::default()),
            last_error: Mutex::new(None),
            events,
            connect_started: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("error lock poisoned").clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Whether `close()` has latched this instance
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine: background failures must still fail closed.
        let _ = self.events.send(event);
    }

    fn transition(&self, to: ConnectionState) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("state lock poisoned");
        let from = *state;
        if from == to {
            return Ok(());
        }
        if !is_legal_transition(from, to) {
            error!(%from, %to, "refusing undefined state transition");
            return Err(TransportError::Connection(format!(
                "undefined state transition {from} -> {to}"
            )));
        }
        *state = to;
        drop(state);
        debug!(%from, %to, kind = %self.kind, "transport state change");
        self.emit(TransportEvent::StateChange { from, to });
        Ok(())
    }

    /// Begin the single allowed connect attempt
    pub fn begin_connect(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Connection(
                "transport closed; create a new instance to reconnect".to_string(),
            ));
        }
        {
            let state = self.state.lock().expect("state lock poisoned");
            match *state {
                ConnectionState::Connecting => {
                    return Err(TransportError::Connection(
                        "connect already in progress".to_string(),
                    ));
                }
                ConnectionState::Connected => {
                    return Err(TransportError::Connection(
                        "already connected".to_string(),
                    ));
                }
                ConnectionState::Disconnected | ConnectionState::Error => {}
            }
        }
        *self.connect_started.lock().expect("lock poisoned") = Some(Instant::now());
        self.transition(ConnectionState::Connecting)
    }

    /// The connect attempt succeeded
    pub fn mark_connected(&self) -> Result<(), TransportError> {
        let elapsed = self
            .connect_started
            .lock()
            .expect("lock poisoned")
            .map(|started| started.elapsed().as_millis() as u64);
        self.transition(ConnectionState::Connected)?;
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.connect_time_ms = elapsed;
        Ok(())
    }

    /// Record a failure and force the `Error` state
    ///
    /// Used for both failed connects and mid-session breakage; emits the
    /// error event before the state change so subscribers see the cause
    /// first.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(kind = %self.kind, error = %message, "transport failure");
        *self.last_error.lock().expect("error lock poisoned") = Some(message.clone());
        self.emit(TransportEvent::Error(message));
        if let Err(refused) = self.transition(ConnectionState::Error) {
            debug!(%refused, "error transition refused");
        }
    }

    /// The connection ended; settle in `Disconnected`
    pub fn mark_disconnected(&self, code: Option<u16>, reason: impl Into<String>) {
        let reason = reason.into();
        let previous = self.state();
        if self.transition(ConnectionState::Disconnected).is_ok()
            && previous != ConnectionState::Disconnected
        {
            self.emit(TransportEvent::Closed { code, reason });
        }
    }

    /// Latch the instance shut; a later `connect` is refused
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Guard for operations that require a live connection
    pub fn ensure_connected(&self) -> Result<(), TransportError> {
        let state = self.state();
        if state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected(state))
        }
    }

    /// Count one outbound message of `bytes` payload bytes
    pub fn record_send(&self, bytes: usize) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.sent += 1;
        stats.bytes_transferred += bytes as u64;
        stats.last_message_at_ms = Some(chrono::Utc::now().timestamp_millis());
    }

    /// Count one inbound message of `bytes` payload bytes
    pub fn record_receive(&self, bytes: usize) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.received += 1;
        stats.bytes_transferred += bytes as u64;
        stats.last_message_at_ms = Some(chrono::Utc::now().timestamp_millis());
    }

    /// Publish an inbound protocol message
    pub fn emit_message(&self, message: Value) {
        self.emit(TransportEvent::Message(message));
    }

    /// Publish non-protocol diagnostics
    pub fn emit_diagnostic(&self, line: impl Into<String>) {
        self.emit(TransportEvent::Diagnostic(line.into()));
    }
}
