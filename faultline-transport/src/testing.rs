//! In-memory transport for exercising the harness without a real server
//!
//! Conformance suites and the crates layered on top (chaos decorator,
//! correlation client) need a transport whose peer they fully control. The
//! memory transport records everything sent, lets the test inject inbound
//! messages, errors, and closes, and can auto-answer requests through a
//! scripted responder.

use crate::core::{ConnectionState, TransportCore, TransportEvent, TransportStats};
use crate::target::{Target, TargetKind};
use crate::{Transport, TransportError, WireMessage};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

type Responder = Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Scriptable in-memory transport
pub struct MemoryTransport {
    core: Arc<TransportCore>,
    sent: Mutex<Vec<WireMessage>>,
    responder: Mutex<Option<Responder>>,
    fail_connect: AtomicBool,
    fail_send: AtomicBool,
}

impl MemoryTransport {
    /// Memory transport posing as a process binding
    pub fn new() -> Self {
        Self::with_kind(TargetKind::Process)
    }

    /// Memory transport posing as the given binding family
    pub fn with_kind(kind: TargetKind) -> Self {
        Self {
            core: Arc::new(TransportCore::new(kind)),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            fail_connect: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
        }
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }

    /// Sent messages that were structured JSON
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                WireMessage::Json(value) => Some(value),
                WireMessage::Raw(_) => None,
            })
            .collect()
    }

    /// Auto-answer future sends: the closure sees each outbound JSON payload
    /// and may produce an immediate inbound reply
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        *self.responder.lock().expect("responder lock poisoned") = Some(Box::new(responder));
    }

    /// Make the next connect attempts fail
    pub fn fail_connects(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make sends fail with a write error
    pub fn fail_sends(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Deliver an inbound message as if the peer had sent it
    pub fn inject_message(&self, message: Value) {
        let size = message.to_string().len();
        self.core.record_receive(size);
        self.core.emit_message(message);
    }

    /// Simulate a transport-internal failure
    pub fn inject_error(&self, message: impl Into<String>) {
        self.core.fail(message);
    }

    /// Simulate the peer closing the connection
    pub fn inject_close(&self) {
        self.core.mark_disconnected(None, "closed by peer");
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TargetKind {
        self.core.kind()
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    fn stats(&self) -> TransportStats {
        self.core.stats()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.core.subscribe()
    }

    async fn connect(&self, target: &Target) -> Result<(), TransportError> {
        if target.kind() != self.core.kind() {
            return Err(TransportError::TargetTypeMismatch {
                expected: self.core.kind(),
                actual: target.kind(),
            });
        }
        self.core.begin_connect()?;
        if self.fail_connect.load(Ordering::SeqCst) {
            self.core.fail("scripted connect failure");
            return Err(TransportError::Connection(
                "scripted connect failure".to_string(),
            ));
        }
        self.core.mark_connected()?;
        Ok(())
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.core.ensure_connected()?;
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::Write("scripted write failure".to_string()));
        }
        let size = message.to_wire_string().map(|text| text.len()).unwrap_or(0);
        self.core.record_send(size);
        self.sent
            .lock()
            .expect("sent lock poisoned")
            .push(message.clone());

        if let WireMessage::Json(value) = &message {
            let reply = {
                let responder = self.responder.lock().expect("responder lock poisoned");
                responder.as_ref().and_then(|respond| respond(value))
            };
            if let Some(reply) = reply {
                self.inject_message(reply);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.core.mark_disconnected(None, "closed by client");
        self.core.set_closed();
        Ok(())
    }
}
