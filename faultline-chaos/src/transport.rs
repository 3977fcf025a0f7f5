//! Chaos-wrapping transport decorator
//!
//! Mounts a [`ChaosController`] on any [`Transport`]. Outbound messages go
//! through the send pipeline before the wire; inbound `Message` events are
//! re-emitted on the decorator's own channel after the receive pipeline;
//! every other event is forwarded untouched. Duplicate resends fire from
//! background tasks and swallow their errors.

use crate::controller::{ChaosController, SendDisposition};
use crate::ChaosContext;
use async_trait::async_trait;
use faultline_transport::{
    ConnectionState, Target, TargetKind, Transport, TransportError, TransportEvent, TransportStats,
    WireMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct ChaosTransport {
    inner: Arc<dyn Transport>,
    controller: Arc<Mutex<ChaosController>>,
    events: broadcast::Sender<TransportEvent>,
    forward_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChaosTransport {
    /// Wrap `inner`, forwarding its events through the receive pipeline
    pub fn new(inner: Arc<dyn Transport>, controller: ChaosController) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let controller = Arc::new(Mutex::new(controller));
        let forward_task = Self::spawn_forwarder(&inner, &controller, events.clone());
        Self {
            inner,
            controller,
            events,
            forward_task: std::sync::Mutex::new(Some(forward_task)),
        }
    }

    /// Initialize the registered plugins for this run
    pub async fn initialize(&self, context: &ChaosContext) {
        self.controller.lock().await.initialize_all(context).await;
    }

    /// Access the controller, e.g. to toggle it mid-run
    pub fn controller(&self) -> Arc<Mutex<ChaosController>> {
        self.controller.clone()
    }

    fn spawn_forwarder(
        inner: &Arc<dyn Transport>,
        controller: &Arc<Mutex<ChaosController>>,
        events: broadcast::Sender<TransportEvent>,
    ) -> JoinHandle<()> {
        let mut source = inner.subscribe();
        let controller = controller.clone();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(TransportEvent::Message(value)) => {
                        let transformed = controller.lock().await.apply_receive_chaos(value).await;
                        let _ = events.send(TransportEvent::Message(transformed));
                    }
                    Ok(other) => {
                        let _ = events.send(other);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chaos forwarder lagged behind inner transport");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_duplicate(&self, message: WireMessage, delay_ms: u64) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            // Fire and forget: a failed duplicate must not disturb the run.
            if let Err(e) = inner.send(message).await {
                debug!(error = %e, "duplicate resend failed");
            }
        });
    }
}

impl Drop for ChaosTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.forward_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for ChaosTransport {
    fn kind(&self) -> TargetKind {
        self.inner.kind()
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn connect(&self, target: &Target) -> Result<(), TransportError> {
        self.controller.lock().await.apply_connection_chaos().await;
        self.inner.connect(target).await
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        let disposition = self.controller.lock().await.apply_send_chaos(message).await;
        match disposition {
            SendDisposition::Send {
                message,
                duplicates,
            } => {
                self.inner.send(message).await?;
                for duplicate in duplicates {
                    self.spawn_duplicate(duplicate.message, duplicate.delay_ms);
                }
                Ok(())
            }
            SendDisposition::Withheld => {
                debug!("send withheld by chaos pipeline");
                Ok(())
            }
            SendDisposition::Dropped { plugin } => {
                Err(TransportError::ChaosInjectedDrop(plugin))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.controller.lock().await.restore().await;
        self.inner.close().await
    }
}
