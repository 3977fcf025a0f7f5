//! Message-socket binding: one JSON document per WebSocket frame
//!
//! No line framing here: each text or binary frame carries a complete JSON
//! document (binary is decoded as UTF-8). Inbound pings are answered with
//! pongs automatically. Close code 1000 is a normal closure; any other code
//! surfaces as an error before the instance settles.

use crate::core::{ConnectionState, TransportCore, TransportEvent, TransportStats};
use crate::target::{Target, TargetKind};
use crate::{Transport, TransportError, WireMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use tracing::{debug, info, warn};

/// Window for the WebSocket handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Normal-closure close code per RFC 6455
const CLOSE_NORMAL: u16 = 1000;

/// Grace window for draining queued frames on close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Transport over a WebSocket connection
pub struct MessageTransport {
    core: Arc<TransportCore>,
    outbound: std::sync::Mutex<Option<mpsc::Sender<WsFrame>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MessageTransport {
    pub fn new() -> Self {
        Self {
            core: Arc::new(TransportCore::new(TargetKind::Message)),
            outbound: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn outbound_sender(&self) -> Option<mpsc::Sender<WsFrame>> {
        self.outbound.lock().expect("outbound lock poisoned").clone()
    }

    /// Decode one inbound frame into protocol or lifecycle effects
    fn handle_frame(core: &TransportCore, frame: WsFrame, pongs: &mpsc::Sender<WsFrame>) -> bool {
        match frame {
            WsFrame::Text(text) => {
                Self::handle_payload(core, &text);
                true
            }
            WsFrame::Binary(bytes) => {
                match String::from_utf8(bytes) {
                    Ok(text) => Self::handle_payload(core, &text),
                    Err(_) => {
                        warn!("dropping non-UTF-8 binary frame");
                        core.emit_diagnostic("dropped non-UTF-8 binary frame".to_string());
                    }
                }
                true
            }
            WsFrame::Ping(payload) => {
                let _ = pongs.try_send(WsFrame::Pong(payload));
                true
            }
            WsFrame::Pong(_) | WsFrame::Frame(_) => true,
            WsFrame::Close(close_frame) => {
                let code = close_frame.as_ref().map(|f| u16::from(f.code));
                let reason = close_frame
                    .as_ref()
                    .map(|f| f.reason.to_string())
                    .unwrap_or_default();
                Self::handle_close(core, code, reason);
                false
            }
        }
    }

    /// Map a close code onto the state machine
    ///
    /// 1000 (and a codeless close) is a clean shutdown; anything else is a
    /// failure that must be observable as an error mentioning the code.
    fn handle_close(core: &TransportCore, code: Option<u16>, reason: String) {
        match code {
            None | Some(CLOSE_NORMAL) => {
                debug!(?code, "websocket closed normally");
                core.mark_disconnected(code, "closed by peer");
            }
            Some(other) => {
                let detail = if reason.is_empty() {
                    format!("websocket closed abnormally with code {other}")
                } else {
                    format!("websocket closed abnormally with code {other}: {reason}")
                };
                core.fail(detail);
            }
        }
    }

    fn handle_payload(core: &TransportCore, text: &str) {
        match serde_json::from_str(text) {
            Ok(value) => {
                core.record_receive(text.len());
                core.emit_message(value);
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                core.emit_diagnostic(format!("dropped malformed frame: {e}"));
            }
        }
    }

    fn build_request(
        url: &str,
        headers: &std::collections::HashMap<String, String>,
        subprotocols: &[String],
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidTarget(format!("bad websocket url: {e}")))?;
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| TransportError::InvalidTarget(format!("bad header '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidTarget(format!("bad header '{key}': {e}")))?;
            request.headers_mut().insert(name, value);
        }
        if !subprotocols.is_empty() {
            let joined = subprotocols.join(", ");
            let value = HeaderValue::from_str(&joined).map_err(|e| {
                TransportError::InvalidTarget(format!("bad subprotocol list: {e}"))
            })?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }
        Ok(request)
    }
}

impl Default for MessageTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MessageTransport {
    fn kind(&self) -> TargetKind {
        TargetKind::Message
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
        let Target::Message {
            url,
            headers,
            subprotocols,
        } = target
        else {
            return Err(TransportError::TargetTypeMismatch {
                expected: TargetKind::Message,
                actual: target.kind(),
            });
        };

        self.core.begin_connect()?;
        info!(%url, "connecting websocket");

        let request = match Self::build_request(url, headers, subprotocols) {
            Ok(request) => request,
            Err(e) => {
                self.core.fail(e.to_string());
                return Err(e);
            }
        };

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                let message = format!("websocket handshake with {url} failed: {e}");
                self.core.fail(&message);
                return Err(TransportError::Connection(message));
            }
            Err(_) => {
                self.core
                    .fail(format!("websocket connect timeout after {CONNECT_TIMEOUT:?}"));
                return Err(TransportError::ConnectionTimeout(CONNECT_TIMEOUT));
            }
        };

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        *self.outbound.lock().expect("outbound lock poisoned") = Some(outbound_tx.clone());

        // Writer task: the single owner of the sink half.
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .push(tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
            }));

        // Reader task: decodes frames, answers pings, maps close codes.
        let core = self.core.clone();
        let pongs = outbound_tx;
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .push(tokio::spawn(async move {
                while let Some(next) = source.next().await {
                    match next {
                        Ok(frame) => {
                            if !Self::handle_frame(&core, frame, &pongs) {
                                break;
                            }
                        }
                        Err(e) => {
                            if core.state() == ConnectionState::Connected {
                                core.fail(format!("websocket error: {e}"));
                            }
                            break;
                        }
                    }
                }
                if core.state() == ConnectionState::Connected {
                    core.mark_disconnected(None, "websocket stream ended");
                }
            }));

        self.core.mark_connected()?;
        Ok(())
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.core.ensure_connected()?;
        let text = message.to_wire_string()?;
        let sender = self
            .outbound_sender()
            .ok_or(TransportError::NotConnected(self.core.state()))?;
        let len = text.len();
        sender
            .send(WsFrame::Text(text))
            .await
            .map_err(|_| TransportError::Write("websocket writer closed".to_string()))?;
        self.core.record_send(len);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let sender = self.outbound.lock().expect("outbound lock poisoned").take();
        if let Some(sender) = sender {
            // Queued behind any pending writes, so the writer flushes them
            // all before the close frame goes out.
            let _ = sender.send(WsFrame::Close(None)).await;
        }
        let mut tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("task lock poisoned")
            .drain(..)
            .collect();
        let drained = tokio::time::timeout(
            SHUTDOWN_GRACE,
            futures_util::future::join_all(tasks.iter_mut()),
        )
        .await;
        if drained.is_err() {
            warn!("websocket close grace window elapsed, aborting tasks");
            for task in &tasks {
                task.abort();
            }
        }
        self.core.mark_disconnected(None, "closed by client");
        self.core.set_closed();
        Ok(())
    }
}
