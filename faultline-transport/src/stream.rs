//! Stream-socket binding: newline-delimited JSON over TCP, optionally TLS
//!
//! The secure variant delegates to the platform's TLS implementation via
//! `native-tls`; both variants share the line framing and reader loop with
//! the process binding.

use crate::core::{ConnectionState, TransportCore, TransportEvent, TransportStats};
use crate::framing::{encode_line, spawn_line_reader, EofBehavior};
use crate::target::{Target, TargetKind};
use crate::{Transport, TransportError, WireMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default connect window when the target does not specify one
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace window for flushing the write half on close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Object-safe alias unifying the plain and TLS socket types
trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// Transport over a plain or TLS-wrapped TCP stream
pub struct StreamTransport {
    core: Arc<TransportCore>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl StreamTransport {
    pub fn new() -> Self {
        Self {
            core: Arc::new(TransportCore::new(TargetKind::Stream)),
            writer: Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    async fn open_stream(
        &self,
        host: &str,
        port: u16,
        secure: bool,
        connect_timeout: Duration,
    ) -> Result<BoxedStream, TransportError> {
        let tcp = match tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Connection(format!(
                    "connect to {host}:{port} failed: {e}"
                )));
            }
            Err(_) => return Err(TransportError::ConnectionTimeout(connect_timeout)),
        };

        if !secure {
            return Ok(Box::new(tcp));
        }

        let connector = native_tls::TlsConnector::new()
            .map_err(|e| TransportError::Connection(format!("TLS setup failed: {e}")))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = tokio::time::timeout(connect_timeout, connector.connect(host, tcp))
            .await
            .map_err(|_| TransportError::ConnectionTimeout(connect_timeout))?
            .map_err(|e| {
                TransportError::Connection(format!("TLS handshake with {host} failed: {e}"))
            })?;
        Ok(Box::new(tls))
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
    }
}

impl Default for StreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TargetKind {
        TargetKind::Stream
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
        let Target::Stream {
            host,
            port,
            secure,
            connect_timeout_ms,
        } = target
        else {
            return Err(TransportError::TargetTypeMismatch {
                expected: TargetKind::Stream,
                actual: target.kind(),
            });
        };

        self.core.begin_connect()?;
        let connect_timeout = connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        info!(%host, port, secure, "connecting stream socket");

        let stream = match self.open_stream(host, *port, *secure, connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                self.core.fail(e.to_string());
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .push(spawn_line_reader(
                self.core.clone(),
                read_half,
                None,
                EofBehavior::Disconnect,
            ));
        self.core.mark_connected()?;
        debug!(%host, port, "stream socket connected");
        Ok(())
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.core.ensure_connected()?;
        let line = encode_line(&message)?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(TransportError::NotConnected(self.core.state()))?;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            let message = format!("socket write failed: {e}");
            self.core.fail(&message);
            return Err(TransportError::Write(message));
        }
        if let Err(e) = writer.flush().await {
            let message = format!("socket flush failed: {e}");
            self.core.fail(&message);
            return Err(TransportError::Write(message));
        }
        self.core.record_send(line.len());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
                Ok(Ok(())) => debug!("stream shut down cleanly"),
                Ok(Err(e)) => warn!(error = %e, "stream shutdown failed"),
                Err(_) => warn!("stream shutdown timed out, dropping socket"),
            }
        }
        self.abort_tasks();
        self.core.mark_disconnected(None, "closed by client");
        self.core.set_closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Line-oriented echo peer for driving the binding end to end
    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let echoed = format!("{line}\n");
                    if write.write_all(echoed.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn connect_send_receive_close() {
        let addr = spawn_echo_server().await;
        let transport = StreamTransport::new();
        let mut events = transport.subscribe();
        let target = Target::stream(addr.ip().to_string(), addr.port());

        transport.connect(&target).await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);

        let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        // Poll the waiter first so its subscription exists before the echo
        // can come back.
        let (echoed, sent) = tokio::join!(
            crate::wait_for_message(
                &transport,
                |message| message["method"] == "ping",
                Duration::from_secs(2),
            ),
            transport.send(payload.clone().into())
        );
        sent.unwrap();
        assert_eq!(echoed.unwrap(), payload);

        let stats = transport.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.received, 1);
        assert!(stats.bytes_transferred > 0);
        assert!(stats.connect_time_ms.is_some());

        transport.close().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        // State changes were observable in order.
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::StateChange { to, .. } = event {
                seen.push(to);
            }
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn send_requires_connected() {
        let transport = StreamTransport::new();
        let result = transport.send(json!({"a": 1}).into()).await;
        assert!(matches!(
            result,
            Err(TransportError::NotConnected(ConnectionState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn kind_mismatch_fails_fast() {
        let transport = StreamTransport::new();
        let result = transport.connect(&Target::process("nope")).await;
        match result {
            Err(TransportError::TargetTypeMismatch { expected, actual }) => {
                assert_eq!(expected, TargetKind::Stream);
                assert_eq!(actual, TargetKind::Process);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        // Fail-fast happens before the state machine engages.
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_refused_lands_in_error_state() {
        let transport = StreamTransport::new();
        // Bind-then-drop guarantees nothing is listening on the port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = transport
            .connect(&Target::stream(addr.ip().to_string(), addr.port()))
            .await;
        assert!(result.is_err());
        assert_eq!(transport.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn reuse_after_close_is_refused() {
        let addr = spawn_echo_server().await;
        let transport = StreamTransport::new();
        let target = Target::stream(addr.ip().to_string(), addr.port());
        transport.connect(&target).await.unwrap();
        transport.close().await.unwrap();

        let result = transport.connect(&target).await;
        match result {
            Err(TransportError::Connection(message)) => {
                assert!(message.contains("create a new instance"));
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                // Wait for the client's go signal before writing.
                let mut byte = [0u8; 1];
                use tokio::io::AsyncReadExt;
                let _ = socket.read_exact(&mut byte).await;
                socket
                    .write_all(b"{not json\n{\"ok\":true}\n")
                    .await
                    .unwrap();
                // Keep the socket open so the reader stays alive.
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let transport = StreamTransport::new();
        transport
            .connect(&Target::stream(addr.ip().to_string(), addr.port()))
            .await
            .unwrap();

        let (good, sent) = tokio::join!(
            crate::wait_for_message(&transport, |m| m["ok"] == true, Duration::from_secs(2)),
            transport.send(json!({"go": 1}).into())
        );
        sent.unwrap();
        let good = good.unwrap();
        assert_eq!(good["ok"], true);
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(transport.stats().received, 1);
        transport.close().await.unwrap();
    }
}
