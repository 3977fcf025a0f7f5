//! Newline-delimited JSON framing for the stream-oriented bindings
//!
//! One JSON document per line, no embedded newlines. Inbound bytes arrive in
//! arbitrary chunks; [`LineBuffer`] preserves partial lines across chunk
//! boundaries. A malformed line is a non-fatal parse error: it is reported
//! and dropped without disturbing subsequent lines.

use crate::core::TransportCore;
use crate::{TransportError, WireMessage};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Serialize one outbound frame, delimiter included
pub fn encode_line(message: &WireMessage) -> Result<String, TransportError> {
    let mut text = message.to_wire_string()?;
    text.push('\n');
    Ok(text)
}

/// Splits an inbound byte stream into complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and drain every complete line it finishes
    ///
    /// Lines are returned without their delimiter; a trailing `\r` is
    /// stripped. Anything after the last newline stays buffered for the next
    /// chunk.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(index) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=index).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Bytes currently held back waiting for a delimiter
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Parse one framed line into a JSON value
pub fn parse_line(line: &str) -> Result<Value, TransportError> {
    serde_json::from_str(line).map_err(|e| TransportError::Parse(e.to_string()))
}

/// What EOF on the byte stream means for the connection
///
/// A closed socket is the peer hanging up; a closed child stdout is settled
/// by the exit watcher, which knows the exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EofBehavior {
    Disconnect,
    LeaveToOwner,
}

/// Drive a byte reader through the line codec into the core's event stream
///
/// Shared by the process and stream bindings. `ready` fires once the first
/// complete line arrives, which the process binding uses as its startup
/// signal; a partial line with no delimiter yet is not a signal. A read
/// error forces `Error`.
pub(crate) fn spawn_line_reader<R>(
    core: Arc<TransportCore>,
    mut reader: R,
    ready: Option<oneshot::Sender<()>>,
    on_eof: EofBehavior,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ready = ready;
        let mut buffer = [0u8; 8192];
        let mut lines = LineBuffer::new();
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => {
                    debug!("reader reached end of stream");
                    if on_eof == EofBehavior::Disconnect
                        && core.state() == crate::ConnectionState::Connected
                    {
                        core.mark_disconnected(None, "connection closed by peer");
                    }
                    break;
                }
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buffer[..n]).into_owned();
                    let complete = lines.push(&chunk);
                    if !complete.is_empty() {
                        if let Some(signal) = ready.take() {
                            let _ = signal.send(());
                        }
                    }
                    for line in complete {
                        match parse_line(&line) {
                            Ok(value) => {
                                core.record_receive(line.len());
                                core.emit_message(value);
                            }
                            Err(e) => {
                                warn!(error = %e, "dropping malformed line");
                                core.emit_diagnostic(format!("dropped malformed line: {e}"));
                            }
                        }
                    }
                }
                Err(e) => {
                    if core.state() == crate::ConnectionState::Connected {
                        core.fail(format!("read failed: {e}"));
                    }
                    break;
                }
            }
        }
    })
}
