//! Child-process binding: newline-delimited JSON over stdio pipes
//!
//! Spawns the server under test with stdin/stdout/stderr piped. stdout is
//! the protocol channel; stderr is routed to diagnostic events. Connect
//! completes when the child produces its first stdout output (the ready
//! signal) and times out after a bounded startup window otherwise.

use crate::core::{ConnectionState, TransportCore, TransportEvent, TransportStats};
use crate::framing::{encode_line, spawn_line_reader, EofBehavior};
use crate::target::{Target, TargetKind};
use crate::{Transport, TransportError, WireMessage};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Window the child has to produce its ready signal
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace window for voluntary exit before the child is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Transport driving a child process over its stdio pipes
pub struct ProcessTransport {
    core: Arc<TransportCore>,
    child: Arc<Mutex<Option<Child>>>,
    stdin: Mutex<Option<ChildStdin>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    startup_timeout: Duration,
    shutdown_grace: Duration,
}

impl ProcessTransport {
    pub fn new() -> Self {
        Self {
            core: Arc::new(TransportCore::new(TargetKind::Process)),
            child: Arc::new(Mutex::new(None)),
            stdin: Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
            startup_timeout: STARTUP_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    /// Override the startup and shutdown windows
    pub fn with_timeouts(startup: Duration, shutdown: Duration) -> Self {
        Self {
            startup_timeout: startup,
            shutdown_grace: shutdown,
            ..Self::new()
        }
    }

    fn build_command(
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
        cwd: &Option<std::path::PathBuf>,
        shell: bool,
    ) -> Command {
        let mut cmd = if shell {
            let mut script = command.to_string();
            for arg in args {
                script.push(' ');
                script.push_str(arg);
            }
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        } else {
            let mut cmd = Command::new(command);
            cmd.args(args);
            cmd
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("task lock poisoned").push(task);
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
    }

    async fn cleanup_failed_connect(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        *self.stdin.lock().await = None;
        self.abort_tasks();
    }

    /// Watch the child for exit while connected
    fn spawn_exit_watcher(&self, core: Arc<TransportCore>) -> JoinHandle<()> {
        let child_slot = self.child.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let mut guard = child_slot.lock().await;
                let Some(child) = guard.as_mut() else { break };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        drop(guard);
                        if core.state() == ConnectionState::Connected {
                            if status.success() {
                                core.mark_disconnected(None, "process exited");
                            } else {
                                core.fail(format!("process exited abnormally: {status}"));
                            }
                        }
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        drop(guard);
                        if core.state() == ConnectionState::Connected {
                            core.fail(format!("process wait failed: {e}"));
                        }
                        break;
                    }
                }
            }
        })
    }
}

impl Default for ProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> TargetKind {
        TargetKind::Process
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
        let Target::Process {
            command,
            args,
            env,
            cwd,
            shell,
        } = target
        else {
            return Err(TransportError::TargetTypeMismatch {
                expected: TargetKind::Process,
                actual: target.kind(),
            });
        };

        self.core.begin_connect()?;
        info!(%command, shell, "spawning server process");

        let mut cmd = Self::build_command(command, args, env, cwd, *shell);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to spawn '{command}': {e}");
                self.core.fail(&message);
                return Err(TransportError::Connection(message));
            }
        };

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let stdin = child.stdin.take().expect("stdin was piped");
        *self.child.lock().await = Some(child);

        let (ready_tx, ready_rx) = oneshot::channel();
        // Stdout EOF alone proves nothing; the exit watcher settles the
        // final state once it knows the exit status.
        self.track(spawn_line_reader(
            self.core.clone(),
            stdout,
            Some(ready_tx),
            EofBehavior::LeaveToOwner,
        ));

        // stderr is the diagnostic channel, never the protocol channel.
        let core = self.core.clone();
        self.track(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(stderr = %line, "child diagnostic");
                core.emit_diagnostic(line);
            }
        }));

        match tokio::time::timeout(self.startup_timeout, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.cleanup_failed_connect().await;
                let message = "process exited before signalling ready".to_string();
                self.core.fail(&message);
                return Err(TransportError::Connection(message));
            }
            Err(_) => {
                self.cleanup_failed_connect().await;
                let message = format!(
                    "Process startup timeout after {}ms",
                    self.startup_timeout.as_millis()
                );
                self.core.fail(&message);
                return Err(TransportError::Connection(message));
            }
        }

        *self.stdin.lock().await = Some(stdin);
        self.track(self.spawn_exit_watcher(self.core.clone()));
        self.core.mark_connected()?;
        Ok(())
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.core.ensure_connected()?;
        let line = encode_line(&message)?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or(TransportError::NotConnected(self.core.state()))?;
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            let message = format!("stdin write failed: {e}");
            self.core.fail(&message);
            return Err(TransportError::Write(message));
        }
        if let Err(e) = stdin.flush().await {
            let message = format!("stdin flush failed: {e}");
            self.core.fail(&message);
            return Err(TransportError::Write(message));
        }
        self.core.record_send(line.len());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping stdin sends EOF, giving the child its chance to exit.
        *self.stdin.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "child exited within grace window"),
                Ok(Err(e)) => warn!(error = %e, "waiting on child failed"),
                Err(_) => {
                    warn!("grace window elapsed, killing child");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.abort_tasks();
        self.core.mark_disconnected(None, "closed by client");
        self.core.set_closed();
        Ok(())
    }
}
