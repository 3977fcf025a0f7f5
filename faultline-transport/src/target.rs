//! Target descriptors consumed by the transport factory

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Describes the endpoint a transport should connect to
///
/// Immutable once resolved; supplied by the caller (typically a scenario or
/// fixture loader) and handed to [`crate::create_transport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    /// A child process driven over its stdio pipes
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        /// Run through `sh -c` instead of spawning the command directly
        #[serde(default)]
        shell: bool,
    },

    /// A TCP stream socket, optionally TLS-wrapped
    Stream {
        host: String,
        port: u16,
        #[serde(default)]
        secure: bool,
        #[serde(default, rename = "timeoutMs")]
        connect_timeout_ms: Option<u64>,
    },

    /// A WebSocket endpoint carrying one JSON document per frame
    Message {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        subprotocols: Vec<String>,
    },
}

/// The three binding families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Process,
    Stream,
    Message,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetKind::Process => "process",
            TargetKind::Stream => "stream",
            TargetKind::Message => "message",
        };
        f.write_str(name)
    }
}

impl Target {
    /// The binding family this target belongs to
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Process { .. } => TargetKind::Process,
            Target::Stream { .. } => TargetKind::Stream,
            Target::Message { .. } => TargetKind::Message,
        }
    }

    /// Process target running `command` with no arguments
    pub fn process(command: impl Into<String>) -> Self {
        Target::Process {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            shell: false,
        }
    }

    /// Process target run through the shell
    pub fn shell(script: impl Into<String>) -> Self {
        Target::Process {
            command: script.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            shell: true,
        }
    }

    /// Plain TCP stream target
    pub fn stream(host: impl Into<String>, port: u16) -> Self {
        Target::Stream {
            host: host.into(),
            port,
            secure: false,
            connect_timeout_ms: None,
        }
    }

    /// WebSocket target
    pub fn message(url: impl Into<String>) -> Self {
        Target::Message {
            url: url.into(),
            headers: HashMap::new(),
            subprotocols: Vec::new(),
        }
    }
}
