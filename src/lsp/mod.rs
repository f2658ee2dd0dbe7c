//! Language-server sessions, one OS process per websocket connection.
//!
//! A connection upgrades on `/lsp/{name}`. If `name` is one of the supported
//! servers the process is spawned in the workspace root and JSON-RPC is relayed
//! both ways: socket text frames carry bare JSON bodies, process stdio carries
//! `Content-Length` framed messages. Closing the socket kills the process; the
//! process exiting sends an error frame and closes the socket.

pub mod codec;
pub mod transport;

use crate::errors::{BridgeError, BridgeResult};
use crate::models::Frame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use transport::{ChannelTransport, SocketTransport, TransportEvent, WebSocketTransport};

const FRAME_CHANNEL_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LspKind {
    Python,
    Typescript,
    Rust,
    Go,
    Cpp,
    Bash,
    Yaml,
}

impl LspKind {
    pub const ALL: [LspKind; 7] = [
        LspKind::Python,
        LspKind::Typescript,
        LspKind::Rust,
        LspKind::Go,
        LspKind::Cpp,
        LspKind::Bash,
        LspKind::Yaml,
    ];

    pub fn id(self) -> &'static str {
        match self {
            LspKind::Python => "python",
            LspKind::Typescript => "typescript",
            LspKind::Rust => "rust",
            LspKind::Go => "go",
            LspKind::Cpp => "cpp",
            LspKind::Bash => "bash",
            LspKind::Yaml => "yaml",
        }
    }

    fn default_command(self) -> LspCommand {
        match self {
            LspKind::Python => LspCommand::new("pylsp", &[]),
            LspKind::Typescript => LspCommand::new("typescript-language-server", &["--stdio"]),
            LspKind::Rust => LspCommand::new("rust-analyzer", &[]),
            LspKind::Go => LspCommand::new("gopls", &[]),
            LspKind::Cpp => LspCommand::new("clangd", &[]),
            LspKind::Bash => LspCommand::new("bash-language-server", &["start"]),
            LspKind::Yaml => LspCommand::new("yaml-language-server", &["--stdio"]),
        }
    }
}

impl fmt::Display for LspKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for LspKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LspKind::ALL
            .into_iter()
            .find(|kind| kind.id() == s)
            .ok_or_else(|| BridgeError::UnsupportedLanguageServer(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LspCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LspCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for LspCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedServer {
    pub id: LspKind,
    pub command: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub id: Uuid,
    pub lsp_name: LspKind,
}

#[derive(Clone)]
pub struct LanguageServerPool {
    root: PathBuf,
    overrides: Arc<HashMap<LspKind, LspCommand>>,
    active: Arc<Mutex<HashMap<Uuid, LspKind>>>,
}

impl LanguageServerPool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overrides: Arc::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the command used for `kind`.
    pub fn with_command(mut self, kind: LspKind, command: LspCommand) -> Self {
        Arc::make_mut(&mut self.overrides).insert(kind, command);
        self
    }

    pub fn command_for(&self, kind: LspKind) -> LspCommand {
        self.overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.default_command())
    }

    pub fn supported(&self) -> Vec<SupportedServer> {
        LspKind::ALL
            .into_iter()
            .map(|id| SupportedServer {
                id,
                command: self.command_for(id).to_string(),
            })
            .collect()
    }

    pub fn active(&self) -> Vec<ActiveSession> {
        let mut sessions: Vec<_> = self
            .active
            .lock()
            .iter()
            .map(|(id, kind)| ActiveSession {
                id: *id,
                lsp_name: *kind,
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Run one session to completion on `transport`.
    ///
    /// An unsupported `name` gets an error frame and a closed socket; no process
    /// is spawned.
    pub async fn serve<T: SocketTransport>(&self, name: &str, mut transport: T) {
        let kind = match name.parse::<LspKind>() {
            Ok(kind) => kind,
            Err(error) => {
                warn!(lsp = name, "rejecting unsupported language server");
                let frame = Frame::failure(Some("lsp"), None, error.to_string());
                let _ = transport.send(frame.to_json()).await;
                transport.dispose().await;
                return;
            }
        };

        let id = Uuid::new_v4();
        self.active.lock().insert(id, kind);

        if let Err(error) = self.run_session(id, kind, &mut transport).await {
            warn!(lsp = %kind, session = %id, %error, "language server session failed");
            let frame = Frame::failure(Some("lsp"), None, error.to_string());
            let _ = transport.send(frame.to_json()).await;
        }
        transport.dispose().await;

        self.active.lock().remove(&id);
        info!(lsp = %kind, session = %id, "language server session ended");
    }

    async fn run_session<T: SocketTransport>(
        &self,
        id: Uuid,
        kind: LspKind,
        transport: &mut T,
    ) -> BridgeResult<()> {
        let command = self.command_for(kind);
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::ProcessSpawn {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(BridgeError::ProcessSpawn {
                    command: command.to_string(),
                    message: "stdio unavailable".into(),
                })
            }
        };
        info!(lsp = %kind, session = %id, pid = ?child.id(), "language server started");

        let (frame_tx, mut frame_rx) = mpsc::channel::<io::Result<String>>(FRAME_CHANNEL_SIZE);
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match codec::read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if frame_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = frame_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        let stderr_task = tokio::spawn(log_stderr(kind, stderr));
        // Pipe writes happen off the supervising loop so it can keep draining stdout.
        let (input_tx, input_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_stdin(kind, id, stdin, input_rx));

        let mut stdout_open = true;
        let outcome = loop {
            tokio::select! {
                event = transport.next_event() => match event {
                    TransportEvent::Message(text) => {
                        debug!(lsp = %kind, session = %id, bytes = text.len(), "socket -> server");
                        // A closed writer means stdin broke; the exit branch reports why.
                        let _ = input_tx.send(text);
                    }
                    TransportEvent::Error(message) => {
                        warn!(lsp = %kind, session = %id, %message, "socket error");
                        break Ok(());
                    }
                    TransportEvent::Closed => {
                        info!(lsp = %kind, session = %id, "socket closed");
                        break Ok(());
                    }
                },
                frame = frame_rx.recv(), if stdout_open => match frame {
                    Some(Ok(frame)) => {
                        debug!(lsp = %kind, session = %id, bytes = frame.len(), "server -> socket");
                        if transport.send(frame).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(Err(error)) => {
                        warn!(lsp = %kind, session = %id, %error, "malformed output from language server");
                        stdout_open = false;
                    }
                    None => stdout_open = false,
                },
                status = child.wait() => {
                    let status = status?;
                    while let Ok(Ok(frame)) = frame_rx.try_recv() {
                        let _ = transport.send(frame).await;
                    }
                    break Err(BridgeError::ProcessExited {
                        command: command.to_string(),
                        status: status.to_string(),
                    });
                }
            }
        };

        if outcome.is_ok() {
            if let Err(error) = child.kill().await {
                debug!(lsp = %kind, session = %id, %error, "language server already gone");
            }
        }
        reader_task.abort();
        writer_task.abort();
        stderr_task.abort();
        outcome
    }
}

async fn write_stdin(
    kind: LspKind,
    id: Uuid,
    mut stdin: ChildStdin,
    mut input_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = input_rx.recv().await {
        if let Err(error) = codec::write_frame(&mut stdin, &text).await {
            warn!(lsp = %kind, session = %id, %error, "failed to write to language server");
            break;
        }
    }
}

async fn log_stderr(kind: LspKind, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(lsp = %kind, "{line}");
    }
}
