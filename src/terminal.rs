//! Pseudo-terminal shell sessions.
//!
//! A terminal outlives the socket that created it. Each session remembers the
//! connection that touched it last (create, run, resize) and streams its output
//! there. Sessions end through an explicit delete or when the shell exits; the
//! side that takes the entry out of the map does the teardown.

use crate::client::ClientHandle;
use crate::errors::{BridgeError, BridgeResult};
use crate::models::Frame;
use parking_lot::{Mutex, RwLock};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_INPUT_CHANNEL_SIZE: usize = 1024;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct TerminalSession {
    id: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send>>,
    input_tx: SyncSender<Vec<u8>>,
    owner: RwLock<ClientHandle>,
    pid: Option<u32>,
}

impl TerminalSession {
    /// Make `owner` the socket that receives this terminal's output.
    fn claim(&self, owner: &ClientHandle) {
        let mut current = self.owner.write();
        if current.id() != owner.id() {
            info!(terminal = %self.id, from = %current.id(), to = %owner.id(), "terminal ownership moved");
            *current = owner.clone();
        }
    }

    fn emit(&self, data: String) {
        let owner = self.owner.read().clone();
        let frame = Frame::push(
            "terminal",
            "runCommandResponse",
            json!({ "id": self.id, "data": data }),
        );
        if !owner.send(&frame) {
            debug!(terminal = %self.id, "owner disconnected, dropping output");
        }
    }

    fn write_input(&self, data: &str) -> BridgeResult<()> {
        match self.input_tx.try_send(data.as_bytes().to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BridgeError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                "terminal input backlog is full",
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(BridgeError::TerminalNotFound(self.id.clone()))
            }
        }
    }

    fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BridgeError::Io(io::Error::other(e.to_string())))
    }

    /// Kill and reap the shell. Blocks until the process is gone.
    fn terminate(&self) {
        let mut child = self.child.lock();
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(error) = child.kill() {
            debug!(terminal = %self.id, %error, "kill failed, shell may already be gone");
        }
        if let Err(error) = child.wait() {
            warn!(terminal = %self.id, %error, "failed to reap shell");
        }
    }
}

struct RegistryInner {
    shell: String,
    cwd: PathBuf,
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
}

#[derive(Clone)]
pub struct TerminalRegistry {
    inner: Arc<RegistryInner>,
}

impl TerminalRegistry {
    pub fn new(shell: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                shell: shell.into(),
                cwd: cwd.into(),
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn create(&self, owner: &ClientHandle) -> BridgeResult<String> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BridgeError::PtySpawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.inner.shell);
        cmd.cwd(&self.inner.cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BridgeError::PtySpawn(e.to_string()))?;
        // The master only sees EOF once no slave handle is left open here.
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::PtySpawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BridgeError::PtySpawn(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let (input_tx, input_rx) = std::sync::mpsc::sync_channel(PTY_INPUT_CHANNEL_SIZE);
        spawn_pty_writer(id.clone(), writer, input_rx);

        let session = Arc::new(TerminalSession {
            id: id.clone(),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            input_tx,
            owner: RwLock::new(owner.clone()),
            pid,
        });

        let count = {
            let mut sessions = self.inner.sessions.write();
            sessions.insert(id.clone(), session.clone());
            sessions.len()
        };
        spawn_exit_watcher(Arc::downgrade(&self.inner), Arc::downgrade(&session));
        spawn_pty_reader(Arc::downgrade(&self.inner), session, reader);

        info!(terminal = %id, ?pid, owner = %owner.id(), total = count, "terminal created");
        Ok(id)
    }

    pub fn run_command(&self, id: &str, command: &str, owner: &ClientHandle) -> BridgeResult<()> {
        let session = self.get(id)?;
        session.claim(owner);
        session.write_input(command)
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16, owner: &ClientHandle) -> BridgeResult<()> {
        if cols == 0 || rows == 0 {
            return Err(BridgeError::InvalidRequest(format!(
                "invalid terminal size {cols}x{rows}"
            )));
        }
        let session = self.get(id)?;
        session.claim(owner);
        session.resize(cols, rows)
    }

    pub async fn delete(&self, id: &str) -> BridgeResult<()> {
        let session = self
            .inner
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| BridgeError::TerminalNotFound(id.to_string()))?;

        tokio::task::spawn_blocking(move || session.terminate())
            .await
            .map_err(|e| BridgeError::Io(io::Error::other(e.to_string())))?;
        info!(terminal = %id, "terminal deleted");
        Ok(())
    }

    /// Ids of every live terminal, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.inner.sessions.read().get(id).and_then(|s| s.pid)
    }

    fn get(&self, id: &str) -> BridgeResult<Arc<TerminalSession>> {
        self.inner
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::TerminalNotFound(id.to_string()))
    }
}

/// Dedicated thread feeding the pty in small chunks, in order.
fn spawn_pty_writer(id: String, mut writer: Box<dyn Write + Send>, input_rx: Receiver<Vec<u8>>) {
    std::thread::spawn(move || {
        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    error!(terminal = %id, error = %e, errno = ?e.raw_os_error(), "pty write failed");
                    return;
                }
            }
        }
        debug!(terminal = %id, "writer finished");
    });
}

fn spawn_pty_reader(
    registry: Weak<RegistryInner>,
    session: Arc<TerminalSession>,
    mut reader: Box<dyn Read + Send>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
        let mut pending: Vec<u8> = Vec::new();

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let valid = utf8_boundary(&pending);
                    if valid > 0 {
                        let data = String::from_utf8_lossy(&pending[..valid]).into_owned();
                        pending.drain(..valid);
                        session.emit(data);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the shell side is closed.
                Err(e) => {
                    debug!(terminal = %session.id, error = %e, "pty read ended");
                    break;
                }
            }
        }

        if !pending.is_empty() {
            session.emit(String::from_utf8_lossy(&pending).into_owned());
        }

        if let Some(registry) = registry.upgrade() {
            finish(&registry, &session.id);
        }
    });
}

/// Ends the terminal once the shell itself exits. A background job can hold the
/// pty open long after that, so the reader alone never sees EOF in time.
fn spawn_exit_watcher(registry: Weak<RegistryInner>, session: Weak<TerminalSession>) {
    std::thread::spawn(move || loop {
        std::thread::sleep(EXIT_POLL_INTERVAL);
        let (Some(registry), Some(session)) = (registry.upgrade(), session.upgrade()) else {
            return;
        };
        if !registry.sessions.read().contains_key(&session.id) {
            return;
        }
        let exited = match session.child.lock().try_wait() {
            Ok(status) => status.is_some(),
            Err(error) => {
                debug!(terminal = %session.id, %error, "cannot poll shell");
                true
            }
        };
        if exited {
            finish(&registry, &session.id);
            return;
        }
    });
}

/// Take the terminal out of the map and tear it down. Only the caller that
/// actually removed it does the teardown and notifies the owner.
fn finish(registry: &RegistryInner, id: &str) {
    let removed = registry.sessions.write().remove(id);
    if let Some(session) = removed {
        session.terminate();
        let owner = session.owner.read().clone();
        owner.send(&Frame::push("terminal", "exit", json!({ "id": session.id })));
        info!(terminal = %session.id, "shell exited, terminal removed");
    }
}

/// Length of the prefix that is complete UTF-8. An incomplete trailing sequence
/// is held back; invalid bytes are passed through and replaced lossily.
fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}
