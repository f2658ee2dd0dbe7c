//! Envelope dispatch for the `/ws` and `/terminal` sockets.
//!
//! Each inbound text frame is an envelope `{type, event, payload}`. The router
//! picks the manager by `type`, runs the event, and turns the result into a
//! success or error frame. Nothing here fails the connection.

use crate::client::ClientHandle;
use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::fs::VirtualFileSystem;
use crate::lsp::LanguageServerPool;
use crate::models::{Envelope, Frame, SearchOptions};
use crate::ports::PortMappingManager;
use crate::terminal::TerminalRegistry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io;
use std::sync::Arc;
use tracing::debug;

/// Managers shared by every connection.
#[derive(Clone)]
pub struct AppState {
    pub vfs: Arc<VirtualFileSystem>,
    pub lsp: LanguageServerPool,
    pub terminals: TerminalRegistry,
    pub ports: Arc<PortMappingManager>,
}

impl AppState {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            vfs: Arc::new(VirtualFileSystem::new(config)),
            lsp: LanguageServerPool::new(&config.root),
            terminals: TerminalRegistry::new(config.shell.clone(), &config.root),
            ports: Arc::new(PortMappingManager::new(config.proxy.clone())),
        }
    }
}

#[allow(dead_code)]
fn assert_app_state_bounds() {
    fn assert_state<T: Clone + Send + Sync + 'static>() {}
    assert_state::<AppState>();
}

#[derive(Deserialize)]
struct PathPayload {
    path: String,
}

#[derive(Deserialize)]
struct WriteFilePayload {
    path: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePayload {
    directory_path: String,
    name: String,
    #[serde(default)]
    is_directory: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenamePayload {
    path: String,
    new_name: String,
}

#[derive(Deserialize)]
struct DeletePayload {
    paths: Vec<String>,
}

#[derive(Deserialize)]
struct TransferPayload {
    source: String,
    destination: String,
}

#[derive(Deserialize)]
struct BatchPayload {
    sources: Vec<String>,
    destination: String,
}

#[derive(Deserialize)]
struct SearchTextPayload {
    query: String,
    #[serde(flatten)]
    options: SearchOptions,
}

#[derive(Deserialize)]
struct QueryPayload {
    query: String,
}

#[derive(Deserialize)]
struct TerminalIdPayload {
    id: String,
}

#[derive(Deserialize)]
struct RunCommandPayload {
    id: String,
    command: String,
}

#[derive(Deserialize)]
struct ResizePayload {
    id: String,
    cols: u16,
    rows: u16,
}

#[derive(Clone)]
pub struct BridgeRouter {
    state: AppState,
}

impl BridgeRouter {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Handle one raw text frame from `client` and build the reply.
    pub async fn handle_text(&self, text: &str, client: &ClientHandle) -> Frame {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => self.dispatch(envelope, client).await,
            Err(e) => {
                debug!(connection = %client.id(), error = %e, "malformed envelope");
                Frame::failure(None, None, format!("Malformed message: {e}"))
            }
        }
    }

    pub async fn dispatch(&self, envelope: Envelope, client: &ClientHandle) -> Frame {
        let Envelope {
            kind,
            event,
            payload,
        } = envelope;
        debug!(connection = %client.id(), %kind, %event, "dispatching");

        let result = match kind.as_str() {
            "fs" => self.handle_fs(&event, payload).await,
            "lsp" => self.handle_lsp(&event),
            "terminal" => self.handle_terminal(&event, payload, client).await,
            _ => return Frame::failure(None, None, "Invalid request type"),
        };

        match result {
            Ok(value) => Frame::ok(&kind, &event, value),
            Err(error) => {
                debug!(connection = %client.id(), %kind, %event, %error, "request failed");
                Frame::failure(Some(&kind), Some(&event), error.to_string())
            }
        }
    }

    async fn handle_fs(&self, event: &str, payload: Value) -> BridgeResult<Value> {
        match event {
            "listTree" => self.blocking(|vfs| vfs.list_tree()).await,
            "readFile" => {
                let PathPayload { path } = parse(payload)?;
                self.blocking(move |vfs| {
                    let content = vfs.read_file(&path)?;
                    Ok(json!({ "path": path, "content": content }))
                })
                .await
            }
            "writeFile" => {
                let p: WriteFilePayload = parse(payload)?;
                self.blocking(move |vfs| vfs.write_file(&p.path, &p.content)).await
            }
            "create" => {
                let p: CreatePayload = parse(payload)?;
                self.blocking(move |vfs| vfs.create(&p.directory_path, &p.name, p.is_directory))
                    .await
            }
            "rename" => {
                let p: RenamePayload = parse(payload)?;
                self.blocking(move |vfs| vfs.rename(&p.path, &p.new_name)).await
            }
            "delete" => {
                let p: DeletePayload = parse(payload)?;
                self.blocking(move |vfs| Ok(vfs.delete(&p.paths))).await
            }
            "move" => {
                let p: TransferPayload = parse(payload)?;
                self.blocking(move |vfs| vfs.move_entry(&p.source, &p.destination)).await
            }
            "moveMany" => {
                let p: BatchPayload = parse(payload)?;
                self.blocking(move |vfs| vfs.move_many(&p.sources, &p.destination)).await
            }
            "copy" => {
                let p: TransferPayload = parse(payload)?;
                self.blocking(move |vfs| vfs.copy_entry(&p.source, &p.destination)).await
            }
            "copyMany" => {
                let p: BatchPayload = parse(payload)?;
                self.blocking(move |vfs| vfs.copy_many(&p.sources, &p.destination)).await
            }
            "searchText" => {
                let p: SearchTextPayload = parse(payload)?;
                self.blocking(move |vfs| vfs.search_text(&p.query, &p.options)).await
            }
            "searchFiles" => {
                let QueryPayload { query } = parse(payload)?;
                self.blocking(move |vfs| vfs.search_files(&query)).await
            }
            "export" => {
                self.blocking(|vfs| {
                    let path = vfs.export()?;
                    Ok(json!({ "path": path }))
                })
                .await
            }
            _ => Err(unknown_event("fs", event)),
        }
    }

    fn handle_lsp(&self, event: &str) -> BridgeResult<Value> {
        match event {
            "listSupported" => Ok(serde_json::to_value(self.state.lsp.supported())?),
            "listActive" => Ok(serde_json::to_value(self.state.lsp.active())?),
            _ => Err(unknown_event("lsp", event)),
        }
    }

    async fn handle_terminal(
        &self,
        event: &str,
        payload: Value,
        client: &ClientHandle,
    ) -> BridgeResult<Value> {
        let terminals = &self.state.terminals;
        match event {
            "create" => {
                let id = terminals.create(client)?;
                Ok(json!({ "id": id }))
            }
            "runCommand" => {
                let p: RunCommandPayload = parse(payload)?;
                terminals.run_command(&p.id, &p.command, client)?;
                Ok(json!({ "id": p.id }))
            }
            "resize" => {
                let p: ResizePayload = parse(payload)?;
                terminals.resize(&p.id, p.cols, p.rows, client)?;
                Ok(json!({ "id": p.id, "cols": p.cols, "rows": p.rows }))
            }
            "delete" => {
                let TerminalIdPayload { id } = parse(payload)?;
                terminals.delete(&id).await?;
                Ok(json!({ "id": id }))
            }
            "list" => Ok(json!({ "ids": terminals.list() })),
            _ => Err(unknown_event("terminal", event)),
        }
    }

    /// Run synchronous filesystem work off the async workers.
    async fn blocking<F, T>(&self, work: F) -> BridgeResult<Value>
    where
        F: FnOnce(&VirtualFileSystem) -> BridgeResult<T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let vfs = self.state.vfs.clone();
        let value = tokio::task::spawn_blocking(move || work(&vfs))
            .await
            .map_err(|e| BridgeError::Io(io::Error::other(e.to_string())))??;
        Ok(serde_json::to_value(value)?)
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> BridgeResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| BridgeError::InvalidRequest(format!("invalid payload: {e}")))
}

fn unknown_event(kind: &str, event: &str) -> BridgeError {
    BridgeError::UnknownEvent {
        kind: kind.to_string(),
        event: event.to_string(),
    }
}
