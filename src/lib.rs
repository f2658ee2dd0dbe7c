pub mod api;
pub mod client;
pub mod config;
pub mod errors;
pub mod fs;
pub mod lsp;
pub mod models;
pub mod ports;
pub mod router;
pub mod terminal;

pub use api::build_router;
pub use client::ClientHandle;
pub use config::{BridgeConfig, BridgeOptions};
pub use errors::{BridgeError, BridgeResult};
pub use fs::VirtualFileSystem;
pub use lsp::{LanguageServerPool, LspCommand, LspKind};
pub use ports::PortMappingManager;
pub use router::{AppState, BridgeRouter};
pub use terminal::TerminalRegistry;

pub use config::DEFAULT_PORT;
