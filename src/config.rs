//! Runtime configuration for the bridge.
//!
//! Every setting can come from a command-line flag or a `BRIDGE_*` environment
//! variable. [`BridgeOptions`] is the clap surface; [`BridgeConfig`] is the plain
//! value the managers consume, so tests can build one without going through clap.

use clap::Args;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 3030;
pub const DEFAULT_ROOT: &str = "/home/workspace";
pub const DEFAULT_EXPORT_PATH: &str = "/tmp/workspace-export.tar.gz";
pub const DEFAULT_NGINX_CONF_DIR: &str = "/etc/nginx/conf.d";
pub const DEFAULT_RELOAD_COMMAND: &str = "nginx -s reload";
pub const DEFAULT_UPSTREAM: &str = "127.0.0.1:3030";

pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    ".cache",
    ".npm",
    ".yarn",
    "target",
];

pub const DEFAULT_ALLOWED_PORTS: &[u16] = &[80, 3000, 3001, 4200, 5000, 5173, 8000, 8080, 8888];

#[derive(Args, Debug, Clone)]
pub struct BridgeOptions {
    /// Workspace root every filesystem operation is confined to
    #[arg(long, env = "BRIDGE_ROOT", default_value = DEFAULT_ROOT)]
    pub root: PathBuf,
    /// Address the HTTP server binds to
    #[arg(long, env = "BRIDGE_BIND", default_value = "0.0.0.0")]
    pub bind: String,
    /// Port for the HTTP server
    #[arg(long, env = "BRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Directories skipped by text and filename search, relative to the root
    #[arg(long, env = "BRIDGE_EXCLUDED_DIRS", value_delimiter = ',')]
    pub excluded_dirs: Option<Vec<String>>,
    /// Where `export` writes the workspace archive
    #[arg(long, env = "BRIDGE_EXPORT_PATH", default_value = DEFAULT_EXPORT_PATH)]
    pub export_path: PathBuf,
    /// Shell spawned for terminal sessions
    #[arg(long, env = "BRIDGE_SHELL")]
    pub shell: Option<String>,
    /// Directory holding one reverse-proxy file per port mapping
    #[arg(long, env = "BRIDGE_NGINX_CONF_DIR", default_value = DEFAULT_NGINX_CONF_DIR)]
    pub nginx_conf_dir: PathBuf,
    /// Command run after every mapping change
    #[arg(long, env = "BRIDGE_RELOAD_COMMAND", default_value = DEFAULT_RELOAD_COMMAND)]
    pub reload_command: String,
    /// External ports that may be mapped
    #[arg(long, env = "BRIDGE_ALLOWED_PORTS", value_delimiter = ',')]
    pub allowed_ports: Option<Vec<u16>>,
    /// Upstream serving the `/_bridge` prefix
    #[arg(long, env = "BRIDGE_UPSTREAM", default_value = DEFAULT_UPSTREAM)]
    pub bridge_upstream: String,
    /// Upstream serving the `/_bridge_v2` prefix
    #[arg(long, env = "BRIDGE_TERMINAL_UPSTREAM", default_value = DEFAULT_UPSTREAM)]
    pub terminal_upstream: String,
    /// Directory used for logs
    #[arg(long, env = "BRIDGE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub root: PathBuf,
    pub bind: String,
    pub port: u16,
    pub excluded_dirs: Vec<String>,
    pub export_path: PathBuf,
    pub shell: String,
    pub proxy: ProxyConfig,
}

/// Settings owned by the port-mapping manager.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub conf_dir: PathBuf,
    pub reload_command: Vec<String>,
    pub allowed_ports: Vec<u16>,
    pub bridge_upstream: String,
    pub terminal_upstream: String,
}

impl BridgeConfig {
    /// Defaults rooted at `root`, with the proxy directory nested in `root/.nginx`.
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            excluded_dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect(),
            export_path: PathBuf::from(DEFAULT_EXPORT_PATH),
            shell: default_shell(),
            proxy: ProxyConfig {
                conf_dir: root.join(".nginx"),
                reload_command: split_command(DEFAULT_RELOAD_COMMAND),
                allowed_ports: DEFAULT_ALLOWED_PORTS.to_vec(),
                bridge_upstream: DEFAULT_UPSTREAM.to_string(),
                terminal_upstream: DEFAULT_UPSTREAM.to_string(),
            },
            root,
        }
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.bind, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {addr}: {e}"))
    }
}

impl From<BridgeOptions> for BridgeConfig {
    fn from(options: BridgeOptions) -> Self {
        Self {
            root: options.root,
            bind: options.bind,
            port: options.port,
            excluded_dirs: options.excluded_dirs.unwrap_or_else(|| {
                DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect()
            }),
            export_path: options.export_path,
            shell: options.shell.unwrap_or_else(default_shell),
            proxy: ProxyConfig {
                conf_dir: options.nginx_conf_dir,
                reload_command: split_command(&options.reload_command),
                allowed_ports: options
                    .allowed_ports
                    .unwrap_or_else(|| DEFAULT_ALLOWED_PORTS.to_vec()),
                bridge_upstream: options.bridge_upstream,
                terminal_upstream: options.terminal_upstream,
            },
        }
    }
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
