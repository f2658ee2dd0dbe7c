//! Reverse-proxy port mappings.
//!
//! The config directory is the only record of which ports are mapped: each
//! mapping is one `port-<internal>-<external>.conf` file, and listing parses the
//! directory back. Port 80 always keeps the bridge prefixes routed, either from
//! the combined mapping file or from `bridge-80.conf` when nothing is mapped there.

use crate::config::ProxyConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::models::PortMapping;
use std::io;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const BRIDGE_PORT: u16 = 80;
const BRIDGE_ONLY_FILE: &str = "bridge-80.conf";
const BRIDGE_PREFIX: &str = "/_bridge";
const TERMINAL_PREFIX: &str = "/_bridge_v2";

pub struct PortMappingManager {
    config: ProxyConfig,
    // Held across the file change and the reload that applies it.
    write_lock: Mutex<()>,
}

impl PortMappingManager {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn conf_dir(&self) -> &PathBuf {
        &self.config.conf_dir
    }

    pub async fn list_current_mapping(&self) -> BridgeResult<Vec<PortMapping>> {
        let mut entries = match tokio::fs::read_dir(&self.config.conf_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut mappings = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with("port-") {
                continue;
            }
            match parse_file_name(name) {
                Some(mapping) if self.is_allowed(mapping.external_port) => mappings.push(mapping),
                Some(mapping) => {
                    warn!(file = name, external = mapping.external_port, "skipping mapping on a port outside the allow-list")
                }
                None => warn!(file = name, "skipping malformed mapping file"),
            }
        }
        mappings.sort();
        Ok(mappings)
    }

    pub async fn list_available_external_ports(&self) -> BridgeResult<Vec<u16>> {
        let used: Vec<u16> = self
            .list_current_mapping()
            .await?
            .into_iter()
            .map(|m| m.external_port)
            .collect();
        Ok(self
            .config
            .allowed_ports
            .iter()
            .copied()
            .filter(|port| !used.contains(port))
            .collect())
    }

    pub async fn create(&self, internal: u16, external: u16, reload: bool) -> BridgeResult<PortMapping> {
        if internal == 0 {
            return Err(BridgeError::InvalidRequest("internal port must be non-zero".into()));
        }
        if !self.is_allowed(external) {
            return Err(BridgeError::InvalidRequest(format!(
                "external port {external} is not in the allow-list"
            )));
        }

        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self
            .list_current_mapping()
            .await?
            .into_iter()
            .find(|m| m.external_port == external)
        {
            return Err(BridgeError::AlreadyExists(
                self.mapping_path(existing.internal_port, existing.external_port),
            ));
        }

        tokio::fs::create_dir_all(&self.config.conf_dir).await?;
        let path = self.mapping_path(internal, external);
        let block = if external == BRIDGE_PORT {
            self.render_combined(internal)
        } else {
            render_mapping(internal, external)
        };
        tokio::fs::write(&path, block).await?;

        if external == BRIDGE_PORT {
            self.remove_if_present(self.bridge_only_path()).await?;
        }
        info!(internal, external, path = %path.display(), "port mapping created");

        if reload {
            self.reload().await?;
        }
        Ok(PortMapping {
            internal_port: internal,
            external_port: external,
        })
    }

    pub async fn delete(&self, internal: u16, external: u16, reload: bool) -> BridgeResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.mapping_path(internal, external);
        if !tokio::fs::try_exists(&path).await? {
            return Err(BridgeError::NotFound(format!(
                "port mapping {internal} -> {external}"
            )));
        }

        if external == BRIDGE_PORT {
            // Bridge routing goes in before the combined block comes out.
            tokio::fs::write(self.bridge_only_path(), self.render_bridge_only()).await?;
        }
        tokio::fs::remove_file(&path).await?;
        info!(internal, external, "port mapping deleted");

        if reload {
            self.reload().await?;
        }
        Ok(())
    }

    /// Write `bridge-80.conf` when nothing serves port 80. Returns whether a
    /// file was written.
    pub async fn ensure_bridge_routing(&self, reload: bool) -> BridgeResult<bool> {
        let _guard = self.write_lock.lock().await;
        let served = self
            .list_current_mapping()
            .await?
            .iter()
            .any(|m| m.external_port == BRIDGE_PORT);
        if served || tokio::fs::try_exists(self.bridge_only_path()).await? {
            return Ok(false);
        }

        tokio::fs::create_dir_all(&self.config.conf_dir).await?;
        tokio::fs::write(self.bridge_only_path(), self.render_bridge_only()).await?;
        info!(dir = %self.config.conf_dir.display(), "bridge routing installed on port 80");
        if reload {
            self.reload().await?;
        }
        Ok(true)
    }

    async fn reload(&self) -> BridgeResult<()> {
        let Some((program, args)) = self.config.reload_command.split_first() else {
            debug!("no reload command configured");
            return Ok(());
        };
        let command = self.config.reload_command.join(" ");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| BridgeError::ReloadFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            };
            warn!(%command, %message, "proxy reload failed");
            return Err(BridgeError::ReloadFailed { command, message });
        }
        debug!(%command, "proxy reloaded");
        Ok(())
    }

    async fn remove_if_present(&self, path: PathBuf) -> BridgeResult<()> {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_allowed(&self, port: u16) -> bool {
        self.config.allowed_ports.contains(&port)
    }

    fn mapping_path(&self, internal: u16, external: u16) -> PathBuf {
        self.config.conf_dir.join(file_name(internal, external))
    }

    fn bridge_only_path(&self) -> PathBuf {
        self.config.conf_dir.join(BRIDGE_ONLY_FILE)
    }

    fn bridge_locations(&self) -> String {
        format!(
            "{}{}",
            proxy_location(&format!("{BRIDGE_PREFIX}/"), &format!("{}/", self.config.bridge_upstream)),
            proxy_location(&format!("{TERMINAL_PREFIX}/"), &format!("{}/", self.config.terminal_upstream)),
        )
    }

    fn render_combined(&self, internal: u16) -> String {
        let locations = format!(
            "{}{}",
            self.bridge_locations(),
            proxy_location("/", &format!("127.0.0.1:{internal}"))
        );
        server_block(BRIDGE_PORT, &locations)
    }

    fn render_bridge_only(&self) -> String {
        let locations = format!(
            "{}    location / {{\n        return 404;\n    }}\n",
            self.bridge_locations()
        );
        server_block(BRIDGE_PORT, &locations)
    }
}

fn file_name(internal: u16, external: u16) -> String {
    format!("port-{internal}-{external}.conf")
}

fn parse_file_name(name: &str) -> Option<PortMapping> {
    let (internal, external) = name
        .strip_prefix("port-")?
        .strip_suffix(".conf")?
        .split_once('-')?;
    Some(PortMapping {
        internal_port: internal.parse().ok()?,
        external_port: external.parse().ok()?,
    })
}

fn render_mapping(internal: u16, external: u16) -> String {
    server_block(external, &proxy_location("/", &format!("127.0.0.1:{internal}")))
}

fn server_block(listen: u16, locations: &str) -> String {
    format!(
        "server {{\n    listen {listen};\n    listen [::]:{listen};\n    server_name _;\n\n{locations}}}\n"
    )
}

fn proxy_location(prefix: &str, upstream: &str) -> String {
    format!(
        "    location {prefix} {{\n        \
         proxy_pass http://{upstream};\n        \
         proxy_http_version 1.1;\n        \
         proxy_set_header Upgrade $http_upgrade;\n        \
         proxy_set_header Connection \"upgrade\";\n        \
         proxy_set_header Host $host;\n        \
         proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n        \
         proxy_read_timeout 86400;\n    }}\n\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, reload: &[&str]) -> PortMappingManager {
        let mut proxy = BridgeConfig::for_root(dir.path()).proxy;
        proxy.reload_command = reload.iter().map(|s| s.to_string()).collect();
        PortMappingManager::new(proxy)
    }

    #[test]
    fn file_names_parse_back() {
        assert_eq!(
            parse_file_name(&file_name(8080, 3000)),
            Some(PortMapping {
                internal_port: 8080,
                external_port: 3000
            })
        );
        assert_eq!(parse_file_name("port-80.conf"), None);
        assert_eq!(parse_file_name("port-a-80.conf"), None);
        assert_eq!(parse_file_name("port-1-2.txt"), None);
    }

    #[tokio::test]
    async fn create_list_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ports = manager(&dir, &["true"]);

        ports.create(8080, 3000, true).await.unwrap();
        assert_eq!(
            ports.list_current_mapping().await.unwrap(),
            vec![PortMapping {
                internal_port: 8080,
                external_port: 3000
            }]
        );
        assert!(!ports.list_available_external_ports().await.unwrap().contains(&3000));

        ports.delete(8080, 3000, true).await.unwrap();
        assert!(ports.list_current_mapping().await.unwrap().is_empty());
        assert!(ports.list_available_external_ports().await.unwrap().contains(&3000));
    }

    #[tokio::test]
    async fn deleting_port_80_keeps_bridge_routing() {
        let dir = TempDir::new().unwrap();
        let ports = manager(&dir, &["true"]);

        ports.create(8080, 80, true).await.unwrap();
        let combined = std::fs::read_to_string(ports.mapping_path(8080, 80)).unwrap();
        assert!(combined.contains("127.0.0.1:8080"));
        assert!(combined.contains("location /_bridge/"));
        assert!(combined.contains("location /_bridge_v2/"));
        assert!(!ports.bridge_only_path().exists());

        ports.delete(8080, 80, true).await.unwrap();
        assert!(!ports.mapping_path(8080, 80).exists());
        let remaining = std::fs::read_dir(ports.conf_dir()).unwrap().count();
        assert_eq!(remaining, 1);

        let bridge = std::fs::read_to_string(ports.bridge_only_path()).unwrap();
        assert!(bridge.contains("listen 80;"));
        assert!(bridge.contains("location /_bridge/"));
        assert!(bridge.contains("location /_bridge_v2/"));
        assert!(!bridge.contains("8080"));
    }

    #[tokio::test]
    async fn validation_errors() {
        let dir = TempDir::new().unwrap();
        let ports = manager(&dir, &[]);

        assert!(matches!(
            ports.create(8080, 9999, false).await,
            Err(BridgeError::InvalidRequest(_))
        ));
        ports.create(8080, 3000, false).await.unwrap();
        assert!(matches!(
            ports.create(9090, 3000, false).await,
            Err(BridgeError::AlreadyExists(_))
        ));
        assert!(matches!(
            ports.delete(9090, 3000, false).await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_and_unlisted_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let ports = manager(&dir, &[]);
        std::fs::create_dir_all(ports.conf_dir()).unwrap();
        std::fs::write(ports.conf_dir().join("port-x-3000.conf"), "").unwrap();
        std::fs::write(ports.conf_dir().join("port-5000-9999.conf"), "").unwrap();
        std::fs::write(ports.conf_dir().join("default.conf"), "").unwrap();
        std::fs::write(ports.conf_dir().join(file_name(4000, 4200)), "").unwrap();

        assert_eq!(
            ports.list_current_mapping().await.unwrap(),
            vec![PortMapping {
                internal_port: 4000,
                external_port: 4200
            }]
        );
    }

    #[tokio::test]
    async fn reload_failure_is_reported_separately() {
        let dir = TempDir::new().unwrap();
        let ports = manager(&dir, &["false"]);
        let err = ports.create(8080, 3000, true).await.unwrap_err();
        assert!(matches!(err, BridgeError::ReloadFailed { .. }));
        // The file change stays on disk even though it was not applied.
        assert_eq!(ports.list_current_mapping().await.unwrap().len(), 1);

        let missing = manager(&dir, &["/nonexistent/reload-binary"]);
        assert!(matches!(
            missing.delete(8080, 3000, true).await,
            Err(BridgeError::ReloadFailed { .. })
        ));
    }

    #[tokio::test]
    async fn bridge_routing_bootstrap_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ports = manager(&dir, &[]);

        assert!(ports.ensure_bridge_routing(false).await.unwrap());
        assert!(!ports.ensure_bridge_routing(false).await.unwrap());
        // Bridge-only routing is not a mapping.
        assert!(ports.list_current_mapping().await.unwrap().is_empty());
        assert!(ports.list_available_external_ports().await.unwrap().contains(&80));

        ports.create(3000, 80, false).await.unwrap();
        assert!(!ports.bridge_only_path().exists());
        assert!(!ports.ensure_bridge_routing(false).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_creates_on_one_port_admit_one() {
        let dir = TempDir::new().unwrap();
        let ports = std::sync::Arc::new(manager(&dir, &[]));

        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let ports = ports.clone();
                tokio::spawn(async move { ports.create(4000 + i, 5000, false).await })
            })
            .collect();
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(ports.list_current_mapping().await.unwrap().len(), 1);
    }
}
