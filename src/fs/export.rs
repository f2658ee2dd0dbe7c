use super::{normalize, VirtualFileSystem};
use crate::errors::{BridgeError, BridgeResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::PathBuf;
use tracing::info;

impl VirtualFileSystem {
    /// Write the whole workspace as a gzipped tarball to the configured export
    /// path and return that path. Entries are stored relative to the root.
    pub fn export(&self) -> BridgeResult<PathBuf> {
        let output = normalize(&self.export_path);
        if output.starts_with(&self.root) {
            return Err(BridgeError::InvalidRequest(format!(
                "export path {} must be outside the workspace",
                output.display()
            )));
        }
        fs::create_dir_all(&self.root)?;
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(&output)?;
        let mut archive = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        archive.follow_symlinks(false);
        archive.append_dir_all(".", &self.root)?;
        archive.into_inner()?.finish()?;

        info!(root = %self.root.display(), output = %output.display(), "exported workspace");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use flate2::read::GzDecoder;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    #[test]
    fn export_writes_a_readable_tarball() {
        let workspace = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::create_dir_all(workspace.path().join("src")).unwrap();
        fs::write(workspace.path().join("src/lib.rs"), "pub fn f() {}").unwrap();
        fs::write(workspace.path().join("README.md"), "# hi").unwrap();

        let mut config = BridgeConfig::for_root(workspace.path());
        config.export_path = out.path().join("nested/export.tar.gz");
        let vfs = VirtualFileSystem::new(&config);

        let path = vfs.export().unwrap();
        assert_eq!(path, out.path().join("nested/export.tar.gz"));

        let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(&path).unwrap()));
        let names: BTreeSet<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .map(|p| p.trim_start_matches("./").trim_end_matches('/').to_string())
            .collect();
        assert!(names.contains("src/lib.rs"), "{names:?}");
        assert!(names.contains("README.md"), "{names:?}");
    }

    #[test]
    fn export_inside_root_is_rejected() {
        let workspace = TempDir::new().unwrap();
        let mut config = BridgeConfig::for_root(workspace.path());
        config.export_path = workspace.path().join("out.tar.gz");
        let vfs = VirtualFileSystem::new(&config);
        assert!(matches!(vfs.export(), Err(BridgeError::InvalidRequest(_))));
    }

    #[test]
    fn links_are_archived_as_links() {
        let workspace = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "TOP SECRET").unwrap();
        std::os::unix::fs::symlink(outside.path(), workspace.path().join("ext")).unwrap();

        let mut config = BridgeConfig::for_root(workspace.path());
        config.export_path = out.path().join("export.tar.gz");
        let path = VirtualFileSystem::new(&config).export().unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(&path).unwrap()));
        let mut saw_link = false;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            assert!(!name.contains("secret.txt"), "followed a link: {name}");
            if name.trim_start_matches("./") == "ext" {
                assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
                saw_link = true;
            }
        }
        assert!(saw_link);
    }
}
