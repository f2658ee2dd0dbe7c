//! Workspace filesystem operations.
//!
//! Every path handed in by a client is resolved against the workspace root and
//! rejected if it escapes it. Nodes are rebuilt from a fresh stat on every call;
//! nothing is cached between requests. All methods are blocking and are meant to
//! be driven from `spawn_blocking`.

mod export;
mod search;

use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::models::{BatchEntry, DeleteFailure, DeleteReport, File};
use chrono::{DateTime, Utc};
use glob::MatchOptions;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct VirtualFileSystem {
    root: PathBuf,
    excluded_dirs: Vec<PathBuf>,
    export_path: PathBuf,
}

impl VirtualFileSystem {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            root: normalize(&config.root),
            excluded_dirs: config.excluded_dirs.iter().map(PathBuf::from).collect(),
            export_path: config.export_path.clone(),
        }
    }

    /// Resolve a client path to an absolute path under the root, following a
    /// symlink in the final position.
    ///
    /// Relative paths are taken relative to the root. `.` and `..` are folded
    /// lexically, then the deepest existing prefix is canonicalized so a symlink
    /// cannot lead out of the root.
    pub fn resolve(&self, path: &str) -> BridgeResult<PathBuf> {
        let resolved = self.resolve_lexically(path)?;
        self.confine(&resolved, true)?;
        Ok(resolved)
    }

    /// Like [`resolve`](Self::resolve), but the final component names the entry
    /// itself. A symlink there is acted on as a link, so its target is not checked.
    pub fn resolve_entry(&self, path: &str) -> BridgeResult<PathBuf> {
        let resolved = self.resolve_lexically(path)?;
        self.confine(&resolved, resolved == self.root)?;
        Ok(resolved)
    }

    fn resolve_lexically(&self, path: &str) -> BridgeResult<PathBuf> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let resolved = normalize(&joined);
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(BridgeError::OutsideSandbox(joined))
        }
    }

    /// Reject `path` when the deepest existing prefix of it (or of its parent,
    /// unless `follow_last`) really lives outside the root. A dangling symlink on
    /// the way is rejected too, since writing through it would create its target.
    fn confine(&self, path: &Path, follow_last: bool) -> BridgeResult<()> {
        let real_root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let mut candidate = if follow_last { Some(path) } else { path.parent() };

        while let Some(current) = candidate {
            if !current.starts_with(&self.root) {
                break;
            }
            match fs::canonicalize(current) {
                Ok(real) if real.starts_with(&real_root) => return Ok(()),
                Ok(_) => return Err(BridgeError::OutsideSandbox(path.to_path_buf())),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if current.symlink_metadata().is_ok() {
                        return Err(BridgeError::OutsideSandbox(path.to_path_buf()));
                    }
                    candidate = current.parent();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn list_tree(&self) -> BridgeResult<File> {
        fs::create_dir_all(&self.root)?;
        self.build_node(&self.root)
    }

    fn build_node(&self, path: &Path) -> BridgeResult<File> {
        let mut node = stat(path)?;
        if node.is_directory {
            let mut children = Vec::new();
            for entry in expand(path)? {
                match self.build_node(&entry) {
                    Ok(child) => children.push(child),
                    // Entry vanished between the listing and the stat.
                    Err(error) => debug!(path = %entry.display(), %error, "skipping entry"),
                }
            }
            node.children = Some(children);
        }
        Ok(node)
    }

    pub fn read_file(&self, path: &str) -> BridgeResult<String> {
        let path = self.resolve(path)?;
        Ok(fs::read_to_string(path)?)
    }

    pub fn write_file(&self, path: &str, content: &str) -> BridgeResult<File> {
        let path = self.resolve(path)?;
        fs::write(&path, content)?;
        Ok(stat(&path)?)
    }

    pub fn create(&self, directory: &str, name: &str, is_directory: bool) -> BridgeResult<File> {
        validate_name(name)?;
        let target = self.resolve(directory)?.join(name);

        if is_directory {
            fs::create_dir_all(&target)?;
        } else {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .map_err(|e| already_exists_or(e, &target))?;
        }

        info!(path = %target.display(), is_directory, "created entry");
        Ok(stat(&target)?)
    }

    pub fn rename(&self, path: &str, new_name: &str) -> BridgeResult<File> {
        validate_name(new_name)?;
        let source = self.resolve_entry(path)?;
        if source == self.root {
            return Err(BridgeError::InvalidRequest(
                "the workspace root cannot be renamed".into(),
            ));
        }
        let parent = source.parent().unwrap_or(&self.root);
        let target = parent.join(new_name);

        if target.symlink_metadata().is_ok() {
            return Err(BridgeError::AlreadyExists(target));
        }
        fs::rename(&source, &target)?;

        info!(from = %source.display(), to = %target.display(), "renamed entry");
        Ok(stat(&target)?)
    }

    /// Delete every path independently. One failure never stops the rest.
    pub fn delete(&self, paths: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        for path in paths {
            match self.delete_one(path) {
                Ok(()) => report.deleted.push(path.clone()),
                Err(error) => {
                    warn!(%path, %error, "failed to delete entry");
                    report.failed.push(DeleteFailure {
                        path: path.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }
        report
    }

    fn delete_one(&self, path: &str) -> BridgeResult<()> {
        let target = self.resolve_entry(path)?;
        if target == self.root {
            return Err(BridgeError::InvalidRequest(
                "the workspace root cannot be deleted".into(),
            ));
        }
        let meta = fs::symlink_metadata(&target)?;
        if meta.is_dir() {
            fs::remove_dir_all(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
        info!(path = %target.display(), "deleted entry");
        Ok(())
    }

    /// Move `source` next to `destination`, keeping its own name.
    pub fn move_entry(&self, source: &str, destination: &str) -> BridgeResult<File> {
        let source = self.resolve_entry(source)?;
        let destination = self.resolve_entry(destination)?;
        let directory = destination.parent().unwrap_or(&self.root).to_path_buf();
        self.relocate(&source, &directory)
    }

    pub fn move_many(&self, sources: &[String], destination: &str) -> BridgeResult<Vec<BatchEntry>> {
        let directory = self.require_directory(destination)?;
        Ok(sources
            .iter()
            .map(|source| {
                let outcome = self
                    .resolve_entry(source)
                    .and_then(|path| self.relocate(&path, &directory));
                batch_entry(source, outcome)
            })
            .collect())
    }

    fn relocate(&self, source: &Path, directory: &Path) -> BridgeResult<File> {
        let name = entry_name(source)?;
        let target = self.resolve_entry(&directory.join(name).to_string_lossy())?;
        if target == source {
            return Ok(stat(&target)?);
        }
        if target.symlink_metadata().is_ok() {
            return Err(BridgeError::AlreadyExists(target));
        }
        fs::rename(source, &target)?;
        info!(from = %source.display(), to = %target.display(), "moved entry");
        Ok(stat(&target)?)
    }

    /// Copy `source` into the `destination` directory under a free name.
    pub fn copy_entry(&self, source: &str, destination: &str) -> BridgeResult<File> {
        let source = self.resolve_entry(source)?;
        let destination = self.resolve(destination)?;
        self.copy_into(&source, &destination)
    }

    pub fn copy_many(&self, sources: &[String], destination: &str) -> BridgeResult<Vec<BatchEntry>> {
        let directory = self.require_directory(destination)?;
        Ok(sources
            .iter()
            .map(|source| {
                let outcome = self
                    .resolve_entry(source)
                    .and_then(|path| self.copy_into(&path, &directory));
                batch_entry(source, outcome)
            })
            .collect())
    }

    fn copy_into(&self, source: &Path, directory: &Path) -> BridgeResult<File> {
        if directory.starts_with(source) {
            return Err(BridgeError::InvalidRequest(format!(
                "cannot copy {} into itself",
                source.display()
            )));
        }
        let name = entry_name(source)?;
        let target = unique_target(directory, &name);
        copy_recursive(source, &target)?;
        info!(from = %source.display(), to = %target.display(), "copied entry");
        Ok(stat(&target)?)
    }

    fn require_directory(&self, path: &str) -> BridgeResult<PathBuf> {
        let directory = self.resolve(path)?;
        match fs::metadata(&directory) {
            Ok(meta) if meta.is_dir() => Ok(directory),
            _ => Err(BridgeError::NotADirectory(directory)),
        }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        self.excluded_dirs
            .iter()
            .any(|prefix| relative.starts_with(prefix))
    }
}

/// Build a node for `path` without following symlinks.
pub(crate) fn stat(path: &Path) -> io::Result<File> {
    let meta = fs::symlink_metadata(path)?;
    let is_symlink = meta.file_type().is_symlink();
    let is_directory = meta.is_dir();

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    let extension = if is_directory {
        None
    } else {
        path.extension().map(|e| e.to_string_lossy().into_owned())
    };

    Ok(File {
        name,
        absolute_path: path.to_string_lossy().into_owned(),
        is_directory,
        is_file: meta.is_file(),
        is_symlink,
        extension,
        size_in_bytes: (!is_directory).then(|| meta.len()),
        modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
        created_at: meta.created().ok().map(DateTime::<Utc>::from),
        children: is_directory.then(Vec::new),
    })
}

/// Single-level glob expansion of `dir/*`, dotfiles included, in path order.
pub(crate) fn expand(dir: &Path) -> BridgeResult<Vec<PathBuf>> {
    let pattern = format!(
        "{}/*",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let mut entries = Vec::new();
    for entry in glob::glob_with(&pattern, options).map_err(|e| BridgeError::Glob(e.to_string()))? {
        match entry {
            Ok(path) => entries.push(path),
            Err(error) => debug!(%error, "unreadable entry during expansion"),
        }
    }
    entries.sort();
    Ok(entries)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn validate_name(name: &str) -> BridgeResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0');
    if bad {
        return Err(BridgeError::InvalidRequest(format!("invalid name '{name}'")));
    }
    Ok(())
}

fn entry_name(path: &Path) -> BridgeResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BridgeError::InvalidRequest(format!("{} has no name", path.display())))
}

fn already_exists_or(error: io::Error, path: &Path) -> BridgeError {
    if error.kind() == io::ErrorKind::AlreadyExists {
        BridgeError::AlreadyExists(path.to_path_buf())
    } else {
        BridgeError::Io(error)
    }
}

fn batch_entry(path: &str, outcome: BridgeResult<File>) -> BatchEntry {
    match outcome {
        Ok(file) => BatchEntry {
            path: path.to_string(),
            file: Some(file),
            error: None,
        },
        Err(error) => {
            warn!(%path, %error, "batch item failed");
            BatchEntry {
                path: path.to_string(),
                file: None,
                error: Some(error.to_string()),
            }
        }
    }
}

/// `name`, then `name 1`, `name 2`, ... until nothing exists at that path.
fn unique_target(directory: &Path, name: &str) -> PathBuf {
    let mut candidate = directory.join(name);
    let mut suffix = 1;
    while candidate.symlink_metadata().is_ok() {
        candidate = directory.join(format!("{name} {suffix}"));
        suffix += 1;
    }
    candidate
}

fn copy_recursive(source: &Path, target: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        let link = fs::read_link(source)?;
        return std::os::unix::fs::symlink(link, target);
    }

    if meta.is_dir() {
        fs::create_dir_all(target)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else {
        fs::copy(source, target)?;
    }
    if let Err(error) = preserve_times(target, &meta) {
        debug!(path = %target.display(), %error, "could not preserve timestamps");
    }
    Ok(())
}

fn preserve_times(path: &Path, meta: &fs::Metadata) -> io::Result<()> {
    let mut times = fs::FileTimes::new();
    if let Ok(modified) = meta.modified() {
        times = times.set_modified(modified);
    }
    if let Ok(accessed) = meta.accessed() {
        times = times.set_accessed(accessed);
    }
    fs::File::open(path)?.set_times(times)
}
