//! Disposable writable copies of edit targets.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cleanup;
use crate::error::{SandboxError, SandboxResult};

/// A materialized overlay directory.
///
/// The overlay exclusively owns its directory on disk. [`Overlay::remove`]
/// deletes it; if an overlay is dropped without being removed (a panic
/// unwinding through a session, for instance) the directory is still
/// deleted on drop.
#[derive(Debug)]
pub struct Overlay {
    original: PathBuf,
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Overlay {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn original(&self) -> &Path {
        &self.original
    }

    /// Whether the overlay directory is still owned (not yet removed).
    pub fn is_present(&self) -> bool {
        self.dir.is_some()
    }

    /// Delete the overlay directory. Calling this again is a no-op.
    pub fn remove(&mut self) -> io::Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        if dir.close().is_ok() {
            return Ok(());
        }
        cleanup::force_remove(&self.path)
    }
}

/// Copy `original` into a fresh, uniquely named directory under `root`.
///
/// On failure nothing is left under `root`.
pub fn materialize(original: &Path, root: &Path) -> SandboxResult<Overlay> {
    materialize_with(original, root, copy_tree)
}

pub(crate) fn materialize_with<F>(original: &Path, root: &Path, copy: F) -> SandboxResult<Overlay>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    let canonical_root = check_root(original, root)?;
    fs::create_dir_all(&canonical_root)
        .map_err(|err| SandboxError::materialization(original, err))?;

    let dir = tempfile::Builder::new()
        .prefix(&overlay_prefix(original))
        .tempdir_in(&canonical_root)
        .map_err(|err| SandboxError::materialization(original, err))?;

    let mut overlay = Overlay {
        original: original.to_path_buf(),
        path: dir.path().to_path_buf(),
        dir: Some(dir),
    };

    if let Err(err) = copy(original, overlay.path()) {
        let reason = match overlay.remove() {
            Ok(()) => err.to_string(),
            Err(cleanup_err) => format!(
                "{err}; partial overlay {} could not be removed: {cleanup_err}",
                overlay.path().display()
            ),
        };
        return Err(SandboxError::materialization(original, reason));
    }

    info!(
        original = %original.display(),
        overlay = %overlay.path().display(),
        "materialized overlay"
    );

    Ok(overlay)
}

/// Resolve the overlay root and make sure it lies outside `original`, so an
/// overlay can never be nested in the directory it copies.
pub(crate) fn check_root(original: &Path, root: &Path) -> SandboxResult<PathBuf> {
    let canonical_original =
        fs::canonicalize(original).map_err(|err| SandboxError::materialization(original, err))?;
    let canonical_root =
        resolve_root(root).map_err(|err| SandboxError::materialization(original, err))?;
    if canonical_root.starts_with(&canonical_original) {
        return Err(SandboxError::materialization(
            original,
            format!(
                "overlay root {} is inside the edit target",
                canonical_root.display()
            ),
        ));
    }
    Ok(canonical_root)
}

/// Canonicalize `root`, which may not exist yet, by resolving its nearest
/// existing ancestor.
fn resolve_root(root: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(root)?;
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    while !existing.exists() {
        let Some(parent) = existing.parent() else {
            break;
        };
        if let Some(name) = existing.file_name() {
            missing.push(name.to_os_string());
        }
        existing = parent;
    }
    let mut resolved = fs::canonicalize(existing)?;
    resolved.extend(missing.into_iter().rev());
    Ok(resolved)
}

fn overlay_prefix(original: &Path) -> String {
    let name = original
        .file_name()
        .map(|name| name.to_string_lossy().replace('/', "_"))
        .unwrap_or_else(|| "root".to_string());
    format!("{name}_overlay_")
}

/// Recursively copy `src` into the existing directory `dst`, preserving
/// permissions, file modification times and symlink targets.
///
/// Entries that cannot be read for lack of permission are skipped, matching
/// how the snapshot store records them.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let mut directories = Vec::new();

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if is_permission_denied(&err) => {
                warn!(path = ?err.path(), "skipping unreadable entry");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target)?;
            directories.push((target, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else if file_type.is_file() {
            match copy_file(entry.path(), &target) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    // Never materialized; drop any empty file we created.
                    let _ = fs::remove_file(&target);
                    warn!(path = %entry.path().display(), "skipping unreadable file");
                }
                Err(err) => return Err(err),
            }
        } else {
            debug!(path = %entry.path().display(), "skipping special file");
        }
    }

    // Children before parents, so a locked parent does not block them.
    for (directory, permissions) in directories.into_iter().rev() {
        fs::set_permissions(directory, permissions)?;
    }
    fs::set_permissions(dst, fs::metadata(src)?.permissions())?;

    Ok(())
}

fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut reader = File::open(src)?;
    let metadata = reader.metadata()?;
    let mut writer = File::create(dst)?;
    io::copy(&mut reader, &mut writer)?;
    writer.set_modified(metadata.modified()?)?;
    drop(writer);
    fs::set_permissions(dst, metadata.permissions())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(windows)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    if fs::metadata(src).map(|m| m.is_dir()).unwrap_or(false) {
        std::os::windows::fs::symlink_dir(target, dst)
    } else {
        std::os::windows::fs::symlink_file(target, dst)
    }
}

fn is_permission_denied(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|err| err.kind() == io::ErrorKind::PermissionDenied)
}
