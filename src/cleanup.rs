//! Removal of materialized overlays.
//!
//! Teardown is best effort per target: a failure on one overlay is recorded
//! and the remaining overlays are still removed. Each overlay is taken out of
//! its [`EditTarget`] before removal, so a second teardown finds nothing to do.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
#[cfg(not(unix))]
use walkdir::WalkDir;

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::EditTarget;

/// An overlay that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Residue left behind by a teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn record(&mut self, path: PathBuf, reason: impl ToString) {
        self.failures.push(CleanupFailure {
            path,
            reason: reason.to_string(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} overlay(s) left behind", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{} ({})", failure.path.display(), failure.reason)?;
        }
        Ok(())
    }
}

/// Remove every overlay still owned by `targets`.
///
/// Returns the number of overlays removed, or `CleanupIncomplete` listing
/// every overlay that survived.
pub fn teardown(targets: &mut [EditTarget]) -> SandboxResult<usize> {
    let mut report = CleanupReport::default();
    let mut removed = 0;

    for target in targets.iter_mut() {
        let Some(mut overlay) = target.overlay.take() else {
            continue;
        };
        match overlay.remove() {
            Ok(()) => {
                debug!(
                    original = %target.original_path.display(),
                    overlay = %overlay.path().display(),
                    "removed overlay"
                );
                removed += 1;
            }
            Err(err) => {
                warn!(
                    overlay = %overlay.path().display(),
                    error = %err,
                    "failed to remove overlay"
                );
                report.record(overlay.path().to_path_buf(), err);
            }
        }
    }

    if report.is_empty() {
        Ok(removed)
    } else {
        Err(SandboxError::CleanupIncomplete(report))
    }
}

/// Recursively remove `path`, first restoring owner access to directories
/// the sandboxed command may have locked down. A missing path is not an
/// error.
pub(crate) fn force_remove(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    }

    restore_owner_access(path);

    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn restore_owner_access(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };
    if !metadata.is_dir() {
        return;
    }
    let mode = metadata.permissions().mode();
    if mode & 0o700 != 0o700 {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700));
    }
    if let Ok(children) = fs::read_dir(path) {
        for child in children.flatten() {
            restore_owner_access(&child.path());
        }
    }
}

#[cfg(not(unix))]
fn restore_owner_access(path: &Path) {
    for entry in WalkDir::new(path).into_iter().flatten() {
        if let Ok(metadata) = entry.metadata() {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                let _ = fs::set_permissions(entry.path(), permissions);
            }
        }
    }
}
