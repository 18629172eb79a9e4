use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SandboxError, SandboxResult};
use crate::sandbox::EditTarget;
use crate::snapshot::{self, CaptureWarning, Entry, Snapshot};

/// Kind of change detected for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiffKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiffKind::Added => "Added",
            DiffKind::Modified => "Modified",
            DiffKind::Deleted => "Deleted",
        };
        f.write_str(label)
    }
}

/// One detected change, relative to the edit target's root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub relative_path: PathBuf,
    pub kind: DiffKind,
}

impl DiffEntry {
    pub fn new(relative_path: impl Into<PathBuf>, kind: DiffKind) -> Self {
        Self {
            relative_path: relative_path.into(),
            kind,
        }
    }

    pub fn added(relative_path: impl Into<PathBuf>) -> Self {
        Self::new(relative_path, DiffKind::Added)
    }

    pub fn modified(relative_path: impl Into<PathBuf>) -> Self {
        Self::new(relative_path, DiffKind::Modified)
    }

    pub fn deleted(relative_path: impl Into<PathBuf>) -> Self {
        Self::new(relative_path, DiffKind::Deleted)
    }
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.relative_path.display())
    }
}

/// Post-run comparison of one overlay against its baseline
#[derive(Debug, Clone, Default)]
pub struct TargetDiff {
    pub entries: Vec<DiffEntry>,
    /// Whether names or contents changed, ignoring modification times.
    pub content_changed: bool,
    pub warnings: Vec<CaptureWarning>,
}

/// Compare a materialized edit target's overlay against its baseline snapshot.
pub fn diff(target: &EditTarget) -> SandboxResult<TargetDiff> {
    let overlay = target.overlay_path().ok_or_else(|| {
        SandboxError::InvalidState(format!(
            "{} has no overlay to diff",
            target.original_path.display()
        ))
    })?;
    let baseline = target.snapshot.as_deref().ok_or_else(|| {
        SandboxError::InvalidState(format!(
            "{} has no baseline snapshot",
            target.original_path.display()
        ))
    })?;
    diff_overlay(overlay, baseline)
}

/// Re-capture `overlay` and compare it against `baseline`.
pub fn diff_overlay(overlay: &Path, baseline: &Snapshot) -> SandboxResult<TargetDiff> {
    let capture = snapshot::capture(overlay)?;
    let entries = diff_snapshots(baseline, &capture.snapshot);
    let content_changed = baseline.digest() != capture.snapshot.digest();

    debug!(
        overlay = %overlay.display(),
        changes = entries.len(),
        content_changed,
        "diffed overlay"
    );

    Ok(TargetDiff {
        entries,
        content_changed,
        warnings: capture.warnings,
    })
}

/// Compute the changes from `before` to `after`, sorted by relative path.
///
/// Every path appears at most once. An empty directory only counts as added
/// or deleted if no directory existed at that path on the other side.
/// Baseline entries that could never be materialized (unreadable or special
/// files) are not reported as deleted. Baseline entries inside a directory
/// that `after` could not list are reported once, as that directory being
/// modified.
pub fn diff_snapshots(before: &Snapshot, after: &Snapshot) -> Vec<DiffEntry> {
    let mut changes = Vec::new();
    let mut hidden = BTreeSet::new();

    for (path, old) in before.entries() {
        match after.get(path) {
            Some(new) if new != old => changes.push(DiffEntry::modified(path)),
            Some(_) => {}
            None => {
                if let Some(dir) = after.unreadable_ancestor(path) {
                    hidden.insert(dir.to_path_buf());
                    continue;
                }
                if !old.is_materializable() {
                    continue;
                }
                if *old == Entry::EmptyDir && after.has_directory(path) {
                    continue;
                }
                changes.push(DiffEntry::deleted(path));
            }
        }
    }

    for (path, new) in after.entries() {
        if before.get(path).is_some() {
            continue;
        }
        if *new == Entry::EmptyDir && before.has_directory(path) {
            continue;
        }
        changes.push(DiffEntry::added(path));
    }
    changes.extend(hidden.into_iter().map(DiffEntry::modified));

    changes.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    changes
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::snapshot::capture;

    fn snap(root: &Path) -> Snapshot {
        capture(root).unwrap().snapshot
    }

    #[test]
    fn untouched_tree_has_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let before = snap(dir.path());
        let after = snap(dir.path());

        assert!(diff_snapshots(&before, &after).is_empty());
    }

    #[test]
    fn detects_each_kind_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("keep.txt"), "same").unwrap();
        fs::write(root.join("edit.txt"), "before").unwrap();
        fs::write(root.join("gone.txt"), "bye").unwrap();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/edit.txt"), "1").unwrap();
        let before = snap(root);

        fs::write(root.join("edit.txt"), "after, and longer").unwrap();
        fs::remove_file(root.join("gone.txt")).unwrap();
        fs::write(root.join("new.txt"), "hi").unwrap();
        fs::write(root.join("sub/edit.txt"), "2").unwrap();
        fs::create_dir_all(root.join("made/deep")).unwrap();
        let after = snap(root);

        assert_eq!(
            diff_snapshots(&before, &after),
            vec![
                DiffEntry::modified("edit.txt"),
                DiffEntry::deleted("gone.txt"),
                DiffEntry::added("made/deep"),
                DiffEntry::added("new.txt"),
                DiffEntry::modified("sub/edit.txt"),
            ]
        );
    }

    #[test]
    fn filling_an_empty_directory_is_not_a_deletion() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        let before = snap(dir.path());

        fs::write(dir.path().join("empty/file"), "x").unwrap();
        let after = snap(dir.path());

        assert_eq!(
            diff_snapshots(&before, &after),
            vec![DiffEntry::added("empty/file")]
        );
    }

    #[test]
    fn emptying_a_directory_is_not_an_addition() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("full")).unwrap();
        fs::write(dir.path().join("full/file"), "x").unwrap();
        let before = snap(dir.path());

        fs::remove_file(dir.path().join("full/file")).unwrap();
        let after = snap(dir.path());

        assert_eq!(
            diff_snapshots(&before, &after),
            vec![DiffEntry::deleted("full/file")]
        );
    }

    #[test]
    fn removing_an_empty_directory_is_a_deletion() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        let before = snap(dir.path());

        fs::remove_dir(dir.path().join("empty")).unwrap();
        let after = snap(dir.path());

        assert_eq!(
            diff_snapshots(&before, &after),
            vec![DiffEntry::deleted("empty")]
        );
    }

    #[test]
    fn replacing_a_file_with_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x"), "file").unwrap();
        let before = snap(dir.path());

        fs::remove_file(dir.path().join("x")).unwrap();
        fs::create_dir(dir.path().join("x")).unwrap();
        fs::write(dir.path().join("x/y"), "nested").unwrap();
        let after = snap(dir.path());

        assert_eq!(
            diff_snapshots(&before, &after),
            vec![DiffEntry::deleted("x"), DiffEntry::added("x/y")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn retargeted_symlink_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("one", dir.path().join("link")).unwrap();
        let before = snap(dir.path());

        fs::remove_file(dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink("two", dir.path().join("link")).unwrap();
        let after = snap(dir.path());

        assert_eq!(
            diff_snapshots(&before, &after),
            vec![DiffEntry::modified("link")]
        );
    }

    #[test]
    fn same_size_rewrite_is_caught_by_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();
        let before = snap(dir.path());
        let modified = fs::metadata(&file).unwrap().modified().unwrap();

        fs::write(&file, "y").unwrap();
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        let after = snap(dir.path());

        assert_eq!(
            diff_snapshots(&before, &after),
            vec![DiffEntry::modified("a.txt")]
        );
    }

    #[test]
    fn diff_overlay_reports_content_change() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        let before = snap(dir.path());

        let unchanged = diff_overlay(dir.path(), &before).unwrap();
        assert!(unchanged.entries.is_empty());
        assert!(!unchanged.content_changed);

        fs::write(dir.path().join("a.txt"), "y").unwrap();
        let changed = diff_overlay(dir.path(), &before).unwrap();
        assert_eq!(changed.entries, vec![DiffEntry::modified("a.txt")]);
        assert!(changed.content_changed);
    }

    #[cfg(unix)]
    #[test]
    fn unlistable_directory_is_modified_not_deleted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("locked/deep")).unwrap();
        fs::write(dir.path().join("locked/a.txt"), "a").unwrap();
        fs::write(dir.path().join("locked/deep/b.txt"), "b").unwrap();
        fs::write(dir.path().join("other.txt"), "c").unwrap();
        let before = snap(dir.path());

        let locked = dir.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        // Root ignores permission bits; nothing to observe in that case.
        let after = fs::read_dir(&locked).is_err().then(|| snap(dir.path()));
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        let Some(after) = after else {
            return;
        };

        assert_eq!(
            diff_snapshots(&before, &after),
            vec![DiffEntry::modified("locked")]
        );
        assert_ne!(before.digest(), after.digest());
    }

    #[test]
    fn target_without_overlay_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = EditTarget::new(dir.path());
        target.snapshot = Some(std::sync::Arc::new(snap(dir.path())));

        let err = diff(&target).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState(_)));
    }

    #[test]
    fn target_diff_compares_overlay_to_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        let mut target = EditTarget::new(dir.path());
        target.snapshot = Some(std::sync::Arc::new(snap(dir.path())));
        target.overlay = Some(crate::overlay::materialize(dir.path(), root.path()).unwrap());
        let overlay = target.overlay_path().unwrap().to_path_buf();
        fs::write(overlay.join("b.txt"), "new").unwrap();
        fs::remove_file(overlay.join("a.txt")).unwrap();

        let result = diff(&target).unwrap();

        assert_eq!(
            result.entries,
            vec![DiffEntry::deleted("a.txt"), DiffEntry::added("b.txt")]
        );
        assert!(result.content_changed);
        assert!(dir.path().join("a.txt").exists());
    }

    #[test]
    fn entries_render_with_kind_prefix() {
        assert_eq!(DiffEntry::deleted("old.txt").to_string(), "Deleted: old.txt");
    }
}
