use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cleanup::CleanupReport;
use crate::detector::{DiffEntry, TargetDiff};
use crate::runtime::RunOutcome;

/// Outcome of a completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub image: String,
    pub command: Vec<String>,
    pub user: String,
    pub started_at: DateTime<Utc>,
    pub exit_code: i32,
    pub interrupted: bool,
    /// Changes per edit target, keyed by the target's original path.
    pub diffs_by_target: BTreeMap<PathBuf, Vec<DiffEntry>>,
    /// Targets whose names or contents changed, as opposed to metadata only.
    pub changed_directories: Vec<PathBuf>,
    pub warnings: Vec<String>,
    pub cleanup_residue: Option<CleanupReport>,
}

impl SessionReport {
    pub fn new(
        session_id: Uuid,
        image: &str,
        command: &[String],
        user: &str,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Self {
        Self {
            session_id,
            image: image.to_string(),
            command: command.to_vec(),
            user: user.to_string(),
            started_at,
            exit_code: outcome.exit_code,
            interrupted: outcome.interrupted,
            diffs_by_target: BTreeMap::new(),
            changed_directories: Vec::new(),
            warnings: Vec::new(),
            cleanup_residue: None,
        }
    }

    pub fn record_target(&mut self, original: &Path, diff: TargetDiff) {
        if diff.content_changed {
            self.changed_directories.push(original.to_path_buf());
        }
        self.warnings
            .extend(diff.warnings.iter().map(|warning| warning.to_string()));
        self.diffs_by_target.insert(original.to_path_buf(), diff.entries);
    }

    pub fn diff_for(&self, original: &Path) -> Option<&[DiffEntry]> {
        self.diffs_by_target.get(original).map(Vec::as_slice)
    }

    pub fn has_changes(&self) -> bool {
        self.diffs_by_target.values().any(|entries| !entries.is_empty())
    }

    pub fn command_succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Human readable summary.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if self.has_changes() {
            out.push_str("Directories changed during session:\n");
            for (target, entries) in &self.diffs_by_target {
                if entries.is_empty() {
                    continue;
                }
                let note = if self.changed_directories.contains(target) {
                    ""
                } else {
                    " (metadata only)"
                };
                let _ = writeln!(out, " - {}{note}", target.display());
                for entry in entries {
                    let _ = writeln!(
                        out,
                        "   {}: {}",
                        entry.kind,
                        target.join(&entry.relative_path).display()
                    );
                }
            }
        } else {
            out.push_str("No changes detected.\n");
        }

        let _ = write!(out, "Command exited with status {}", self.exit_code);
        if self.interrupted {
            out.push_str(" (interrupted)");
        }
        out.push('\n');

        for warning in &self.warnings {
            let _ = writeln!(out, "warning: {warning}");
        }
        if let Some(ref residue) = self.cleanup_residue {
            let _ = writeln!(out, "warning: cleanup incomplete: {residue}");
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DiffKind;

    fn report(exit_code: i32) -> SessionReport {
        SessionReport::new(
            Uuid::nil(),
            "img",
            &["bash".to_string()],
            "dev",
            Utc::now(),
            RunOutcome {
                exit_code,
                interrupted: false,
            },
        )
    }

    #[test]
    fn renders_no_changes() {
        let mut report = report(0);
        report.record_target(Path::new("/work"), TargetDiff::default());

        assert_eq!(
            report.render(),
            "No changes detected.\nCommand exited with status 0\n"
        );
        assert!(report.command_succeeded());
    }

    #[test]
    fn renders_changes_per_target() {
        let mut report = report(137);
        report.record_target(
            Path::new("/work"),
            TargetDiff {
                entries: vec![
                    DiffEntry::new("a.txt", DiffKind::Modified),
                    DiffEntry::new("new.txt", DiffKind::Added),
                ],
                content_changed: true,
                warnings: Vec::new(),
            },
        );
        report.record_target(
            Path::new("/touched"),
            TargetDiff {
                entries: vec![DiffEntry::new("b.txt", DiffKind::Modified)],
                content_changed: false,
                warnings: Vec::new(),
            },
        );

        let rendered = report.render();

        assert!(rendered.starts_with("Directories changed during session:\n"));
        assert!(rendered.contains(" - /work\n   Modified: /work/a.txt\n   Added: /work/new.txt\n"));
        assert!(rendered.contains(" - /touched (metadata only)\n"));
        assert!(rendered.contains("Command exited with status 137\n"));
        assert_eq!(report.changed_directories, vec![PathBuf::from("/work")]);
    }

    #[test]
    fn serializes_paths_as_map_keys() {
        let mut report = report(0);
        report.record_target(
            Path::new("/work"),
            TargetDiff {
                entries: vec![DiffEntry::new("old.txt", DiffKind::Deleted)],
                content_changed: true,
                warnings: Vec::new(),
            },
        );

        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(
            json["diffs_by_target"]["/work"][0]["kind"],
            serde_json::json!("Deleted")
        );
    }
}
