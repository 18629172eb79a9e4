//! Pre-run fingerprints of a directory tree.
//!
//! A [`Snapshot`] maps every path below a directory (relative to it) to an
//! [`Entry`]. Regular files carry a [`Fingerprint`], symbolic links carry
//! their target string, and empty directories are recorded explicitly so
//! that creating or removing one is still visible to the change detector.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{SandboxError, SandboxResult};

const HASH_CHUNK_SIZE: usize = 8192;

/// Content digest of a regular file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentHash {
    /// Hex encoded SHA-256 of the file contents.
    Sha256(String),
    /// The file could not be opened or read.
    Unreadable,
    /// Not a regular file (fifo, socket, device); contents are never read.
    Special,
}

/// Observed state of one file at a point in time.
///
/// Two fingerprints are equal iff size, modification time and content hash
/// all match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified: SystemTime,
    pub content_hash: ContentHash,
}

impl Fingerprint {
    pub fn unreadable() -> Self {
        Self {
            size: 0,
            modified: UNIX_EPOCH,
            content_hash: ContentHash::Unreadable,
        }
    }

    /// Whether the file's contents were available, and hence copied into an
    /// overlay.
    pub fn is_readable(&self) -> bool {
        matches!(self.content_hash, ContentHash::Sha256(_))
    }

    fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let metadata = file.metadata()?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; HASH_CHUNK_SIZE];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }

        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
            content_hash: ContentHash::Sha256(hex::encode(hasher.finalize())),
        })
    }

    fn of_special(metadata: &fs::Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
            content_hash: ContentHash::Special,
        }
    }
}

/// One recorded path in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    File(Fingerprint),
    Symlink(PathBuf),
    EmptyDir,
}

impl Entry {
    /// Whether this entry was present in the source in a form the
    /// materializer could reproduce.
    pub fn is_materializable(&self) -> bool {
        match self {
            Entry::File(fingerprint) => fingerprint.is_readable(),
            Entry::Symlink(_) | Entry::EmptyDir => true,
        }
    }
}

/// Fingerprints of a directory tree, keyed by path relative to its root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, Entry>,
    directories: BTreeSet<PathBuf>,
    /// Directories whose contents could not be listed.
    unreadable_directories: BTreeSet<PathBuf>,
}

impl Snapshot {
    pub fn entries(&self) -> &BTreeMap<PathBuf, Entry> {
        &self.entries
    }

    pub fn get(&self, relative: &Path) -> Option<&Entry> {
        self.entries.get(relative)
    }

    /// Whether `relative` was a directory (empty or not) when captured.
    pub fn has_directory(&self, relative: &Path) -> bool {
        self.directories.contains(relative)
    }

    /// The unreadable directory hiding `relative`, if any. A path counts as
    /// hidden by itself.
    pub fn unreadable_ancestor(&self, relative: &Path) -> Option<&Path> {
        self.unreadable_directories
            .iter()
            .find(|dir| relative.starts_with(dir))
            .map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold the whole tree into a single digest of names and contents.
    /// Modification times do not contribute.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, entry) in &self.entries {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            match entry {
                Entry::File(fingerprint) => match &fingerprint.content_hash {
                    ContentHash::Sha256(hash) => hasher.update(hash.as_bytes()),
                    ContentHash::Unreadable => hasher.update(b"unreadable"),
                    ContentHash::Special => hasher.update(b"special"),
                },
                Entry::Symlink(target) => {
                    hasher.update(b"->");
                    hasher.update(target.to_string_lossy().as_bytes());
                }
                Entry::EmptyDir => hasher.update(b"/"),
            }
            hasher.update(b"\0");
        }
        for dir in &self.directories {
            hasher.update(dir.to_string_lossy().as_bytes());
            hasher.update(b"/\0");
        }
        for dir in &self.unreadable_directories {
            hasher.update(dir.to_string_lossy().as_bytes());
            hasher.update(b"/?\0");
        }
        hex::encode(hasher.finalize())
    }

    fn insert(&mut self, relative: PathBuf, entry: Entry) {
        self.entries.insert(relative, entry);
    }
}

/// A path that could not be fully fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for CaptureWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Result of [`capture`].
#[derive(Debug, Clone, Default)]
pub struct Capture {
    pub snapshot: Snapshot,
    pub warnings: Vec<CaptureWarning>,
}

/// Walk `directory` and fingerprint everything below it.
///
/// Symbolic links are recorded, never followed. A file that cannot be read
/// is recorded with [`Fingerprint::unreadable`] and reported as a warning;
/// only a missing or untraversable root fails the capture.
pub fn capture(directory: &Path) -> SandboxResult<Capture> {
    let metadata =
        fs::metadata(directory).map_err(|err| SandboxError::unreadable(directory, err))?;
    if !metadata.is_dir() {
        return Err(SandboxError::unreadable(directory, "not a directory"));
    }
    fs::read_dir(directory).map_err(|err| SandboxError::unreadable(directory, err))?;

    let mut capture = Capture::default();

    for entry in WalkDir::new(directory)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().unwrap_or(directory).to_path_buf();
                // Children of a directory that cannot be listed are unknown,
                // not absent.
                if let Ok(relative) = path.strip_prefix(directory) {
                    if !relative.as_os_str().is_empty() && path.is_dir() {
                        capture
                            .snapshot
                            .unreadable_directories
                            .insert(relative.to_path_buf());
                    }
                }
                capture.warn(path, err.to_string());
                continue;
            }
        };

        let relative = entry
            .path()
            .strip_prefix(directory)
            .map_err(|err| SandboxError::unreadable(entry.path(), err))?
            .to_path_buf();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            capture.snapshot.directories.insert(relative.clone());
            // An unreadable directory is reported by the walker itself.
            if let Ok(true) = is_empty_dir(entry.path()) {
                capture.snapshot.insert(relative, Entry::EmptyDir);
            }
        } else if file_type.is_symlink() {
            match fs::read_link(entry.path()) {
                Ok(target) => capture.snapshot.insert(relative, Entry::Symlink(target)),
                Err(err) => {
                    capture.warn(entry.path().to_path_buf(), err.to_string());
                    capture
                        .snapshot
                        .insert(relative, Entry::File(Fingerprint::unreadable()));
                }
            }
        } else if file_type.is_file() {
            let fingerprint = match Fingerprint::of_file(entry.path()) {
                Ok(fingerprint) => fingerprint,
                Err(err) => {
                    capture.warn(entry.path().to_path_buf(), err.to_string());
                    Fingerprint::unreadable()
                }
            };
            capture.snapshot.insert(relative, Entry::File(fingerprint));
        } else {
            let fingerprint = match entry.metadata() {
                Ok(metadata) => Fingerprint::of_special(&metadata),
                Err(_) => Fingerprint::unreadable(),
            };
            capture.snapshot.insert(relative, Entry::File(fingerprint));
        }
    }

    debug!(
        directory = %directory.display(),
        entries = capture.snapshot.len(),
        warnings = capture.warnings.len(),
        "captured snapshot"
    );

    Ok(capture)
}

impl Capture {
    fn warn(&mut self, path: PathBuf, reason: String) {
        warn!(path = %path.display(), %reason, "could not fingerprint path");
        self.warnings.push(CaptureWarning { path, reason });
    }
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}
