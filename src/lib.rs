//! Overlay Sandbox - disposable writable views for isolated commands
//!
//! Runs a single command inside a container with a read-only root filesystem
//! and no network, giving it writable copies of a chosen set of host
//! directories. When the command exits, every copy is compared against the
//! state it started from, the changes are reported, and the copies are
//! discarded. The host directories themselves are never written to.
//!
//! # Features
//!
//! - **Snapshots**: size, modification time and content hash of every file,
//!   plus symlink targets and empty directories
//! - **Overlays**: permission and timestamp preserving copies, removed on
//!   every exit path
//! - **Change detection**: added, modified and deleted paths per directory,
//!   in a stable order
//! - **Container runtime**: docker-compatible CLI with gVisor, dropped
//!   capabilities and resource limits by default
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use overlay_sandbox::{launch, ContainerCli, SandboxConfig};
//!
//! # async fn demo() -> overlay_sandbox::SandboxResult<()> {
//! let config = SandboxConfig::default();
//! let runtime = ContainerCli::from_config(&config);
//!
//! let report = launch(
//!     &runtime,
//!     config,
//!     "ubuntu:24.04",
//!     vec!["/home/dev/project".into()],
//!     None,
//!     vec!["make".into()],
//!     Box::pin(std::future::pending()),
//! )
//! .await?;
//!
//! print!("{}", report.render());
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod config;
pub mod detector;
pub mod error;
pub mod overlay;
pub mod report;
pub mod runtime;
pub mod sandbox;
pub mod snapshot;

// Re-export main types
pub use cleanup::{CleanupFailure, CleanupReport};
pub use config::SandboxConfig;
pub use detector::{diff, diff_snapshots, DiffEntry, DiffKind, TargetDiff};
pub use error::{SandboxError, SandboxResult};
pub use overlay::{materialize, Overlay};
pub use report::SessionReport;
pub use runtime::{ContainerCli, ContainerSpec, IsolationRuntime, Mount, RunOutcome, Shutdown};
pub use sandbox::{launch, EditTarget, SandboxSession, SessionState};
pub use snapshot::{capture, Capture, CaptureWarning, ContentHash, Entry, Fingerprint, Snapshot};
