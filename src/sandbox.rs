use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cleanup;
use crate::config::SandboxConfig;
use crate::detector::{self, TargetDiff};
use crate::error::{SandboxError, SandboxResult};
use crate::overlay::{self, Overlay};
use crate::report::SessionReport;
use crate::runtime::{ContainerSpec, IsolationRuntime, Mount, RunOutcome, Shutdown};
use crate::snapshot::{self, Capture, Snapshot};

/// Exit code reported when a shutdown request arrives before the command
/// was launched (`128 + SIGINT`).
const INTERRUPTED_BEFORE_LAUNCH: i32 = 130;

/// Command run when none is given
pub const DEFAULT_COMMAND: &str = "/bin/bash";

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Initialized,
    Snapshotting,
    Materialized,
    Running,
    Diffed,
    TornDown,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::TornDown | SessionState::Failed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Initialized, Snapshotting)
            | (Snapshotting, Materialized)
            | (Materialized, Running)
            | (Running, Diffed)
            | (Diffed, TornDown) => true,
            _ => false,
        }
    }
}

/// One directory the sandboxed command may edit
#[derive(Debug)]
pub struct EditTarget {
    pub original_path: PathBuf,
    /// Baseline fingerprints of the freshly materialized overlay, captured
    /// before the command runs.
    pub snapshot: Option<Arc<Snapshot>>,
    pub(crate) overlay: Option<Overlay>,
}

impl EditTarget {
    pub fn new(original_path: impl Into<PathBuf>) -> Self {
        Self {
            original_path: original_path.into(),
            snapshot: None,
            overlay: None,
        }
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }

    /// Path of the overlay, while it exists.
    pub fn overlay_path(&self) -> Option<&Path> {
        self.overlay
            .as_ref()
            .filter(|overlay| overlay.is_present())
            .map(Overlay::path)
    }
}

/// A single launch, run, diff and teardown cycle
///
/// The session exclusively owns its edit targets and, through them, every
/// overlay directory it creates. All overlays are released by
/// [`SandboxSession::teardown`], which `run` calls on every exit path once
/// it has started touching the filesystem.
#[derive(Debug)]
pub struct SandboxSession {
    id: Uuid,
    image: String,
    edit_targets: Vec<EditTarget>,
    user: String,
    command: Vec<String>,
    exit_code: Option<i32>,
    state: SessionState,
    config: SandboxConfig,
    started_at: DateTime<Utc>,
    warnings: Vec<String>,
    torn_down: bool,
}

impl SandboxSession {
    /// Create a session. Duplicate edit paths are collapsed, keeping the
    /// first occurrence; an empty command runs [`DEFAULT_COMMAND`].
    pub fn new(
        image: impl Into<String>,
        edit_paths: Vec<PathBuf>,
        user: Option<String>,
        command: Vec<String>,
        config: SandboxConfig,
    ) -> Self {
        let mut edit_targets: Vec<EditTarget> = Vec::with_capacity(edit_paths.len());
        for path in edit_paths {
            if edit_targets.iter().all(|t| t.original_path != path) {
                edit_targets.push(EditTarget::new(path));
            }
        }

        let command = if command.is_empty() {
            vec![DEFAULT_COMMAND.to_string()]
        } else {
            command
        };

        Self {
            id: Uuid::new_v4(),
            image: image.into(),
            edit_targets,
            user: user.unwrap_or_else(|| config.default_user.clone()),
            command,
            exit_code: None,
            state: SessionState::Initialized,
            config,
            started_at: Utc::now(),
            warnings: Vec::new(),
            torn_down: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn edit_targets(&self) -> &[EditTarget] {
        &self.edit_targets
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Run the whole session against `runtime`.
    ///
    /// A nonzero exit code is part of the returned report, not an error. On
    /// any fatal error the session moves to [`SessionState::Failed`], tears
    /// down whatever overlays exist and returns the first fatal condition,
    /// with any cleanup residue attached.
    pub async fn run<R>(&mut self, runtime: &R, shutdown: Shutdown) -> SandboxResult<SessionReport>
    where
        R: IsolationRuntime + ?Sized,
    {
        let span = info_span!("session", id = %self.id);
        let result = self.execute(runtime, shutdown).instrument(span).await;

        match result {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(session = %self.id, state = ?self.state, error = %err, "session failed");
                self.fail();
                let residue = match self.teardown() {
                    Ok(_) => None,
                    Err(SandboxError::CleanupIncomplete(report)) => Some(report),
                    Err(other) => {
                        warn!(session = %self.id, error = %other, "teardown failed");
                        None
                    }
                };
                Err(err.with_residue(residue))
            }
        }
    }

    async fn execute<R>(&mut self, runtime: &R, mut shutdown: Shutdown) -> SandboxResult<SessionReport>
    where
        R: IsolationRuntime + ?Sized,
    {
        self.config.validate()?;
        self.check_edit_paths()?;
        runtime.ensure_available().await?;

        self.transition(SessionState::Snapshotting)?;
        self.scan_targets().await?;
        self.materialize_targets().await?;
        self.capture_baselines().await?;
        self.transition(SessionState::Materialized)?;

        let cancelled_early = tokio::select! {
            biased;
            () = &mut shutdown => true,
            () = std::future::ready(()) => false,
        };

        self.transition(SessionState::Running)?;
        let outcome = if cancelled_early {
            warn!(session = %self.id, "interrupted before launch, not starting command");
            RunOutcome {
                exit_code: INTERRUPTED_BEFORE_LAUNCH,
                interrupted: true,
            }
        } else {
            let spec = self.container_spec()?;
            info!(
                session = %self.id,
                runtime = runtime.name(),
                image = %self.image,
                targets = self.edit_targets.len(),
                "running sandboxed command"
            );
            runtime.run_container(&spec, shutdown).await?
        };
        self.exit_code = Some(outcome.exit_code);
        info!(
            session = %self.id,
            exit_code = outcome.exit_code,
            interrupted = outcome.interrupted,
            "sandboxed command finished"
        );

        let diffs = self.diff_targets().await?;
        self.transition(SessionState::Diffed)?;

        let mut report = SessionReport::new(
            self.id,
            &self.image,
            &self.command,
            &self.user,
            self.started_at,
            outcome,
        );
        report.warnings.append(&mut self.warnings);
        for (target, diff) in self.edit_targets.iter().zip(diffs) {
            report.record_target(&target.original_path, diff);
        }

        match self.teardown() {
            Ok(removed) => debug!(session = %self.id, removed, "session torn down"),
            Err(SandboxError::CleanupIncomplete(residue)) => {
                warn!(session = %self.id, %residue, "session left residue");
                report.cleanup_residue = Some(residue);
            }
            Err(err) => return Err(err),
        }

        Ok(report)
    }

    fn check_edit_paths(&self) -> SandboxResult<()> {
        for target in &self.edit_targets {
            if !target.original_path.is_absolute() {
                return Err(SandboxError::unreadable(
                    target.original_path.clone(),
                    "edit path must be absolute",
                ));
            }
        }
        Ok(())
    }

    /// Walk every original once, failing on an unreadable source and
    /// collecting per-file warnings. The originals are never diffed.
    async fn scan_targets(&mut self) -> SandboxResult<()> {
        let originals = self.original_paths();
        let captures = run_bounded(self.config.parallelism, originals, |path: PathBuf| {
            snapshot::capture(&path)
        })
        .await?;

        for (target, capture) in self.edit_targets.iter().zip(captures) {
            let Capture { snapshot, warnings } = capture?;
            debug!(
                session = %self.id,
                original = %target.original_path.display(),
                entries = snapshot.len(),
                "scanned edit target"
            );
            self.warnings
                .extend(warnings.iter().map(|warning| warning.to_string()));
        }
        Ok(())
    }

    /// Fingerprint each overlay as materialized. Diffs compare against this,
    /// so host changes made during setup never show up as command changes.
    async fn capture_baselines(&mut self) -> SandboxResult<()> {
        let overlays = self
            .edit_targets
            .iter()
            .map(|target| {
                target.overlay_path().map(Path::to_path_buf).ok_or_else(|| {
                    SandboxError::InvalidState(format!(
                        "{} was not materialized",
                        target.original_path.display()
                    ))
                })
            })
            .collect::<SandboxResult<Vec<_>>>()?;
        let captures = run_bounded(self.config.parallelism, overlays, |path: PathBuf| {
            snapshot::capture(&path)
        })
        .await?;

        for (target, capture) in self.edit_targets.iter_mut().zip(captures) {
            let snapshot = capture?.snapshot;
            info!(
                session = %self.id,
                original = %target.original_path.display(),
                entries = snapshot.len(),
                "captured baseline"
            );
            target.snapshot = Some(Arc::new(snapshot));
        }
        Ok(())
    }

    async fn materialize_targets(&mut self) -> SandboxResult<()> {
        let root = self.config.overlay_root();
        let originals = self.original_paths();
        // Overlays of one target must not land inside another.
        for original in &originals {
            overlay::check_root(original, &root)?;
        }
        let results = run_bounded(self.config.parallelism, originals, move |path: PathBuf| {
            overlay::materialize(&path, &root)
        })
        .await?;

        // Hand every created overlay to its target before reporting a
        // failure, so teardown can find it.
        let mut first_error = None;
        for (target, result) in self.edit_targets.iter_mut().zip(results) {
            match result {
                Ok(overlay) => target.overlay = Some(overlay),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn diff_targets(&mut self) -> SandboxResult<Vec<TargetDiff>> {
        let mut inputs = Vec::with_capacity(self.edit_targets.len());
        for target in &self.edit_targets {
            let missing = |what: &str| {
                SandboxError::InvalidState(format!(
                    "{} has no {what} to diff",
                    target.original_path.display()
                ))
            };
            let overlay = target.overlay_path().ok_or_else(|| missing("overlay"))?;
            let baseline = target.snapshot.clone().ok_or_else(|| missing("baseline"))?;
            inputs.push((overlay.to_path_buf(), baseline));
        }

        let results = run_bounded(
            self.config.parallelism,
            inputs,
            |(overlay, baseline): (PathBuf, Arc<Snapshot>)| {
                detector::diff_overlay(&overlay, &baseline)
            },
        )
        .await?;
        results.into_iter().collect()
    }

    fn container_spec(&self) -> SandboxResult<ContainerSpec> {
        let mut mounts = Vec::with_capacity(self.edit_targets.len());
        for target in &self.edit_targets {
            let overlay = target.overlay_path().ok_or_else(|| {
                SandboxError::InvalidState(format!(
                    "{} was not materialized",
                    target.original_path.display()
                ))
            })?;
            mounts.push(Mount {
                host_path: overlay.to_path_buf(),
                container_path: target.original_path.clone(),
                writable: true,
            });
        }

        Ok(ContainerSpec {
            name: format!("overlay-sandbox-{}", self.id.simple()),
            image: self.image.clone(),
            read_only_root: true,
            mounts,
            network_disabled: true,
            user: self.user.clone(),
            command: self.command.clone(),
        })
    }

    /// Remove every overlay this session still owns.
    ///
    /// Only the first call does any work; later calls return `Ok(0)`
    /// without touching the filesystem.
    pub fn teardown(&mut self) -> SandboxResult<usize> {
        if self.torn_down {
            return Ok(0);
        }
        self.torn_down = true;

        let result = cleanup::teardown(&mut self.edit_targets);
        if self.state == SessionState::Diffed {
            self.state = SessionState::TornDown;
        } else {
            self.fail();
        }
        result
    }

    fn transition(&mut self, next: SessionState) -> SandboxResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SandboxError::InvalidState(format!(
                "cannot move from {:?} to {:?}",
                self.state, next
            )));
        }
        debug!(session = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
    }

    fn original_paths(&self) -> Vec<PathBuf> {
        self.edit_targets
            .iter()
            .map(|target| target.original_path.clone())
            .collect()
    }
}

/// Run a session for `command` in `image` with the given edit directories.
pub async fn launch<R>(
    runtime: &R,
    config: SandboxConfig,
    image: &str,
    edit_paths: Vec<PathBuf>,
    user: Option<String>,
    command: Vec<String>,
    shutdown: Shutdown,
) -> SandboxResult<SessionReport>
where
    R: IsolationRuntime + ?Sized,
{
    let mut session = SandboxSession::new(image, edit_paths, user, command, config);
    session.run(runtime, shutdown).await
}

/// Apply `work` to every input on the blocking pool, at most `limit` at a
/// time, returning outputs in input order.
async fn run_bounded<I, O, F>(limit: usize, inputs: Vec<I>, work: F) -> SandboxResult<Vec<O>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let work = Arc::new(work);
    let mut tasks = JoinSet::new();
    let count = inputs.len();

    for (index, input) in inputs.into_iter().enumerate() {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| SandboxError::InvalidState(err.to_string()))?;
        let work = Arc::clone(&work);
        tasks.spawn_blocking(move || {
            let _permit = permit;
            (index, work(input))
        });
    }

    let mut outputs: Vec<Option<O>> = (0..count).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, output) = joined
            .map_err(|err| SandboxError::InvalidState(format!("worker task failed: {err}")))?;
        outputs[index] = Some(output);
    }
    Ok(outputs.into_iter().flatten().collect())
}
