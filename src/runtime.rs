//! The container runtime that actually executes the sandboxed command.
//!
//! The session only describes what it needs (a [`ContainerSpec`]) and reads
//! back an exit code. [`ContainerCli`] fulfils that with a docker-compatible
//! command line client.

use std::future::Future;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::pin::Pin;
use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};

/// Exit status the docker CLI uses when the container itself could not be
/// created or started. A command inside the container may exit with it too.
const CLI_LAUNCH_FAILURE: i32 = 125;

/// Go's zero time, reported as `StartedAt` for a container that never ran.
const NEVER_STARTED: &str = "0001-01-01";

/// Resolves when the running command should be interrupted.
pub type Shutdown = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A bind mount from the host into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub writable: bool,
}

/// Everything the runtime needs to start one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub read_only_root: bool,
    pub mounts: Vec<Mount>,
    pub network_disabled: bool,
    pub user: String,
    pub command: Vec<String>,
}

/// How the sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub exit_code: i32,
    /// The run was cut short by a shutdown request.
    pub interrupted: bool,
}

#[async_trait]
pub trait IsolationRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Fail with `RuntimeUnavailable` if the runtime is missing or
    /// misconfigured. Called before any overlay is created.
    async fn ensure_available(&self) -> SandboxResult<()>;

    /// Start the container, wait for it to exit and return its exit code.
    ///
    /// When `shutdown` resolves first, the container is stopped and the run
    /// still returns an outcome. No process may outlive this call.
    async fn run_container(&self, spec: &ContainerSpec, shutdown: Shutdown)
        -> SandboxResult<RunOutcome>;
}

/// A docker-compatible container CLI (`docker`, `podman`).
#[derive(Debug, Clone)]
pub struct ContainerCli {
    binary: String,
    oci_runtime: Option<String>,
    tmpfs: Vec<String>,
    drop_capabilities: bool,
    pids_limit: Option<u32>,
    memory_limit: Option<String>,
    tty: bool,
}

impl ContainerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            oci_runtime: None,
            tmpfs: Vec::new(),
            drop_capabilities: true,
            pids_limit: None,
            memory_limit: None,
            tty: false,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            binary: config.runtime_binary.clone(),
            oci_runtime: config.oci_runtime.clone(),
            tmpfs: config.tmpfs.clone(),
            drop_capabilities: config.drop_capabilities,
            pids_limit: config.pids_limit,
            memory_limit: config.memory_limit.clone(),
            tty: std::io::stdin().is_terminal(),
        }
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn with_oci_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.oci_runtime = Some(runtime.into());
        self
    }

    /// The full argument vector for `<binary> run ...`.
    ///
    /// The container is not started with `--rm`; it stays until its state
    /// has been inspected and is removed by `run_container`.
    pub fn build_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-i".to_string()];
        if self.tty {
            args.push("-t".to_string());
        }
        args.extend(["--name".to_string(), spec.name.clone()]);

        if let Some(ref runtime) = self.oci_runtime {
            args.push(format!("--runtime={runtime}"));
        }
        if spec.network_disabled {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        if spec.read_only_root {
            args.push("--read-only".to_string());
        }
        for path in &self.tmpfs {
            args.extend(["--tmpfs".to_string(), path.clone()]);
        }
        if self.drop_capabilities {
            args.extend([
                "--cap-drop".to_string(),
                "ALL".to_string(),
                "--security-opt".to_string(),
                "no-new-privileges".to_string(),
            ]);
        }
        if let Some(limit) = self.pids_limit {
            args.extend(["--pids-limit".to_string(), limit.to_string()]);
        }
        if let Some(ref memory) = self.memory_limit {
            args.extend(["--memory".to_string(), memory.clone()]);
        }

        for mount in &spec.mounts {
            args.extend(["--mount".to_string(), mount_arg(mount)]);
        }

        args.extend(["--user".to_string(), spec.user.clone()]);
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn check_oci_runtime(&self, runtime: &str) -> SandboxResult<()> {
        let output = Command::new(&self.binary)
            .args(["info", "--format", "{{json .Runtimes}}"])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(SandboxError::RuntimeUnavailable(format!(
                "`{} info` failed: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // Not every compatible CLI reports runtimes as a JSON object.
        let Ok(runtimes) = serde_json::from_slice::<serde_json::Value>(&output.stdout) else {
            debug!(runtime, "could not parse runtime list, skipping check");
            return Ok(());
        };
        match runtimes.as_object() {
            Some(map) if !map.contains_key(runtime) => Err(SandboxError::RuntimeUnavailable(
                format!("OCI runtime `{runtime}` is not registered with {}", self.binary),
            )),
            _ => Ok(()),
        }
    }

    async fn kill_container(&self, name: &str) {
        self.quiet(&["kill", name]).await;
    }

    async fn remove_container(&self, name: &str) {
        self.quiet(&["rm", "-f", name]).await;
    }

    async fn quiet(&self, args: &[&str]) {
        let result = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(err) = result {
            debug!(binary = %self.binary, ?args, error = %err, "container command failed");
        }
    }

    /// Whether the named container ever started running. A container that
    /// does not exist never started.
    async fn container_started(&self, name: &str) -> bool {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.State.StartedAt}}", name])
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                let started_at = String::from_utf8_lossy(&output.stdout);
                let started_at = started_at.trim();
                !started_at.is_empty() && !started_at.starts_with(NEVER_STARTED)
            }
            Ok(_) => false,
            Err(err) => {
                debug!(container = name, error = %err, "failed to inspect container");
                false
            }
        }
    }

    async fn outcome(
        &self,
        spec: &ContainerSpec,
        status: io::Result<ExitStatus>,
        interrupted: bool,
    ) -> SandboxResult<RunOutcome> {
        let exit_code = exit_code(status?);
        if exit_code == CLI_LAUNCH_FAILURE
            && !interrupted
            && !self.container_started(&spec.name).await
        {
            return Err(SandboxError::LaunchFailed(format!(
                "{} could not start container from image {}",
                self.binary, spec.image
            )));
        }

        Ok(RunOutcome {
            exit_code,
            interrupted,
        })
    }
}

#[async_trait]
impl IsolationRuntime for ContainerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn ensure_available(&self) -> SandboxResult<()> {
        let output = Command::new(&self.binary)
            .arg("version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| SandboxError::RuntimeUnavailable(format!("{}: {err}", self.binary)))?;
        if !output.status.success() {
            return Err(SandboxError::RuntimeUnavailable(format!(
                "`{} version` failed: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if let Some(ref runtime) = self.oci_runtime {
            self.check_oci_runtime(runtime).await?;
        }
        Ok(())
    }

    async fn run_container(
        &self,
        spec: &ContainerSpec,
        shutdown: Shutdown,
    ) -> SandboxResult<RunOutcome> {
        let args = self.build_args(spec);
        info!(binary = %self.binary, args = %args.join(" "), "launching sandbox");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SandboxError::LaunchFailed(format!("{}: {err}", self.binary)))?;

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            () = shutdown => None,
        };

        let (status, interrupted) = match finished {
            Some(status) => (status, false),
            None => {
                warn!(container = %spec.name, "interrupted, stopping sandboxed command");
                self.kill_container(&spec.name).await;
                if let Err(err) = child.start_kill() {
                    debug!(error = %err, "container client already exited");
                }
                (child.wait().await, true)
            }
        };

        let outcome = self.outcome(spec, status, interrupted).await;
        self.remove_container(&spec.name).await;
        outcome
    }
}

/// Exit code of a finished process; a signal `N` maps to `128 + N`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn mount_arg(mount: &Mount) -> String {
    let mut arg = format!(
        "type=bind,{},{}",
        csv_field("source", &mount.host_path.to_string_lossy()),
        csv_field("target", &mount.container_path.to_string_lossy()),
    );
    if !mount.writable {
        arg.push_str(",readonly");
    }
    arg
}

/// `--mount` values are parsed as CSV, so quote fields containing separators.
fn csv_field(key: &str, value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{key}={}\"", value.replace('"', "\"\""))
    } else {
        format!("{key}={value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandbox-test".to_string(),
            image: "img".to_string(),
            read_only_root: true,
            mounts: vec![Mount {
                host_path: PathBuf::from("/tmp/src_overlay_abc"),
                container_path: PathBuf::from("/home/dev/src"),
                writable: true,
            }],
            network_disabled: true,
            user: "dev".to_string(),
            command: vec!["bash".to_string()],
        }
    }

    #[test]
    fn args_contain_security_flags() {
        let cli = ContainerCli::from_config(&SandboxConfig::default()).with_tty(false);
        let joined = cli.build_args(&spec()).join(" ");

        assert!(joined.contains("--network none"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--runtime=runsc"));
        assert!(joined.contains("--user dev"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--tmpfs /tmp"));
        assert!(joined.contains("--pids-limit 64"));
        assert!(joined.contains("--memory 512m"));
        assert!(!joined.contains(" -t "));
    }

    #[test]
    fn overlay_is_mounted_at_original_location() {
        let cli = ContainerCli::new("docker");
        let args = cli.build_args(&spec());

        let at = args.iter().position(|a| a == "--mount").unwrap();
        assert_eq!(
            args[at + 1],
            "type=bind,source=/tmp/src_overlay_abc,target=/home/dev/src"
        );
    }

    #[test]
    fn image_and_command_come_last() {
        let mut spec = spec();
        spec.command = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let args = ContainerCli::new("docker").build_args(&spec);

        assert_eq!(&args[args.len() - 4..], ["img", "sh", "-c", "exit 3"]);
    }

    #[test]
    fn read_only_mounts_are_marked() {
        let mount = Mount {
            host_path: PathBuf::from("/data"),
            container_path: PathBuf::from("/data"),
            writable: false,
        };
        assert_eq!(mount_arg(&mount), "type=bind,source=/data,target=/data,readonly");
    }

    #[test]
    fn commas_in_paths_are_quoted() {
        let mount = Mount {
            host_path: PathBuf::from("/tmp/a,b"),
            container_path: PathBuf::from("/x"),
            writable: true,
        };
        assert_eq!(mount_arg(&mount), "type=bind,\"source=/tmp/a,b\",target=/x");
    }

    #[test]
    fn tty_flag_follows_terminal() {
        let args = ContainerCli::new("docker").with_tty(true).build_args(&spec());
        assert!(args.iter().any(|a| a == "-t"));
    }

    #[cfg(unix)]
    #[test]
    fn signal_exit_maps_to_128_plus_signal() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
    }

    /// A docker stand-in whose `run` exits with `run_status` and whose
    /// `inspect` runs `inspect`. Every subcommand is appended to `calls`.
    #[cfg(unix)]
    fn fake_cli(dir: &std::path::Path, run_status: i32, inspect: &str) -> ContainerCli {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-docker");
        let script = format!(
            "#!/bin/sh\n\
             echo \"$1\" >> '{calls}'\n\
             case \"$1\" in\n\
             run) exit {run_status} ;;\n\
             inspect) {inspect} ;;\n\
             *) exit 0 ;;\n\
             esac\n",
            calls = dir.join("calls").display(),
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ContainerCli::new(path.to_string_lossy().into_owned())
    }

    #[cfg(unix)]
    fn calls(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_exiting_125_is_a_normal_result() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), 125, "echo 2024-05-01T10:00:00.123456789Z");

        let outcome = cli
            .run_container(&spec(), Box::pin(std::future::pending::<()>()))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RunOutcome {
                exit_code: 125,
                interrupted: false
            }
        );
        assert_eq!(calls(dir.path()), ["run", "inspect", "rm"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn container_that_never_started_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), 125, "echo 0001-01-01T00:00:00Z");

        let err = cli
            .run_container(&spec(), Box::pin(std::future::pending::<()>()))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::LaunchFailed(_)));
        assert_eq!(calls(dir.path()), ["run", "inspect", "rm"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn container_that_was_never_created_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), 125, "echo 'No such object' >&2; exit 1");

        let err = cli
            .run_container(&spec(), Box::pin(std::future::pending::<()>()))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::LaunchFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn other_exit_codes_skip_inspection() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), 3, "exit 1");

        let outcome = cli
            .run_container(&spec(), Box::pin(std::future::pending::<()>()))
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(calls(dir.path()), ["run", "rm"]);
    }

    #[test]
    fn container_is_not_auto_removed() {
        let args = ContainerCli::new("docker").build_args(&spec());
        assert!(!args.iter().any(|a| a == "--rm"));
    }

    #[tokio::test]
    async fn missing_binary_is_runtime_unavailable() {
        let cli = ContainerCli::new("/nonexistent/container-cli");
        let err = cli.ensure_available().await.unwrap_err();
        assert!(matches!(err, SandboxError::RuntimeUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_launch_failure() {
        let cli = ContainerCli::new("/nonexistent/container-cli");
        let shutdown: Shutdown = Box::pin(std::future::pending::<()>());
        let err = cli.run_container(&spec(), shutdown).await.unwrap_err();
        assert!(matches!(err, SandboxError::LaunchFailed(_)));
    }
}
