use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

/// Session and runtime settings
///
/// Every field has a default, so a config file only needs to name what it
/// overrides:
///
/// ```json
/// { "runtime_binary": "podman", "oci_runtime": null, "parallelism": 1 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container CLI used to run the command.
    pub runtime_binary: String,
    /// OCI runtime passed as `--runtime`; `None` uses the CLI's default.
    pub oci_runtime: Option<String>,
    /// User the command runs as when none is given.
    pub default_user: String,
    pub memory_limit: Option<String>,
    pub pids_limit: Option<u32>,
    /// Scratch tmpfs mounts inside the otherwise read-only root.
    pub tmpfs: Vec<String>,
    pub drop_capabilities: bool,
    /// Where overlays are created; the system temp dir when unset.
    pub overlay_root: Option<PathBuf>,
    /// Upper bound on edit targets snapshotted, materialized or diffed at
    /// once. `1` processes them strictly in order.
    pub parallelism: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_binary: "docker".to_string(),
            oci_runtime: Some("runsc".to_string()),
            default_user: "dev".to_string(),
            memory_limit: Some("512m".to_string()),
            pids_limit: Some(64),
            tmpfs: vec!["/tmp".to_string()],
            drop_capabilities: true,
            overlay_root: None,
            parallelism: 4,
        }
    }
}

impl SandboxConfig {
    /// Load a JSON config file and validate it.
    pub fn load(path: &Path) -> SandboxResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            SandboxError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if self.runtime_binary.trim().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "runtime_binary must not be empty".to_string(),
            ));
        }
        if self.parallelism == 0 {
            return Err(SandboxError::InvalidConfig(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.default_user.trim().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "default_user must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn overlay_root(&self) -> PathBuf {
        self.overlay_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.json");
        std::fs::write(&path, r#"{ "runtime_binary": "podman", "oci_runtime": null }"#).unwrap();

        let config = SandboxConfig::load(&path).unwrap();

        assert_eq!(config.runtime_binary, "podman");
        assert_eq!(config.oci_runtime, None);
        assert_eq!(config.default_user, "dev");
        assert_eq!(config.parallelism, 4);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.json");
        std::fs::write(&path, r#"{ "parallelism": 0 }"#).unwrap();

        let err = SandboxConfig::load(&path).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_file_is_a_serde_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.json");
        std::fs::write(&path, "{ nope").unwrap();

        let err = SandboxConfig::load(&path).unwrap_err();
        assert!(matches!(err, SandboxError::SerdeError(_)));
    }

    #[test]
    fn overlay_root_defaults_to_temp_dir() {
        assert_eq!(SandboxConfig::default().overlay_root(), std::env::temp_dir());
    }
}
