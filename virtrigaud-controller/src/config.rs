//! Configuration for the controller manager.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub health: HealthConfig,
    pub staging: StagingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.health.listen_address = listen.clone();
        }

        if let Some(workers) = args.workers {
            self.manager.workers_per_kind = workers;
        }

        if args.dev {
            self.manager.dev_mode = true;
        }

        self
    }
}

/// Controller manager tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Worker count per resource kind.
    pub workers_per_kind: usize,
    /// Use in-memory mock providers instead of HTTP workers.
    pub dev_mode: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers_per_kind: 2,
            dev_mode: false,
        }
    }
}

/// Health endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub listen_address: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Staging mount points for the filesystem-backed drivers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub pvc_mount_base: String,
    pub nfs_mount_base: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            pvc_mount_base: virtrigaud_storage::pvc::DEFAULT_PVC_MOUNT_BASE.to_string(),
            nfs_mount_base: virtrigaud_storage::factory::DEFAULT_NFS_MOUNT_BASE.to_string(),
        }
    }
}
