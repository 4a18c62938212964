//! Machine configuration for the bootstrap node.
//!
//! A [`MachineConfig`] is created before the instance is launched and
//! completed afterwards, once the provider has reported the instance id and
//! the hardware it actually allocated.

use std::{fmt, str::FromStr};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{bootstrap::EnvironSettings, provider::InstanceId, tools::Tools};

/// Default directory holding agent state on the bootstrap node.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/clusterboot";
/// Default directory holding agent logs on the bootstrap node.
pub const DEFAULT_LOG_DIR: &str = "/var/log/clusterboot";
/// Log written by the boot-time configuration process.
pub const CLOUD_INIT_OUTPUT_LOG: &str = "/var/log/cloud-init-output.log";
/// File, relative to the data directory, that holds the machine nonce.
pub const NONCE_FILE: &str = "nonce.txt";
/// Prefix of every bootstrap machine nonce.
pub const BOOTSTRAP_NONCE_PREFIX: &str = "user-admin:bootstrap";
/// Machine id of the bootstrap node.
pub const BOOTSTRAP_MACHINE_ID: &str = "0";

/// Errors raised while building or completing a machine configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MachineConfigError {
    /// A constraint could not be parsed.
    #[error("invalid constraint {0:?}")]
    InvalidConstraint(String),
    /// A field required to finish the configuration was never set.
    #[error("machine config is missing {0}")]
    Missing(&'static str),
}

/// Resource requirements for the bootstrap instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Required CPU architecture.
    pub arch: Option<String>,
    /// Minimum number of CPU cores.
    pub cpu_cores: Option<u64>,
    /// Minimum memory in MiB.
    pub mem_mb: Option<u64>,
    /// Minimum root disk size in MiB.
    pub root_disk_mb: Option<u64>,
}

fn parse_megabytes(raw: &str) -> Option<u64> {
    let (digits, factor) = match raw.chars().last()? {
        'M' | 'm' => (raw.get(..raw.len() - 1)?, 1),
        'G' | 'g' => (raw.get(..raw.len() - 1)?, 1024),
        'T' | 't' => (raw.get(..raw.len() - 1)?, 1024 * 1024),
        _ => (raw, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(factor)
}

impl FromStr for Constraints {
    type Err = MachineConfigError;

    /// Parse space-separated `key=value` pairs such as
    /// `arch=amd64 cores=2 mem=4G root-disk=20G`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cons = Self::default();
        for pair in s.split_whitespace() {
            let invalid = || MachineConfigError::InvalidConstraint(pair.to_owned());
            let (key, value) = pair.split_once('=').ok_or_else(invalid)?;
            match key {
                "arch" if !value.is_empty() => cons.arch = Some(value.to_owned()),
                "cores" | "cpu-cores" => {
                    cons.cpu_cores = Some(value.parse().map_err(|_| invalid())?);
                }
                "mem" => cons.mem_mb = Some(parse_megabytes(value).ok_or_else(invalid)?),
                "root-disk" => cons.root_disk_mb = Some(parse_megabytes(value).ok_or_else(invalid)?),
                _ => return Err(invalid()),
            }
        }
        Ok(cons)
    }
}

/// Hardware the provider actually allocated to an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareCharacteristics {
    /// CPU architecture.
    pub arch: Option<String>,
    /// Number of CPU cores.
    pub cpu_cores: Option<u64>,
    /// Memory in MiB.
    pub mem_mb: Option<u64>,
    /// Root disk size in MiB.
    pub root_disk_mb: Option<u64>,
}

impl fmt::Display for HardwareCharacteristics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(arch) = &self.arch {
            parts.push(format!("arch={arch}"));
        }
        if let Some(cores) = self.cpu_cores {
            parts.push(format!("cores={cores}"));
        }
        if let Some(mem) = self.mem_mb {
            parts.push(format!("mem={mem}M"));
        }
        if let Some(disk) = self.root_disk_mb {
            parts.push(format!("root-disk={disk}M"));
        }
        f.write_str(&parts.join(" "))
    }
}

/// Everything needed to configure the bootstrap node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Machine id within the cluster.
    pub machine_id: String,
    /// Secret written to the instance at boot to prove its identity.
    pub machine_nonce: String,
    /// Directory holding agent state on the instance.
    pub data_dir: Utf8PathBuf,
    /// Directory holding agent logs on the instance.
    pub log_dir: Utf8PathBuf,
    /// Log dumped to the session when configuration fails.
    pub cloud_init_output_log: Utf8PathBuf,
    /// Operating system series.
    pub series: String,
    /// Constraints the instance was launched with.
    pub constraints: Constraints,
    /// Provider id, known once the instance is running.
    pub instance_id: Option<InstanceId>,
    /// Allocated hardware, known once the instance is running.
    pub hardware: Option<HardwareCharacteristics>,
    /// Tools selected for the instance.
    pub tools: Option<Tools>,
    /// Whether to refresh the package index during configuration.
    pub enable_os_refresh_update: bool,
    /// Whether to upgrade installed packages during configuration.
    pub enable_os_upgrade: bool,
}

impl MachineConfig {
    /// Configuration for a new bootstrap node with a freshly generated nonce.
    #[must_use]
    pub fn bootstrap(constraints: Constraints, series: impl Into<String>) -> Self {
        Self {
            machine_id: BOOTSTRAP_MACHINE_ID.to_owned(),
            machine_nonce: format!("{BOOTSTRAP_NONCE_PREFIX}:{:016x}", rand::random::<u64>()),
            data_dir: Utf8PathBuf::from(DEFAULT_DATA_DIR),
            log_dir: Utf8PathBuf::from(DEFAULT_LOG_DIR),
            cloud_init_output_log: Utf8PathBuf::from(CLOUD_INIT_OUTPUT_LOG),
            series: series.into(),
            constraints,
            instance_id: None,
            hardware: None,
            tools: None,
            enable_os_refresh_update: true,
            enable_os_upgrade: true,
        }
    }

    /// Path of the nonce file on the instance.
    #[must_use]
    pub fn nonce_file(&self) -> Utf8PathBuf { self.data_dir.join(NONCE_FILE) }

    /// Apply environment settings and check the config is ready to use.
    ///
    /// # Errors
    ///
    /// Returns [`MachineConfigError::Missing`] if the instance id, hardware,
    /// tools, or nonce have not been set.
    pub fn finish(&mut self, settings: &EnvironSettings) -> Result<(), MachineConfigError> {
        if self.instance_id.is_none() {
            return Err(MachineConfigError::Missing("instance id"));
        }
        if self.hardware.is_none() {
            return Err(MachineConfigError::Missing("hardware characteristics"));
        }
        if self.tools.is_none() {
            return Err(MachineConfigError::Missing("tools"));
        }
        if self.machine_nonce.is_empty() {
            return Err(MachineConfigError::Missing("machine nonce"));
        }
        self.data_dir.clone_from(&settings.data_dir);
        self.enable_os_refresh_update = settings.enable_os_refresh_update;
        self.enable_os_upgrade = settings.enable_os_upgrade;
        Ok(())
    }
}
