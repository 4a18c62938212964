//! Local record of a launched bootstrap instance.
//!
//! The record is written after the instance starts and before the slow
//! address race begins, so an operator can find an instance that never
//! became reachable. The `configure` and `check-host` subcommands read it
//! back.

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    bootstrap::EnvironSettings,
    machine::{HardwareCharacteristics, MachineConfig, MachineConfigError},
    provider::InstanceId,
    tools::Tools,
};

/// What was launched by a bootstrap attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Provider id of the instance.
    pub instance_id: InstanceId,
    /// Architecture the instance reported.
    pub arch: String,
    /// Series the instance runs.
    pub series: String,
    /// Hardware the provider allocated.
    pub hardware: HardwareCharacteristics,
    /// Tools chosen for the instance.
    pub tools: Tools,
    /// Machine configuration the instance was launched with.
    pub machine_config: MachineConfig,
    /// When the instance was launched.
    pub started_at: DateTime<Utc>,
}

impl StateRecord {
    /// The recorded machine configuration, completed for configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MachineConfigError`] if the record lacks required fields.
    pub fn finished_machine_config(
        &self,
        settings: &EnvironSettings,
    ) -> Result<MachineConfig, MachineConfigError> {
        let mut mcfg = self.machine_config.clone();
        mcfg.instance_id = Some(self.instance_id.clone());
        mcfg.hardware = Some(self.hardware.clone());
        mcfg.tools = Some(self.tools.clone());
        mcfg.finish(settings)?;
        Ok(mcfg)
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str)> {
    let name = path
        .file_name()
        .with_context(|| format!("state file {path} has no file name"))?;
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    Ok((parent, name))
}

/// Write `record` to `path` as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the parent directory cannot be opened or the file
/// cannot be written.
pub fn write_state(path: &Utf8Path, record: &StateRecord) -> Result<()> {
    let (parent, name) = split(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .with_context(|| format!("failed to open {parent}"))?;
    let json = serde_json::to_string_pretty(record).context("failed to encode state record")?;
    dir.write(name, json)
        .with_context(|| format!("failed to write {path}"))
}

/// Read a record written by [`write_state`].
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold a record.
pub fn read_state(path: &Utf8Path) -> Result<StateRecord> {
    let (parent, name) = split(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .with_context(|| format!("failed to open {parent}"))?;
    let json = dir
        .read_to_string(name)
        .with_context(|| format!("failed to read {path}"))?;
    serde_json::from_str(&json).with_context(|| format!("{path} is not a bootstrap state record"))
}
