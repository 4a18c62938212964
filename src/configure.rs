//! Configuring the bootstrap node once its address is verified.
//!
//! Two scripts are involved. The nonce check runs on every candidate address
//! during the race and only passes on the instance that was launched for
//! this bootstrap, once its boot-time setup has written the nonce. The
//! configure script runs once, on the winning address, and is never
//! retried.

use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8Path;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    cloudinit::{BASE_PACKAGES, CloudConfig},
    context::BootstrapContext,
    machine::{HardwareCharacteristics, MachineConfig, MachineConfigError},
    provider::InstanceId,
    shell::{dump_file_on_error_script, sh_quote, write_file_script},
    ssh::{SessionError, SshClient, bootstrap_target},
};

/// File, relative to the data directory, describing the instance.
pub const INSTANCE_METADATA_FILE: &str = "instance.json";

/// Errors raised while configuring the bootstrap node.
#[derive(Debug, Error, Clone)]
pub enum ConfigureError {
    /// The machine configuration is incomplete.
    #[error(transparent)]
    MachineConfig(#[from] MachineConfigError),
    /// The instance metadata could not be encoded.
    #[error("encoding instance metadata: {0}")]
    Metadata(#[source] Arc<serde_json::Error>),
    /// No session could be run against the host.
    #[error("running configuration script on {host}: {source}")]
    Session {
        /// Host the script targeted.
        host: String,
        /// Transport failure.
        #[source]
        source: SessionError,
    },
    /// The configure script exited non-zero.
    #[error("configuration script failed on {host}: {detail}")]
    Script {
        /// Host the script ran on.
        host: String,
        /// The script's output, or its exit status if it printed nothing.
        detail: String,
    },
    /// The user interrupted the configure script.
    #[error("interrupted while configuring {0}")]
    Interrupted(String),
}

/// Script that fails unless `nonce_file` holds exactly `nonce`.
///
/// A missing file and a mismatched file fail with different messages so the
/// last race error says which one kept the address from being accepted.
///
/// # Examples
///
/// ```
/// use camino::Utf8Path;
/// use clusterboot::configure::nonce_check_script;
///
/// let script = nonce_check_script(Utf8Path::new("/var/lib/clusterboot/nonce.txt"), "n0nce");
/// assert!(script.contains("does not exist"));
/// assert!(script.contains("contents do not match machine nonce"));
/// ```
#[must_use]
pub fn nonce_check_script(nonce_file: &Utf8Path, nonce: &str) -> String {
    format!(
        r#"
noncefile={file}
if [ ! -e "$noncefile" ]; then
    echo "$noncefile does not exist" >&2
    exit 1
fi
content=$(cat "$noncefile")
if [ "$content" != {nonce} ]; then
    echo "$noncefile contents do not match machine nonce" >&2
    exit 1
fi
"#,
        file = sh_quote(nonce_file.as_str()),
        nonce = sh_quote(nonce),
    )
}

#[derive(Debug, Serialize)]
struct InstanceMetadata<'a> {
    machine_id: &'a str,
    instance_id: &'a InstanceId,
    series: &'a str,
    hardware: &'a HardwareCharacteristics,
    tools: String,
}

/// Add the bootstrap node's own setup to `cloudcfg`.
///
/// # Errors
///
/// Returns [`ConfigureError::MachineConfig`] if the instance id, hardware or
/// tools are missing, and [`ConfigureError::Metadata`] if the instance
/// metadata cannot be encoded.
pub fn add_bootstrap_config(
    mcfg: &MachineConfig,
    cloudcfg: &mut CloudConfig,
) -> Result<(), ConfigureError> {
    let instance_id = mcfg
        .instance_id
        .as_ref()
        .ok_or(MachineConfigError::Missing("instance id"))?;
    let hardware = mcfg
        .hardware
        .as_ref()
        .ok_or(MachineConfigError::Missing("hardware characteristics"))?;
    let tools = mcfg
        .tools
        .as_ref()
        .ok_or(MachineConfigError::Missing("tools"))?;

    for package in BASE_PACKAGES {
        cloudcfg.add_package(package);
    }
    let tools_dir = mcfg.data_dir.join("tools").join(tools.binary());
    cloudcfg.add_run_cmd(format!(
        "install -d -m 0755 {} {} {}",
        sh_quote(mcfg.data_dir.as_str()),
        sh_quote(mcfg.log_dir.as_str()),
        sh_quote(tools_dir.as_str()),
    ));
    cloudcfg.add_run_cmd(write_file_script(
        mcfg.nonce_file().as_str(),
        0o644,
        &mcfg.machine_nonce,
    ));
    if let Some(url) = &tools.url {
        cloudcfg.add_run_cmd(format!(
            "curl -sSfL --retry 10 -o \"$tmp\" {url}",
            url = sh_quote(url)
        ));
        cloudcfg.add_run_cmd(format!(
            "tar -xzf \"$tmp\" -C {}",
            sh_quote(tools_dir.as_str())
        ));
    } else {
        debug!(tools = %tools, "tools have no download url; expecting them preinstalled");
    }
    let metadata = InstanceMetadata {
        machine_id: &mcfg.machine_id,
        instance_id,
        series: &mcfg.series,
        hardware,
        tools: tools.binary(),
    };
    let json = serde_json::to_string(&metadata).map_err(|err| ConfigureError::Metadata(Arc::new(err)))?;
    cloudcfg.add_run_cmd(write_file_script(
        mcfg.data_dir.join(INSTANCE_METADATA_FILE).as_str(),
        0o644,
        &json,
    ));
    Ok(())
}

/// Build the full configure script for `mcfg`.
///
/// # Errors
///
/// See [`add_bootstrap_config`].
pub fn configure_script(mcfg: &MachineConfig) -> Result<String, ConfigureError> {
    let mut cloudcfg = CloudConfig::new();
    cloudcfg.set_apt_update(mcfg.enable_os_refresh_update);
    cloudcfg.set_apt_upgrade(mcfg.enable_os_upgrade);
    add_bootstrap_config(mcfg, &mut cloudcfg)?;
    let mut script = dump_file_on_error_script(mcfg.cloud_init_output_log.as_str());
    script.push_str("tmp=$(mktemp)\n");
    script.push_str(&cloudcfg.configure_script());
    Ok(script)
}

/// Run `script` as root on `host` and copy its output to the progress
/// stream.
///
/// # Errors
///
/// Returns [`ConfigureError::Script`] if the script exits non-zero,
/// [`ConfigureError::Session`] if no session could be run, and
/// [`ConfigureError::Interrupted`] if the context is interrupted first.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! macro usage"
)]
pub async fn run_configure_script(
    ctx: &BootstrapContext,
    client: &dyn SshClient,
    host: &str,
    script: &str,
) -> Result<(), ConfigureError> {
    ctx.progress()
        .line(format_args!("Running configuration script on {host}"));
    let wrapped = format!("exec sudo -n /bin/bash -c {}\n", sh_quote(script));
    let session = client.command(&bootstrap_target(host));
    let output = tokio::select! {
        () = ctx.interrupt().cancelled() => {
            return Err(ConfigureError::Interrupted(host.to_owned()));
        }
        output = session.run(&wrapped) => output.map_err(|source| ConfigureError::Session {
            host: host.to_owned(),
            source,
        })?,
    };
    ctx.progress().text(&output.combined);
    if output.success() {
        info!(host, "configuration script finished");
        return Ok(());
    }
    let detail = match output.trimmed() {
        "" => output
            .status
            .map_or_else(|| "terminated by signal".to_owned(), |code| format!("exit status {code}")),
        text => text.to_owned(),
    };
    Err(ConfigureError::Script {
        host: host.to_owned(),
        detail,
    })
}

/// Build and run the configure script for `mcfg` on `host`.
///
/// # Errors
///
/// See [`configure_script`] and [`run_configure_script`].
pub async fn configure_machine(
    ctx: &BootstrapContext,
    client: &dyn SshClient,
    host: &str,
    mcfg: &MachineConfig,
) -> Result<(), ConfigureError> {
    let script = configure_script(mcfg)?;
    run_configure_script(ctx, client, host, &script).await
}

/// Configures the bootstrap node over a verified session.
#[async_trait]
pub trait Configurator: Send + Sync {
    /// Configure `host` according to `mcfg`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigureError`] if configuration failed. Failures are
    /// final.
    async fn configure(
        &self,
        ctx: &BootstrapContext,
        client: &dyn SshClient,
        host: &str,
        mcfg: &MachineConfig,
    ) -> Result<(), ConfigureError>;
}

/// [`Configurator`] running the rendered cloud config over SSH.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudConfigurator;

#[async_trait]
impl Configurator for CloudConfigurator {
    async fn configure(
        &self,
        ctx: &BootstrapContext,
        client: &dyn SshClient,
        host: &str,
        mcfg: &MachineConfig,
    ) -> Result<(), ConfigureError> {
        configure_machine(ctx, client, host, mcfg).await
    }
}
