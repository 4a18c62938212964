//! Subcommand handlers.

#![expect(
    clippy::shadow_reuse,
    reason = "intentional shadowing for config merging"
)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use ortho_config::load_and_merge_subcommand_for;
use tracing::info;

use super::{
    AppConfig,
    BootstrapArgs,
    CheckHostArgs,
    Commands,
    ConfigureArgs,
    state::{StateRecord, read_state, write_state},
};
use crate::{
    bootstrap::{BootstrapParams, Bootstrapper, EnvironSettings},
    configure::{configure_machine, nonce_check_script},
    context::BootstrapContext,
    error::BootstrapError,
    machine::{Constraints, NONCE_FILE},
    provider::manual::ManualProvisioner,
    ssh::{OpenSshClient, SshClient, check_host},
    tools::ToolsList,
    wait::SshTimeouts,
};

/// Execute a subcommand.
///
/// # Errors
///
/// Propagates failures from configuration merging or from the subcommand.
pub async fn run_command(command: Commands, cfg: &AppConfig, ctx: &BootstrapContext) -> Result<()> {
    match command {
        Commands::Bootstrap(args) => {
            let args = load_and_merge_subcommand_for::<BootstrapArgs>(&args)?;
            run_bootstrap(args, cfg, ctx).await
        }
        Commands::CheckHost(args) => {
            let args = load_and_merge_subcommand_for::<CheckHostArgs>(&args)?;
            run_check_host(args, cfg, ctx).await
        }
        Commands::Configure(args) => {
            let args = load_and_merge_subcommand_for::<ConfigureArgs>(&args)?;
            run_configure(args, cfg, ctx).await
        }
    }
}

/// Translate the global configuration into bootstrap settings.
#[must_use]
pub fn environ_settings(cfg: &AppConfig) -> EnvironSettings {
    EnvironSettings {
        preferred_series: cfg.default_series.clone(),
        data_dir: Utf8PathBuf::from(&cfg.data_dir),
        enable_os_refresh_update: !cfg.disable_os_refresh_update,
        enable_os_upgrade: !cfg.disable_os_upgrade,
        ssh_timeouts: SshTimeouts {
            timeout: Duration::from_secs(cfg.bootstrap_timeout_secs),
            retry_delay: Duration::from_secs(cfg.bootstrap_retry_delay_secs),
            addresses_delay: Duration::from_secs(cfg.bootstrap_addresses_delay_secs),
        },
    }
}

fn ssh_client(cfg: &AppConfig) -> Option<Arc<dyn SshClient>> {
    OpenSshClient::detect(&cfg.ssh_program).map(|client| Arc::new(client) as Arc<dyn SshClient>)
}

fn state_path(state_file: Option<String>) -> Utf8PathBuf {
    Utf8PathBuf::from(state_file.unwrap_or_else(|| cli_defs::DEFAULT_STATE_FILE.to_owned()))
}

async fn run_bootstrap(args: BootstrapArgs, cfg: &AppConfig, ctx: &BootstrapContext) -> Result<()> {
    let host = args.host.ok_or_else(|| anyhow!("missing host"))?;
    let tools = args.tools.ok_or_else(|| anyhow!("missing tools"))?;
    let params = BootstrapParams {
        constraints: args
            .constraints
            .as_deref()
            .map(str::parse::<Constraints>)
            .transpose()?
            .unwrap_or_default(),
        placement: args.placement,
        available_tools: ToolsList::parse(&tools).context("invalid tools list")?,
    };
    bootstrap_host(
        ctx,
        &host,
        ssh_client(cfg),
        environ_settings(cfg),
        params,
        &state_path(args.state_file),
    )
    .await
}

/// Bootstrap `host` with the manual provisioner, recording the launched
/// instance in `state_file` before waiting for it.
///
/// # Errors
///
/// Returns any [`BootstrapError`] raised by either bootstrap phase, or an
/// error if the state record cannot be written.
pub async fn bootstrap_host(
    ctx: &BootstrapContext,
    host: &str,
    client: Option<Arc<dyn SshClient>>,
    settings: EnvironSettings,
    params: BootstrapParams,
    state_file: &Utf8Path,
) -> Result<()> {
    let Some(session_client) = client.clone() else {
        return Err(BootstrapError::NoSshClient.into());
    };
    let provisioner = Arc::new(ManualProvisioner::new(host, session_client));
    let bootstrapper = Bootstrapper::new(provisioner, client, settings);
    let outcome = bootstrapper.bootstrap(ctx, params).await?;

    let record = StateRecord {
        instance_id: outcome.finalizer.instance_id().clone(),
        arch: outcome.arch.clone(),
        series: outcome.series.clone(),
        hardware: outcome.finalizer.hardware().clone(),
        tools: outcome.finalizer.tools().clone(),
        machine_config: outcome.machine_config.clone(),
        started_at: Utc::now(),
    };
    write_state(state_file, &record)?;
    info!(instance = %record.instance_id, path = %state_file, "recorded bootstrap instance");

    outcome
        .finalizer
        .finalize(ctx, outcome.machine_config)
        .await
        .with_context(|| format!("failed to bootstrap {}", record.instance_id))?;
    ctx.progress()
        .line(format_args!("Bootstrap of {} complete", record.instance_id));
    Ok(())
}

async fn run_check_host(args: CheckHostArgs, cfg: &AppConfig, ctx: &BootstrapContext) -> Result<()> {
    let host = args.host.ok_or_else(|| anyhow!("missing host"))?;
    let (nonce, data_dir) = match args.nonce {
        Some(nonce) => (nonce, Utf8PathBuf::from(&cfg.data_dir)),
        None => {
            let record = read_state(&state_path(args.state_file))?;
            (
                record.machine_config.machine_nonce,
                record.machine_config.data_dir,
            )
        }
    };
    let client = ssh_client(cfg).ok_or(BootstrapError::NoSshClient)?;
    let script = nonce_check_script(&data_dir.join(NONCE_FILE), &nonce);
    check_host(client.as_ref(), &host, &script)
        .await
        .with_context(|| format!("{host} failed verification"))?;
    ctx.progress().line(format_args!("{host} verified"));
    Ok(())
}

async fn run_configure(args: ConfigureArgs, cfg: &AppConfig, ctx: &BootstrapContext) -> Result<()> {
    let host = args.host.ok_or_else(|| anyhow!("missing host"))?;
    let record = read_state(&state_path(args.state_file))?;
    let mcfg = record.finished_machine_config(&environ_settings(cfg))?;
    let client = ssh_client(cfg).ok_or(BootstrapError::NoSshClient)?;
    configure_machine(ctx, client.as_ref(), &host, &mcfg).await?;
    Ok(())
}
