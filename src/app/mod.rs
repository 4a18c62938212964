//! Command-line front end.
//!
//! The binary stays a thin wrapper around [`run`]. Configuration is layered
//! by `ortho_config`: defaults, then `.clusterboot.toml`, then
//! `CLUSTERBOOT_*` environment variables, then command-line flags.

pub mod commands;
pub mod state;

use std::ffi::OsString;

use anyhow::{Context, Result};
use clap::Parser;
use ortho_config::OrthoConfig;
pub use cli_defs::{AppConfig, BootstrapArgs, CheckHostArgs, Cli, Commands, ConfigureArgs};
use cli_defs::SUBCOMMANDS;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::BootstrapContext;

/// Parse the process arguments and run the requested subcommand.
///
/// # Errors
///
/// Returns any error raised while loading configuration or running the
/// subcommand.
pub async fn run() -> Result<()> {
    let args: Vec<OsString> = std::env::args_os().collect();
    let cli = Cli::parse_from(&args);
    let config = load_config(&args)?;
    run_with_cli(Cli {
        config,
        command: cli.command,
    })
    .await
}

/// Run an already parsed [`Cli`].
///
/// Ctrl-C or SIGTERM cancel the bootstrap context's interrupt token for the
/// duration of the command.
///
/// # Errors
///
/// Propagates any failure reported by [`commands::run_command`].
pub async fn run_with_cli(cli: Cli) -> Result<()> {
    let Cli { config, command } = cli;
    let interrupt = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_signal(interrupt.clone()));
    let ctx = BootstrapContext::stderr(interrupt);
    let outcome = commands::run_command(command, &config, &ctx).await;
    watcher.abort();
    outcome
}

/// Layer the global configuration from defaults, file, environment and the
/// flags given before the subcommand.
///
/// # Errors
///
/// Returns an error if any configuration source is malformed.
pub fn load_config(args: &[OsString]) -> Result<AppConfig> {
    AppConfig::load_from_iter(global_args(args)).context("failed to load configuration")
}

/// The program name and every argument before the subcommand.
fn global_args(args: &[OsString]) -> Vec<OsString> {
    args.iter()
        .enumerate()
        .take_while(|(index, arg)| {
            *index == 0 || !SUBCOMMANDS.iter().any(|name| arg.as_os_str() == *name)
        })
        .map(|(_, arg)| arg.clone())
        .collect()
}

async fn cancel_on_signal(interrupt: CancellationToken) {
    shutdown_signal().await;
    warn!("interrupt received; stopping");
    interrupt.cancel();
}

/// Waits for a shutdown signal, completing when termination is requested.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! macro usage"
)]
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(error) = res {
                            warn!(%error, "failed to listen for Ctrl-C");
                        }
                    },
                    _ = term.recv() => debug!("SIGTERM received"),
                }
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                wait_for_ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        wait_for_ctrl_c().await;
    }
}

async fn wait_for_ctrl_c() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for Ctrl-C");
    }
}
