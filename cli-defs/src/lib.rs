//! Shared CLI type definitions for clusterboot build and runtime.
//!
//! This crate provides CLI argument and configuration types used by both the
//! `build.rs` script (for man page generation) and the runtime binary.
//! Keeping them in a separate crate lets the build script render the man page
//! without compiling the bootstrap runtime.

// FIXME: File-wide suppressions are unavoidable here. Clap and OrthoConfig derive macros
// inject generated code throughout the module, and there is no mechanism to narrow
// the scope without restructuring the crate.
#![expect(
    non_snake_case,
    reason = "Clap/OrthoConfig derive macros generate helper modules with uppercase names"
)]
#![expect(
    missing_docs,
    reason = "OrthoConfig and Clap derive macros generate items that cannot be documented"
)]

use clap::{Args, Parser, Subcommand};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

/// Default SSH executable, looked up on `PATH`.
pub const DEFAULT_SSH_PROGRAM: &str = "ssh";
/// Default time allowed to find a verified address, in seconds.
pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 600;
/// Default delay between verification attempts, in seconds.
pub const DEFAULT_BOOTSTRAP_RETRY_DELAY_SECS: u64 = 5;
/// Default delay between address polls, in seconds.
pub const DEFAULT_BOOTSTRAP_ADDRESSES_DELAY_SECS: u64 = 10;
/// Default operating system series.
pub const DEFAULT_SERIES: &str = "jammy";
/// Default agent data directory on the bootstrap node.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/clusterboot";
/// Default location of the local bootstrap state record.
pub const DEFAULT_STATE_FILE: &str = ".clusterboot-state.json";

/// Names of the subcommands, in the order they are declared.
pub const SUBCOMMANDS: &[&str] = &["bootstrap", "check-host", "configure"];

/// Arguments for the `bootstrap` subcommand.
#[derive(Parser, OrthoConfig, Deserialize, Serialize, Default, Debug, Clone)]
#[ortho_config(prefix = "CLUSTERBOOT_")]
pub struct BootstrapArgs {
    /// Host to adopt as the bootstrap node.
    #[arg(long)]
    pub host: Option<String>,
    /// Comma-separated tools builds, each `version-series-arch[=url]`.
    #[arg(long)]
    pub tools: Option<String>,
    /// Resource constraints, for example `arch=amd64 mem=4G`.
    #[arg(long)]
    pub constraints: Option<String>,
    /// Provider-specific placement directive.
    #[arg(long)]
    pub placement: Option<String>,
    /// Where to record the launched instance.
    #[arg(long)]
    pub state_file: Option<String>,
}

/// Arguments for the `check-host` subcommand.
#[derive(Parser, OrthoConfig, Deserialize, Serialize, Default, Debug, Clone)]
#[ortho_config(prefix = "CLUSTERBOOT_")]
pub struct CheckHostArgs {
    /// Host to verify.
    #[arg(long)]
    pub host: Option<String>,
    /// Expected machine nonce. Read from the state record when omitted.
    #[arg(long)]
    pub nonce: Option<String>,
    /// Bootstrap state record to read the nonce from.
    #[arg(long)]
    pub state_file: Option<String>,
}

/// Arguments for the `configure` subcommand.
#[derive(Parser, OrthoConfig, Deserialize, Serialize, Default, Debug, Clone)]
#[ortho_config(prefix = "CLUSTERBOOT_")]
pub struct ConfigureArgs {
    /// Verified address of the bootstrap node.
    #[arg(long)]
    pub host: Option<String>,
    /// Bootstrap state record describing the node.
    #[arg(long)]
    pub state_file: Option<String>,
}

/// CLI subcommands exposed by `clusterboot`.
#[derive(Subcommand, Deserialize, Serialize, Debug, Clone)]
pub enum Commands {
    /// Adopt a host as the bootstrap node and configure it.
    #[command(name = "bootstrap")]
    Bootstrap(BootstrapArgs),
    /// Run the nonce verification script against a host once.
    #[command(name = "check-host")]
    CheckHost(CheckHostArgs),
    /// Configure an already verified bootstrap node.
    #[command(name = "configure")]
    Configure(ConfigureArgs),
}

/// Runtime configuration shared by every subcommand.
#[derive(Args, OrthoConfig, Serialize, Deserialize, Default, Debug, Clone)]
#[ortho_config(prefix = "CLUSTERBOOT_")]
pub struct AppConfig {
    /// SSH executable used to reach the bootstrap node.
    #[ortho_config(default = DEFAULT_SSH_PROGRAM.to_owned())]
    #[arg(long, default_value_t = String::from(DEFAULT_SSH_PROGRAM))]
    pub ssh_program: String,
    /// Seconds allowed to find a verified address.
    #[ortho_config(default = DEFAULT_BOOTSTRAP_TIMEOUT_SECS)]
    #[arg(long, default_value_t = DEFAULT_BOOTSTRAP_TIMEOUT_SECS)]
    pub bootstrap_timeout_secs: u64,
    /// Seconds between verification attempts against one address.
    #[ortho_config(default = DEFAULT_BOOTSTRAP_RETRY_DELAY_SECS)]
    #[arg(long, default_value_t = DEFAULT_BOOTSTRAP_RETRY_DELAY_SECS)]
    pub bootstrap_retry_delay_secs: u64,
    /// Seconds between address polls.
    #[ortho_config(default = DEFAULT_BOOTSTRAP_ADDRESSES_DELAY_SECS)]
    #[arg(long, default_value_t = DEFAULT_BOOTSTRAP_ADDRESSES_DELAY_SECS)]
    pub bootstrap_addresses_delay_secs: u64,
    /// Operating system series to bootstrap.
    #[ortho_config(default = DEFAULT_SERIES.to_owned())]
    #[arg(long, default_value_t = String::from(DEFAULT_SERIES))]
    pub default_series: String,
    /// Agent data directory on the bootstrap node.
    #[ortho_config(default = DEFAULT_DATA_DIR.to_owned())]
    #[arg(long, default_value_t = String::from(DEFAULT_DATA_DIR))]
    pub data_dir: String,
    /// Skip refreshing the package index while configuring.
    #[ortho_config(default = false)]
    #[arg(long)]
    pub disable_os_refresh_update: bool,
    /// Skip upgrading packages while configuring.
    #[ortho_config(default = false)]
    #[arg(long)]
    pub disable_os_upgrade: bool,
}

/// Top-level CLI entry point consumed by the binary.
#[derive(Parser, Deserialize, Serialize, Debug, Clone)]
#[command(name = "clusterboot", about = "Provision the first control node of a cluster")]
pub struct Cli {
    /// Application configuration.
    #[command(flatten)]
    pub config: AppConfig,
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}
