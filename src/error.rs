//! Errors surfaced by the bootstrap entry point.

use thiserror::Error;

use crate::{
    configure::ConfigureError,
    machine::MachineConfigError,
    provider::ProviderError,
    wait::WaitError,
};

/// Reasons a bootstrap attempt failed.
///
/// None of these are retried. An instance that was started before the
/// failure is left running for the operator to inspect.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// No SSH client is available, so the instance could never be reached.
    #[error("no SSH client available")]
    NoSshClient,
    /// No tools were built for the chosen series.
    #[error("no matching tools available for series {series:?}")]
    NoMatchingTools {
        /// Series that was searched for.
        series: String,
    },
    /// The provider could not start the instance.
    #[error("cannot start bootstrap instance: {0}")]
    StartInstance(#[source] ProviderError),
    /// The provider did not report the instance's architecture.
    #[error("bootstrap instance {0} reported no architecture")]
    UnknownArch(String),
    /// The machine configuration could not be completed.
    #[error(transparent)]
    MachineConfig(#[from] MachineConfigError),
    /// No verified address was found.
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// Configuring the verified instance failed.
    #[error(transparent)]
    Configure(#[from] ConfigureError),
}
