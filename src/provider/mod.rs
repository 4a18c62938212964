//! Capabilities the bootstrap flow consumes from a compute provider.
//!
//! Launching instances and reporting their addresses are provider specific.
//! The traits here describe only what bootstrap needs, so the address race
//! and the entry point stay independent of any particular cloud API.

pub mod manual;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    machine::{Constraints, HardwareCharacteristics, MachineConfig},
    network::Address,
    tools::{Tools, ToolsList},
};

/// Provider-assigned identifier of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap a provider identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Errors reported by provider capabilities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The requested placement cannot be honoured.
    #[error("invalid placement directive {0:?}")]
    InvalidPlacement(String),
    /// No tools were supplied for the instance.
    #[error("no tools supplied for instance")]
    NoTools,
    /// The provider's backend failed.
    #[error("{0}")]
    Backend(String),
}

/// Reports the network addresses of an instance.
#[async_trait]
pub trait Addresser: Send + Sync {
    /// Re-fetch address metadata from the provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the metadata could not be fetched.
    async fn refresh(&self) -> Result<(), ProviderError>;

    /// Addresses known as of the last [`Addresser::refresh`].
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the addresses are unavailable.
    async fn addresses(&self) -> Result<Vec<Address>, ProviderError>;
}

/// A launched instance.
pub trait Instance: Addresser {
    /// The provider's identifier for this instance.
    fn id(&self) -> &InstanceId;
}

/// Arguments to [`InstanceProvisioner::start_instance`].
#[derive(Debug, Clone)]
pub struct StartInstanceParams {
    /// Resource constraints for the instance.
    pub constraints: Constraints,
    /// Tools the instance may run, already filtered by series.
    pub tools: ToolsList,
    /// Machine configuration the instance should boot with.
    pub machine_config: MachineConfig,
    /// Provider-specific placement directive.
    pub placement: Option<String>,
}

/// An instance returned by [`InstanceProvisioner::start_instance`].
#[derive(Clone)]
pub struct StartedInstance {
    /// Handle to the running instance.
    pub instance: Arc<dyn Instance>,
    /// Hardware the provider allocated.
    pub hardware: HardwareCharacteristics,
    /// Tools chosen for the instance's architecture.
    pub tools: Tools,
}

impl fmt::Debug for StartedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartedInstance")
            .field("instance", self.instance.id())
            .field("hardware", &self.hardware)
            .field("tools", &self.tools)
            .finish()
    }
}

/// Launches instances.
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    /// Launch an instance and report its identity and hardware.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the instance could not be started.
    async fn start_instance(
        &self,
        params: StartInstanceParams,
    ) -> Result<StartedInstance, ProviderError>;
}
