//! Core library for clusterboot.
//!
//! clusterboot provisions the first control node of a cluster. It launches
//! an instance, races verification probes against every address the instance
//! reports, and configures the node over the first address that proves,
//! through a boot-time nonce, that it belongs to the instance just launched.
//!
//! The binary is a thin wrapper around [`app::run`]; everything else is
//! usable as a library with injected [`ssh::SshClient`],
//! [`provider::InstanceProvisioner`] and [`configure::Configurator`]
//! implementations.

pub mod app;
pub mod bootstrap;
pub mod cloudinit;
pub mod configure;
pub mod context;
pub mod error;
pub mod machine;
pub mod network;
pub mod provider;
pub mod race;
pub mod shell;
pub mod ssh;
pub mod tools;
pub mod wait;

#[cfg(any(test, feature = "test-support"))]
pub mod test_helpers;
