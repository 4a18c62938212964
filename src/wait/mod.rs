//! Waiting for a verified address on a freshly launched instance.
//!
//! [`wait_for_address`] polls the instance for addresses, races a
//! [`probe::RemoteProbe`] against every new one, and returns the first
//! address whose verification script passes. The wait is bounded by a global
//! deadline and by the context's interrupt token.

pub mod coordinator;
pub mod probe;

#[cfg(test)]
mod tests;

use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use self::coordinator::RaceCoordinator;
use crate::{
    context::BootstrapContext,
    network::Address,
    provider::{Addresser, ProviderError},
    race::RaceError,
    ssh::{ProbeError, SshClient},
};

/// Timing limits for [`wait_for_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SshTimeouts {
    /// Overall time allowed to find a verified address.
    pub timeout: Duration,
    /// Delay between verification attempts against one address.
    pub retry_delay: Duration,
    /// Delay between address polls.
    pub addresses_delay: Duration,
}

/// What had been observed when the deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// The instance never reported an address.
    NoAddresses,
    /// Addresses were reported but none passed verification.
    Unreachable,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAddresses => f.write_str("without getting any addresses"),
            Self::Unreachable => f.write_str("without being able to connect"),
        }
    }
}

/// Errors ending [`wait_for_address`] without an address.
#[derive(Debug, Error, Clone)]
pub enum WaitError {
    /// Refreshing the instance's address metadata failed.
    #[error("refreshing addresses: {0}")]
    Refresh(#[source] ProviderError),
    /// Listing the instance's addresses failed.
    #[error("getting addresses: {0}")]
    Addresses(#[source] ProviderError),
    /// The deadline passed before any address was verified.
    #[error("waited for {waited:?} {reason}{}", describe_last(.last_error))]
    Timeout {
        /// The deadline that passed.
        waited: Duration,
        /// Whether any address had been seen.
        reason: TimeoutReason,
        /// The failure reported last by any probe.
        last_error: Option<ProbeError>,
    },
    /// The user interrupted the wait.
    #[error("interrupted")]
    Interrupted,
    /// The race finished without recording its winner.
    #[error("address race finished without a result")]
    NoResult,
}

fn describe_last(err: &Option<ProbeError>) -> String {
    err.as_ref().map_or_else(String::new, |err| format!(": {err}"))
}

/// The error for a deadline that passed after `admitted` addresses were
/// probed. A probe that passes while the race drains does not undo the
/// timeout.
fn timeout_error(
    waited: Duration,
    admitted: usize,
    drained: Result<Address, RaceError<ProbeError>>,
) -> WaitError {
    let reason = if admitted == 0 {
        TimeoutReason::NoAddresses
    } else {
        TimeoutReason::Unreachable
    };
    let last_error = match drained {
        Err(RaceError::Failed(err)) => Some(err),
        Ok(addr) => {
            debug!(address = %addr, "address verified after the deadline");
            None
        }
        Err(RaceError::Stopped) => None,
    };
    WaitError::Timeout {
        waited,
        reason,
        last_error,
    }
}

/// Wait until `check_script` passes on one of `instance`'s addresses.
///
/// Addresses are polled immediately and then every
/// [`SshTimeouts::addresses_delay`]. Every new address gets its own probe;
/// the first to pass wins regardless of discovery order or scope. Whatever
/// the outcome, every probe has stopped before this returns.
///
/// # Errors
///
/// Returns [`WaitError::Refresh`] or [`WaitError::Addresses`] if polling
/// fails, [`WaitError::Timeout`] once [`SshTimeouts::timeout`] elapses, and
/// [`WaitError::Interrupted`] if the context's interrupt token fires.
pub async fn wait_for_address<A>(
    ctx: &BootstrapContext,
    client: Arc<dyn SshClient>,
    check_script: &str,
    instance: &A,
    timeouts: &SshTimeouts,
) -> Result<String, WaitError>
where
    A: Addresser + ?Sized,
{
    ctx.progress().line(format_args!("Waiting for address"));
    let mut checker = RaceCoordinator::new(
        client,
        ctx.progress().clone(),
        timeouts.retry_delay,
        check_script,
    );
    let outcome = drive(ctx, &mut checker, instance, timeouts).await;
    checker.shutdown().await;
    match &outcome {
        Ok(addr) => info!(address = %addr, "verified bootstrap address"),
        Err(error) => warn!(%error, "no verified bootstrap address"),
    }
    outcome
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! macro usage"
)]
async fn drive<A>(
    ctx: &BootstrapContext,
    checker: &mut RaceCoordinator,
    instance: &A,
    timeouts: &SshTimeouts,
) -> Result<String, WaitError>
where
    A: Addresser + ?Sized,
{
    let deadline = sleep(timeouts.timeout);
    let poll = sleep(Duration::ZERO);
    tokio::pin!(deadline, poll);
    let dead = checker.dead();
    let interrupt = ctx.interrupt().clone();
    loop {
        tokio::select! {
            () = &mut poll => {
                poll.as_mut().reset(Instant::now() + timeouts.addresses_delay);
                instance.refresh().await.map_err(WaitError::Refresh)?;
                let addrs = instance.addresses().await.map_err(WaitError::Addresses)?;
                let started = checker.admit(&addrs);
                debug!(seen = addrs.len(), started, "polled instance addresses");
            }
            () = &mut deadline => {
                let admitted = checker.admitted();
                let drained = checker.wait().await;
                return Err(timeout_error(timeouts.timeout, admitted, drained));
            }
            () = interrupt.cancelled() => return Err(WaitError::Interrupted),
            () = dead.cancelled() => {
                return checker.result().map(|addr| addr.value).ok_or(WaitError::NoResult);
            }
        }
    }
}
