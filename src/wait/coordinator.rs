//! Tracks one probe per admitted address inside a shared race.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::probe::RemoteProbe;
use crate::{
    context::Progress,
    network::{Address, SSH_PORT},
    race::{Race, RaceError},
    ssh::{ProbeError, SshClient},
};

/// Admits newly discovered addresses into a race of [`RemoteProbe`]s.
///
/// The coordinator has a single owner, the orchestrator loop, so admission
/// and teardown are linearised through `&mut self`. Once closed, further
/// admissions are ignored.
pub struct RaceCoordinator {
    race: Race<Address, ProbeError>,
    client: Arc<dyn SshClient>,
    progress: Progress,
    active: HashMap<Address, CancellationToken>,
    retry_delay: Duration,
    check_script: Arc<str>,
    closed: bool,
}

impl RaceCoordinator {
    /// Create a coordinator whose probes run `check_script` through `client`.
    #[must_use]
    pub fn new(
        client: Arc<dyn SshClient>,
        progress: Progress,
        retry_delay: Duration,
        check_script: &str,
    ) -> Self {
        Self {
            race: Race::new(),
            client,
            progress,
            active: HashMap::new(),
            retry_delay,
            check_script: Arc::from(check_script),
            closed: false,
        }
    }

    /// Start a probe for each address not seen before.
    ///
    /// Returns the number of probes started.
    pub fn admit(&mut self, addrs: &[Address]) -> usize {
        if self.closed {
            debug!(count = addrs.len(), "ignoring addresses after close");
            return 0;
        }
        let mut started = 0;
        for addr in addrs {
            if self.active.contains_key(addr) {
                continue;
            }
            let closed = CancellationToken::new();
            let probe = RemoteProbe {
                addr: addr.clone(),
                client: Arc::clone(&self.client),
                retry_delay: self.retry_delay,
                check_script: Arc::clone(&self.check_script),
                closed: closed.clone(),
            };
            if self.race.start(|dying| probe.run(dying)).is_err() {
                break;
            }
            self.progress
                .line(format_args!("Attempting to connect to {}:{SSH_PORT}", addr.value));
            info!(address = %addr, scope = %addr.scope, "probing address");
            self.active.insert(addr.clone(), closed);
            started += 1;
        }
        started
    }

    /// Number of addresses ever admitted.
    #[must_use]
    pub fn admitted(&self) -> usize { self.active.len() }

    /// Stop admitting addresses and tell every probe to stop.
    ///
    /// Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.race.close();
        for closed in self.active.values() {
            closed.cancel();
        }
    }

    /// Close, then join every probe and report the race outcome.
    ///
    /// # Errors
    ///
    /// Returns the error reported last by any probe, or
    /// [`RaceError::Stopped`] if none reported one.
    pub async fn wait(&mut self) -> Result<Address, RaceError<ProbeError>> {
        self.close();
        self.race.wait().await
    }

    /// Close, kill the race, and join every probe, discarding the outcome.
    pub async fn shutdown(&mut self) {
        self.close();
        self.race.kill();
        if let Err(err) = self.race.wait().await {
            debug!(error = %err, "address race ended without a winner");
        }
    }

    /// Token that fires once a probe has won.
    #[must_use]
    pub fn dead(&self) -> CancellationToken { self.race.dead() }

    /// The winning address, once a probe has won.
    #[must_use]
    pub fn result(&self) -> Option<Address> { self.race.result() }
}
