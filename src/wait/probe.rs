//! Repeated verification attempts against a single candidate address.

use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    network::Address,
    race::Finish,
    ssh::{ProbeError, SshClient, check_host},
};

/// Retries the verification script against one address until it passes or
/// the probe is told to stop.
pub struct RemoteProbe {
    /// Address under test.
    pub addr: Address,
    /// Session capability used for each attempt.
    pub client: Arc<dyn SshClient>,
    /// Delay between failed attempts.
    pub retry_delay: Duration,
    /// Script that must exit zero on the right host.
    pub check_script: Arc<str>,
    /// Fires when this address should no longer be probed.
    pub closed: CancellationToken,
}

impl RemoteProbe {
    /// Probe until the script passes or `closed` or `dying` fires.
    ///
    /// On success the probe wins with its address. When stopped it reports
    /// the last attempt's error, or [`Finish::Stopped`] if no attempt had
    /// completed. An attempt still in flight when the probe stops is
    /// aborted rather than awaited.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! macro usage"
    )]
    pub async fn run(self, dying: CancellationToken) -> Finish<Address, ProbeError> {
        let mut last_err: Option<ProbeError> = None;
        loop {
            let client = Arc::clone(&self.client);
            let host = self.addr.value.clone();
            let script = Arc::clone(&self.check_script);
            let mut attempt =
                tokio::spawn(async move { check_host(client.as_ref(), &host, &script).await });
            tokio::select! {
                () = self.closed.cancelled() => {
                    attempt.abort();
                    return stopped(last_err);
                }
                () = dying.cancelled() => {
                    attempt.abort();
                    return stopped(last_err);
                }
                joined = &mut attempt => match joined {
                    Ok(Ok(())) => return Finish::Won(self.addr),
                    Ok(Err(err)) => {
                        debug!(address = %self.addr, error = %err, "address check failed");
                        last_err = Some(err);
                    }
                    Err(error) => debug!(address = %self.addr, %error, "address check aborted"),
                },
            }
            tokio::select! {
                () = self.closed.cancelled() => return stopped(last_err),
                () = dying.cancelled() => return stopped(last_err),
                () = sleep(self.retry_delay) => {}
            }
        }
    }
}

fn stopped(last_err: Option<ProbeError>) -> Finish<Address, ProbeError> {
    last_err.map_or(Finish::Stopped, Finish::Failed)
}
