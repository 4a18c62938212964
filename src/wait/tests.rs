//! Address race scenarios driven with paused time.

use std::{sync::Arc, time::Duration};

use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::{
    network::AddressScope,
    test_helpers::{ScriptedInstance, ScriptedSsh, SharedBuffer},
};

struct Harness {
    ssh: Arc<ScriptedSsh>,
    buffer: SharedBuffer,
    ctx: BootstrapContext,
    timeouts: SshTimeouts,
}

impl Harness {
    async fn wait(&self, instance: &ScriptedInstance) -> Result<String, WaitError> {
        wait_for_address(&self.ctx, self.ssh.clone(), "check", instance, &self.timeouts).await
    }
}

#[fixture]
fn harness() -> Harness {
    let buffer = SharedBuffer::default();
    Harness {
        ssh: Arc::new(ScriptedSsh::new()),
        ctx: BootstrapContext::new(buffer.progress(), CancellationToken::new()),
        buffer,
        timeouts: SshTimeouts {
            timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(1),
            addresses_delay: Duration::from_secs(2),
        },
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn late_address_wins_on_its_second_attempt(harness: Harness) {
    let instance = ScriptedInstance::new("i-1").then(&[]).then(&["10.0.0.5"]);
    harness.ssh.fail("10.0.0.5", 1, "/var/lib/clusterboot/nonce.txt does not exist");
    harness.ssh.succeed("10.0.0.5");

    let addr = harness.wait(&instance).await.expect("verified address");

    assert_eq!(addr, "10.0.0.5");
    assert_eq!(harness.ssh.attempts("10.0.0.5"), 2);
    assert_eq!(
        harness.buffer.contents(),
        "Waiting for address\nAttempting to connect to 10.0.0.5:22\n"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn no_addresses_before_the_deadline(mut harness: Harness) {
    harness.timeouts.timeout = Duration::from_millis(100);
    let instance = ScriptedInstance::new("i-1").then(&[]);

    let err = harness.wait(&instance).await.expect_err("deadline passes");

    assert!(matches!(
        err,
        WaitError::Timeout {
            reason: TimeoutReason::NoAddresses,
            last_error: None,
            ..
        }
    ));
    assert_eq!(err.to_string(), "waited for 100ms without getting any addresses");
    assert!(harness.ssh.targets().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unreachable_addresses_report_last_failure(mut harness: Harness) {
    harness.timeouts.timeout = Duration::from_secs(5);
    let instance = ScriptedInstance::new("i-1").then(&["10.0.0.4", "192.0.2.9"]);
    harness.ssh.fail(
        "10.0.0.4",
        1,
        "/var/lib/clusterboot/nonce.txt contents do not match machine nonce",
    );
    harness.ssh.fail(
        "192.0.2.9",
        1,
        "/var/lib/clusterboot/nonce.txt contents do not match machine nonce",
    );

    let err = harness.wait(&instance).await.expect_err("deadline passes");

    let text = err.to_string();
    assert!(text.starts_with("waited for 5s without being able to connect: "), "{text}");
    assert!(text.ends_with("contents do not match machine nonce"), "{text}");
    assert!(harness.ssh.attempts("10.0.0.4") >= 5);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn deadline_while_sessions_hang_reports_no_detail(mut harness: Harness) {
    harness.timeouts.timeout = Duration::from_secs(5);
    let instance = ScriptedInstance::new("i-1").then(&["10.0.0.4"]);
    harness.ssh.hang("10.0.0.4");

    let err = harness.wait(&instance).await.expect_err("deadline passes");

    assert_eq!(err.to_string(), "waited for 5s without being able to connect");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn repeated_addresses_are_announced_once(harness: Harness) {
    let instance = ScriptedInstance::new("i-1")
        .then(&["10.0.0.4"])
        .then(&["10.0.0.4", "10.0.0.5"])
        .then(&["10.0.0.5", "10.0.0.4"]);
    harness.ssh.fail("10.0.0.4", 255, "");
    for _ in 0..4 {
        harness.ssh.fail("10.0.0.5", 1, "/var/lib/clusterboot/nonce.txt does not exist");
    }
    harness.ssh.succeed("10.0.0.5");

    let addr = harness.wait(&instance).await.expect("verified address");

    assert_eq!(addr, "10.0.0.5");
    assert!(instance.refreshes() >= 3);
    let notices = harness.buffer.contents();
    assert_eq!(notices.matches("Attempting to connect to 10.0.0.4:22").count(), 1);
    assert_eq!(notices.matches("Attempting to connect to 10.0.0.5:22").count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn refresh_failure_is_fatal(harness: Harness) {
    let instance = ScriptedInstance::new("i-1").then(&["10.0.0.5"]);
    instance.fail_refresh(ProviderError::Backend("metadata service unavailable".to_owned()));

    let err = harness.wait(&instance).await.expect_err("refresh fails");

    assert_eq!(
        err.to_string(),
        "refreshing addresses: metadata service unavailable"
    );
    assert_eq!(instance.refreshes(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn listing_failure_after_admission_stops_probes(harness: Harness) {
    let instance = ScriptedInstance::new("i-1").then(&["10.0.0.5"]);
    harness.ssh.hang("10.0.0.5");
    let failing = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        instance.fail_addresses(ProviderError::Backend("throttled".to_owned()));
    };

    let (outcome, ()) = tokio::join!(harness.wait(&instance), failing);

    let err = outcome.expect_err("listing fails");
    assert_eq!(err.to_string(), "getting addresses: throttled");
    assert_eq!(harness.ssh.attempts("10.0.0.5"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn interrupt_ends_the_wait(harness: Harness) {
    let instance = ScriptedInstance::new("i-1").then(&["10.0.0.5"]);
    harness.ssh.hang("10.0.0.5");
    let interrupt = harness.ctx.interrupt().clone();
    let trigger = async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        interrupt.cancel();
    };

    let (outcome, ()) = tokio::join!(harness.wait(&instance), trigger);

    assert!(matches!(outcome, Err(WaitError::Interrupted)));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn first_verified_address_wins_over_earlier_discoveries(harness: Harness) {
    let instance = ScriptedInstance::new("i-1").then(&["203.0.113.8", "10.0.0.5", "fe80::1"]);
    harness.ssh.hang("203.0.113.8");
    harness.ssh.fail("fe80::1", 255, "ssh: connect to host fe80::1 port 22: No route to host");
    harness.ssh.succeed("10.0.0.5");

    let addr = harness.wait(&instance).await.expect("verified address");

    assert_eq!(addr, "10.0.0.5");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn transport_errors_are_retried(harness: Harness) {
    let instance = ScriptedInstance::new("i-1").then(&["10.0.0.5"]);
    harness.ssh.transport_error("10.0.0.5", "connection reset by peer");
    harness.ssh.succeed("10.0.0.5");

    let addr = harness.wait(&instance).await.expect("verified address");

    assert_eq!(addr, "10.0.0.5");
    assert_eq!(harness.ssh.attempts("10.0.0.5"), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn transport_error_text_is_the_timeout_detail(mut harness: Harness) {
    harness.timeouts.timeout = Duration::from_secs(5);
    let instance = ScriptedInstance::new("i-1").then(&["10.0.0.5"]);
    harness.ssh.transport_error("10.0.0.5", "connection reset by peer");

    let err = harness.wait(&instance).await.expect_err("deadline passes");

    assert!(matches!(
        err,
        WaitError::Timeout {
            last_error: Some(ProbeError::Transport(_)),
            ..
        }
    ));
    assert_eq!(
        err.to_string(),
        "waited for 5s without being able to connect: \
         remote session I/O failed: connection reset by peer"
    );
    assert!(harness.ssh.attempts("10.0.0.5") > 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn slow_refreshes_do_not_stretch_the_poll_interval(mut harness: Harness) {
    harness.timeouts.timeout = Duration::from_secs(9);
    let instance = ScriptedInstance::new("i-1")
        .then(&[])
        .slow_refresh(Duration::from_millis(1500));

    let err = harness.wait(&instance).await.expect_err("deadline passes");

    assert!(matches!(
        err,
        WaitError::Timeout {
            reason: TimeoutReason::NoAddresses,
            ..
        }
    ));
    assert_eq!(instance.refreshes(), 5);
}

#[rstest]
#[case::verified_while_draining(Ok(Address::new("10.0.0.5", AddressScope::CloudLocal)), None)]
#[case::stopped(Err(RaceError::Stopped), None)]
#[case::failed(
    Err(RaceError::Failed(ProbeError::Exit(Some(255)))),
    Some("exit status 255")
)]
fn the_deadline_always_ends_in_a_timeout(
    #[case] drained: Result<Address, RaceError<ProbeError>>,
    #[case] detail: Option<&str>,
) {
    let err = timeout_error(Duration::from_secs(5), 1, drained);

    let WaitError::Timeout {
        reason, last_error, ..
    } = &err
    else {
        panic!("expected a timeout, got {err:?}");
    };
    assert_eq!(*reason, TimeoutReason::Unreachable);
    assert_eq!(last_error.as_ref().map(ToString::to_string).as_deref(), detail);
}
