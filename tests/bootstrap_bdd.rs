//! BDD-style integration tests for bootstrapping a manual host.
//!
//! The host is reached through scripted SSH sessions, so each scenario
//! controls what the host reports and whether it holds the machine nonce.

use std::{cell::RefCell, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clusterboot::{
    app::{commands::bootstrap_host, state::read_state},
    bootstrap::{BootstrapParams, EnvironSettings},
    context::BootstrapContext,
    ssh::SshClient,
    test_helpers::{ScriptedSsh, SharedBuffer},
    tools::ToolsList,
    wait::SshTimeouts,
};
use rstest::fixture;
use rstest_bdd::{assert_step_err, assert_step_ok};
use rstest_bdd_macros::{given, scenarios, then, when};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct BootstrapWorld {
    _temp_dir: TempDir,
    state_file: Utf8PathBuf,
    buffer: SharedBuffer,
    ssh: ScriptedSsh,
    host: RefCell<String>,
    outcome: RefCell<Option<Result<()>>>,
}

impl BootstrapWorld {
    fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("failed to create tempdir for test")?;
        let state_file = Utf8PathBuf::from_path_buf(temp_dir.path().join("state.json"))
            .map_err(|path| anyhow::anyhow!("non-UTF-8 temp path {}", path.display()))?;
        Ok(Self {
            _temp_dir: temp_dir,
            state_file,
            buffer: SharedBuffer::default(),
            ssh: ScriptedSsh::new(),
            host: RefCell::new(String::new()),
            outcome: RefCell::new(None),
        })
    }

    fn host(&self) -> String { self.host.borrow().clone() }

    fn settings() -> EnvironSettings {
        EnvironSettings::new(SshTimeouts {
            timeout: Duration::from_millis(300),
            retry_delay: Duration::from_millis(20),
            addresses_delay: Duration::from_millis(50),
        })
    }

    async fn bootstrap(&self, tools: &str) -> Result<()> {
        let params = BootstrapParams {
            available_tools: ToolsList::parse(tools).context("invalid tools")?,
            ..BootstrapParams::default()
        };
        let ctx = BootstrapContext::new(self.buffer.progress(), CancellationToken::new());
        let client: Arc<dyn SshClient> = Arc::new(self.ssh.clone());
        bootstrap_host(
            &ctx,
            &self.host(),
            Some(client),
            Self::settings(),
            params,
            &self.state_file,
        )
        .await
    }

    fn assert_failure_contains(&self, message: &str) {
        let outcome_ref = self.outcome.borrow();
        let Some(outcome) = outcome_ref.as_ref() else {
            panic!("bootstrap not executed");
        };
        let status = outcome.as_ref().map_err(|err| format!("{err:#}"));
        let text = assert_step_err!(status);
        assert!(
            text.contains(message),
            "expected error to contain '{message}', got '{text}'"
        );
    }
}

#[fixture]
fn world() -> BootstrapWorld {
    BootstrapWorld::new().unwrap_or_else(|err| {
        panic!("failed to create test world: {err}");
    })
}

#[given("a manual host \"{host}\" reporting architecture \"{arch}\"")]
fn given_manual_host(world: &BootstrapWorld, host: String, arch: String) {
    world.ssh.respond(
        &host,
        0,
        &format!("clusterboot-arch={arch}\nclusterboot-cores=2\nclusterboot-mem-kb=2097152\n"),
    );
    world.host.replace(host);
}

#[given("the host holds the machine nonce")]
fn given_nonce_matches(world: &BootstrapWorld) { world.ssh.succeed(&world.host()); }

#[given("the host holds a stale nonce")]
fn given_stale_nonce(world: &BootstrapWorld) {
    world.ssh.fail(
        &world.host(),
        1,
        "/var/lib/clusterboot/nonce.txt contents do not match machine nonce\n",
    );
}

#[when("the operator bootstraps it with tools \"{tools}\"")]
async fn when_bootstrapped(world: &BootstrapWorld, tools: String) {
    let result = world.bootstrap(&tools).await;
    world.outcome.borrow_mut().replace(result);
}

#[then("the bootstrap completes")]
fn then_success(world: &BootstrapWorld) {
    let outcome_ref = world.outcome.borrow();
    let Some(outcome) = outcome_ref.as_ref() else {
        panic!("bootstrap not executed");
    };
    let status = outcome.as_ref().map_err(ToString::to_string);
    assert_step_ok!(status);
}

#[then("the progress reports \"{line}\"")]
fn then_progress(world: &BootstrapWorld, line: String) {
    let contents = world.buffer.contents();
    assert!(
        contents.lines().any(|seen| seen == line),
        "expected progress line '{line}', got:\n{contents}"
    );
}

#[then("the launched instance \"{instance}\" is recorded")]
fn then_recorded(world: &BootstrapWorld, instance: String) {
    let record = read_state(&world.state_file).unwrap_or_else(|err| {
        panic!("state record missing: {err:#}");
    });
    assert_eq!(record.instance_id.as_str(), instance);
}

#[then("the bootstrap fails with message \"{message}\"")]
fn then_failure(world: &BootstrapWorld, message: String) { world.assert_failure_contains(&message); }

#[then("no configuration script was run")]
fn then_not_configured(world: &BootstrapWorld) {
    assert!(
        world
            .ssh
            .scripts()
            .iter()
            .all(|script| !script.starts_with("exec sudo")),
        "a configuration script was run"
    );
    assert!(
        !world
            .buffer
            .contents()
            .contains("Running configuration script")
    );
}

#[then("no session was opened")]
fn then_no_session(world: &BootstrapWorld) {
    assert!(world.ssh.targets().is_empty());
}

scenarios!(
    "tests/features/bootstrap.feature",
    runtime = "tokio-current-thread",
    fixtures = [world: BootstrapWorld]
);
