//! Bootstrap entry point.
//!
//! Bootstrap happens in two phases. [`Bootstrapper::bootstrap`] launches the
//! instance and returns straight away with its architecture and series, so
//! the caller can record what was started. The returned [`Finalizer`] then
//! waits for a verified address and configures the node. It consumes itself,
//! so it can only run once.

use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::info;

use crate::{
    configure::{CloudConfigurator, Configurator, nonce_check_script},
    context::BootstrapContext,
    error::BootstrapError,
    machine::{Constraints, DEFAULT_DATA_DIR, HardwareCharacteristics, MachineConfig},
    provider::{Instance, InstanceId, InstanceProvisioner, StartInstanceParams},
    ssh::SshClient,
    tools::{Tools, ToolsFilter, ToolsList},
    wait::{SshTimeouts, wait_for_address},
};

/// Series used when none is configured.
pub const DEFAULT_SERIES: &str = "jammy";

/// Environment-wide settings that shape the bootstrap node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironSettings {
    /// Operating system series to bootstrap.
    pub preferred_series: String,
    /// Agent data directory on the node.
    pub data_dir: Utf8PathBuf,
    /// Whether to refresh the package index while configuring.
    pub enable_os_refresh_update: bool,
    /// Whether to upgrade packages while configuring.
    pub enable_os_upgrade: bool,
    /// Limits for finding a verified address.
    pub ssh_timeouts: SshTimeouts,
}

impl EnvironSettings {
    /// Default series, data directory and package handling with the given
    /// address timeouts.
    #[must_use]
    pub fn new(ssh_timeouts: SshTimeouts) -> Self {
        Self {
            preferred_series: DEFAULT_SERIES.to_owned(),
            data_dir: Utf8PathBuf::from(DEFAULT_DATA_DIR),
            enable_os_refresh_update: true,
            enable_os_upgrade: true,
            ssh_timeouts,
        }
    }
}

/// Arguments to [`Bootstrapper::bootstrap`].
#[derive(Debug, Clone, Default)]
pub struct BootstrapParams {
    /// Resource constraints for the node.
    pub constraints: Constraints,
    /// Provider-specific placement directive.
    pub placement: Option<String>,
    /// Every tools build the node could run.
    pub available_tools: ToolsList,
}

/// Result of the first bootstrap phase.
pub struct BootstrapOutcome {
    /// Architecture of the launched instance.
    pub arch: String,
    /// Series the instance runs.
    pub series: String,
    /// Machine configuration the instance was launched with.
    pub machine_config: MachineConfig,
    /// Completes the bootstrap.
    pub finalizer: Finalizer,
}

/// Launches the bootstrap node.
pub struct Bootstrapper {
    provisioner: Arc<dyn InstanceProvisioner>,
    client: Option<Arc<dyn SshClient>>,
    configurator: Arc<dyn Configurator>,
    settings: EnvironSettings,
}

impl Bootstrapper {
    /// Bootstrap through `provisioner`, reaching the node with `client`.
    ///
    /// The node is configured with [`CloudConfigurator`] unless
    /// [`Bootstrapper::with_configurator`] says otherwise.
    #[must_use]
    pub fn new(
        provisioner: Arc<dyn InstanceProvisioner>,
        client: Option<Arc<dyn SshClient>>,
        settings: EnvironSettings,
    ) -> Self {
        Self {
            provisioner,
            client,
            configurator: Arc::new(CloudConfigurator),
            settings,
        }
    }

    /// Configure the node with `configurator` instead.
    #[must_use]
    pub fn with_configurator(mut self, configurator: Arc<dyn Configurator>) -> Self {
        self.configurator = configurator;
        self
    }

    /// Launch the bootstrap instance.
    ///
    /// Writes "Launching instance" and then the instance id to the progress
    /// stream. Nothing is launched if no tools match the series or no SSH
    /// client is available.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::NoMatchingTools`],
    /// [`BootstrapError::NoSshClient`], [`BootstrapError::StartInstance`] or
    /// [`BootstrapError::UnknownArch`].
    pub async fn bootstrap(
        &self,
        ctx: &BootstrapContext,
        params: BootstrapParams,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let series = self.settings.preferred_series.clone();
        let filter = ToolsFilter {
            series: Some(series.clone()),
            arch: None,
        };
        let tools = params
            .available_tools
            .matching(&filter)
            .map_err(|_| BootstrapError::NoMatchingTools {
                series: series.clone(),
            })?;
        let client = self.client.clone().ok_or(BootstrapError::NoSshClient)?;

        let mut machine_config = MachineConfig::bootstrap(params.constraints.clone(), &series);
        machine_config.data_dir.clone_from(&self.settings.data_dir);
        machine_config.enable_os_refresh_update = self.settings.enable_os_refresh_update;
        machine_config.enable_os_upgrade = self.settings.enable_os_upgrade;

        ctx.progress().line(format_args!("Launching instance"));
        let started = self
            .provisioner
            .start_instance(StartInstanceParams {
                constraints: params.constraints,
                tools,
                machine_config: machine_config.clone(),
                placement: params.placement,
            })
            .await
            .map_err(BootstrapError::StartInstance)?;
        let id = started.instance.id().clone();
        ctx.progress().line(format_args!(" - {id}"));
        let arch = started
            .hardware
            .arch
            .clone()
            .ok_or_else(|| BootstrapError::UnknownArch(id.to_string()))?;
        info!(instance = %id, %arch, %series, hardware = %started.hardware, "bootstrap instance started");

        Ok(BootstrapOutcome {
            arch,
            series,
            machine_config,
            finalizer: Finalizer {
                instance: started.instance,
                hardware: started.hardware,
                tools: started.tools,
                client,
                configurator: Arc::clone(&self.configurator),
                settings: self.settings.clone(),
            },
        })
    }
}

/// Second bootstrap phase: verify the instance and configure it.
pub struct Finalizer {
    instance: Arc<dyn Instance>,
    hardware: HardwareCharacteristics,
    tools: Tools,
    client: Arc<dyn SshClient>,
    configurator: Arc<dyn Configurator>,
    settings: EnvironSettings,
}

impl Finalizer {
    /// Identifier of the launched instance.
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId { self.instance.id() }

    /// Hardware the provider allocated.
    #[must_use]
    pub const fn hardware(&self) -> &HardwareCharacteristics { &self.hardware }

    /// Tools chosen for the instance.
    #[must_use]
    pub const fn tools(&self) -> &Tools { &self.tools }

    /// Complete `mcfg`, wait for a verified address and configure the node.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::MachineConfig`] if `mcfg` cannot be
    /// completed, [`BootstrapError::Wait`] if no address is verified, and
    /// [`BootstrapError::Configure`] if configuration fails.
    pub async fn finalize(
        self,
        ctx: &BootstrapContext,
        mut mcfg: MachineConfig,
    ) -> Result<(), BootstrapError> {
        mcfg.instance_id = Some(self.instance.id().clone());
        mcfg.hardware = Some(self.hardware);
        mcfg.tools = Some(self.tools);
        mcfg.finish(&self.settings)?;

        let check_script = nonce_check_script(&mcfg.nonce_file(), &mcfg.machine_nonce);
        let addr = wait_for_address(
            ctx,
            Arc::clone(&self.client),
            &check_script,
            &*self.instance,
            &self.settings.ssh_timeouts,
        )
        .await?;
        self.configurator
            .configure(ctx, self.client.as_ref(), &addr, &mcfg)
            .await?;
        info!(instance = %self.instance.id(), address = %addr, "bootstrap finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        provider::ProviderError,
        test_helpers::{
            RecordingConfigurator,
            ScriptedInstance,
            ScriptedProvisioner,
            ScriptedSsh,
            SharedBuffer,
            test_timeouts,
        },
    };

    fn amd64() -> HardwareCharacteristics {
        HardwareCharacteristics {
            arch: Some("amd64".to_owned()),
            cpu_cores: Some(2),
            mem_mb: Some(2048),
            root_disk_mb: None,
        }
    }

    fn params() -> BootstrapParams {
        BootstrapParams {
            available_tools: ToolsList::parse("1.0.0-jammy-amd64,1.0.0-focal-amd64")
                .expect("tools"),
            ..BootstrapParams::default()
        }
    }

    #[fixture]
    fn buffer() -> SharedBuffer { SharedBuffer::default() }

    fn context(buffer: &SharedBuffer) -> BootstrapContext {
        BootstrapContext::new(buffer.progress(), CancellationToken::new())
    }

    #[rstest]
    #[tokio::test]
    async fn bootstrap_reports_arch_and_series(buffer: SharedBuffer) {
        let instance = Arc::new(ScriptedInstance::new("i-0abc"));
        let provisioner = Arc::new(ScriptedProvisioner::new(instance, amd64()));
        let ssh: Arc<dyn SshClient> = Arc::new(ScriptedSsh::new());
        let bootstrapper =
            Bootstrapper::new(provisioner.clone(), Some(ssh), EnvironSettings::new(test_timeouts()));

        let outcome = bootstrapper
            .bootstrap(&context(&buffer), params())
            .await
            .expect("launched");

        assert_eq!(outcome.arch, "amd64");
        assert_eq!(outcome.series, "jammy");
        assert_eq!(outcome.finalizer.instance_id().as_str(), "i-0abc");
        assert_eq!(buffer.contents(), "Launching instance\n - i-0abc\n");
        let requests = provisioner.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests.iter().all(|r| r.tools.len() == 1));
    }

    #[rstest]
    #[tokio::test]
    async fn missing_tools_stop_before_launch(buffer: SharedBuffer) {
        let instance = Arc::new(ScriptedInstance::new("i-0abc"));
        let provisioner = Arc::new(ScriptedProvisioner::new(instance, amd64()));
        let settings = EnvironSettings {
            preferred_series: "noble".to_owned(),
            ..EnvironSettings::new(test_timeouts())
        };
        let bootstrapper = Bootstrapper::new(
            provisioner.clone(),
            Some(Arc::new(ScriptedSsh::new())),
            settings,
        );

        let err = bootstrapper
            .bootstrap(&context(&buffer), params())
            .await
            .err()
            .expect("no noble tools");

        assert!(matches!(err, BootstrapError::NoMatchingTools { ref series } if series == "noble"));
        assert!(provisioner.requests().is_empty());
        assert!(buffer.contents().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_ssh_client_stops_before_launch(buffer: SharedBuffer) {
        let instance = Arc::new(ScriptedInstance::new("i-0abc"));
        let provisioner = Arc::new(ScriptedProvisioner::new(instance, amd64()));
        let bootstrapper = Bootstrapper::new(provisioner.clone(), None, EnvironSettings::new(test_timeouts()));

        let err = bootstrapper
            .bootstrap(&context(&buffer), params())
            .await
            .err()
            .expect("no client");

        assert_eq!(err.to_string(), "no SSH client available");
        assert!(provisioner.requests().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn launch_failure_is_prefixed(buffer: SharedBuffer) {
        let instance = Arc::new(ScriptedInstance::new("i-0abc"));
        let provisioner = Arc::new(
            ScriptedProvisioner::new(instance, amd64())
                .failing(ProviderError::Backend("quota exceeded".to_owned())),
        );
        let bootstrapper = Bootstrapper::new(
            provisioner,
            Some(Arc::new(ScriptedSsh::new())),
            EnvironSettings::new(test_timeouts()),
        );

        let err = bootstrapper
            .bootstrap(&context(&buffer), params())
            .await
            .err()
            .expect("launch fails");

        assert_eq!(err.to_string(), "cannot start bootstrap instance: quota exceeded");
        assert_eq!(buffer.contents(), "Launching instance\n");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn finalize_configures_the_verified_address(buffer: SharedBuffer) {
        let instance = Arc::new(ScriptedInstance::new("i-0abc").then(&["10.0.0.5"]));
        let provisioner = Arc::new(ScriptedProvisioner::new(instance, amd64()));
        let ssh = Arc::new(ScriptedSsh::new());
        ssh.succeed("10.0.0.5");
        let configurator = Arc::new(RecordingConfigurator::new());
        let bootstrapper =
            Bootstrapper::new(provisioner, Some(ssh.clone()), EnvironSettings::new(test_timeouts()))
                .with_configurator(configurator.clone());
        let ctx = context(&buffer);

        let outcome = bootstrapper.bootstrap(&ctx, params()).await.expect("launched");
        let nonce = outcome.machine_config.machine_nonce.clone();
        outcome
            .finalizer
            .finalize(&ctx, outcome.machine_config)
            .await
            .expect("finalized");

        let calls = configurator.calls();
        assert_eq!(calls.len(), 1);
        let Some((host, mcfg)) = calls.first() else {
            panic!("configurator not called");
        };
        assert_eq!(host, "10.0.0.5");
        assert_eq!(mcfg.instance_id.as_ref().map(InstanceId::as_str), Some("i-0abc"));
        assert_eq!(mcfg.tools.as_ref().map(Tools::binary).as_deref(), Some("1.0.0-jammy-amd64"));
        assert!(ssh.scripts().iter().all(|s| s.contains(&nonce)));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn configuration_failure_is_final(buffer: SharedBuffer) {
        let instance = Arc::new(ScriptedInstance::new("i-0abc").then(&["10.0.0.5"]));
        let provisioner = Arc::new(ScriptedProvisioner::new(instance, amd64()));
        let ssh = Arc::new(ScriptedSsh::new());
        ssh.succeed("10.0.0.5");
        let configurator = Arc::new(RecordingConfigurator::new().failing(
            crate::configure::ConfigureError::Script {
                host: "10.0.0.5".to_owned(),
                detail: "E: Unable to locate package curl".to_owned(),
            },
        ));
        let bootstrapper =
            Bootstrapper::new(provisioner, Some(ssh.clone()), EnvironSettings::new(test_timeouts()))
                .with_configurator(configurator.clone());
        let ctx = context(&buffer);

        let outcome = bootstrapper.bootstrap(&ctx, params()).await.expect("launched");
        let err = outcome
            .finalizer
            .finalize(&ctx, outcome.machine_config)
            .await
            .expect_err("configuration fails");

        assert!(matches!(err, BootstrapError::Configure(_)), "unexpected {err:?}");
        assert_eq!(
            err.to_string(),
            "configuration script failed on 10.0.0.5: E: Unable to locate package curl"
        );
        assert_eq!(configurator.calls().len(), 1);
        assert_eq!(ssh.attempts("10.0.0.5"), 1);
    }
}
