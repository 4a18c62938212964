//! Provisioner for hosts that are already running.
//!
//! The manual provisioner does not create machines. It adopts an existing
//! host reachable over SSH: it detects the host's hardware and writes the
//! machine nonce into the data directory, which is the part of launch that
//! cloud-init performs on real providers. After that the host behaves like
//! any other instance, including the nonce-verified address race.

use std::{collections::HashSet, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use tokio::{net::lookup_host, sync::Mutex};
use tracing::{debug, info};

use super::{
    Addresser,
    Instance,
    InstanceId,
    InstanceProvisioner,
    ProviderError,
    StartInstanceParams,
    StartedInstance,
};
use crate::{
    machine::{HardwareCharacteristics, MachineConfig},
    network::{Address, AddressScope, SSH_PORT},
    shell::sh_quote,
    ssh::{SshClient, bootstrap_target},
    tools::{Tools, ToolsFilter},
};

const ARCH_MARKER: &str = "clusterboot-arch=";
const CORES_MARKER: &str = "clusterboot-cores=";
const MEM_MARKER: &str = "clusterboot-mem-kb=";

/// Adopts an existing host as the bootstrap instance.
pub struct ManualProvisioner {
    host: String,
    client: Arc<dyn SshClient>,
}

impl ManualProvisioner {
    /// Adopt `host`, reaching it through `client`.
    #[must_use]
    pub fn new(host: impl Into<String>, client: Arc<dyn SshClient>) -> Self {
        Self {
            host: host.into(),
            client,
        }
    }

    fn check_placement(&self, placement: Option<&str>) -> Result<(), ProviderError> {
        match placement {
            None | Some("") => Ok(()),
            Some(p) if p == self.host => Ok(()),
            Some(p) => Err(ProviderError::InvalidPlacement(p.to_owned())),
        }
    }

    fn prepare_script(mcfg: &MachineConfig) -> String {
        let data_dir = sh_quote(mcfg.data_dir.as_str());
        let nonce_file = sh_quote(mcfg.nonce_file().as_str());
        let nonce = sh_quote(&mcfg.machine_nonce);
        format!(
            "set -e
echo \"{ARCH_MARKER}$(uname -m)\"
echo \"{CORES_MARKER}$(nproc)\"
echo \"{MEM_MARKER}$(awk '/^MemTotal:/ {{print $2}}' /proc/meminfo)\"
sudo -n install -d -m 0755 {data_dir}
printf '%s\\n' {nonce} | sudo -n tee {nonce_file} > /dev/null
sudo -n chmod 0644 {nonce_file}
"
        )
    }
}

/// Map `uname -m` output onto the architecture names tools use.
fn normalise_arch(machine: &str) -> String {
    match machine {
        "x86_64" | "amd64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        "ppc64le" | "ppc64el" => "ppc64el",
        "armv7l" | "armhf" => "armhf",
        other => other,
    }
    .to_owned()
}

fn parse_hardware(output: &str) -> HardwareCharacteristics {
    let mut hw = HardwareCharacteristics::default();
    for line in output.lines().map(str::trim) {
        if let Some(arch) = line.strip_prefix(ARCH_MARKER) {
            hw.arch = Some(normalise_arch(arch));
        } else if let Some(cores) = line.strip_prefix(CORES_MARKER) {
            hw.cpu_cores = cores.parse().ok();
        } else if let Some(mem_kb) = line.strip_prefix(MEM_MARKER) {
            hw.mem_mb = mem_kb.parse::<u64>().ok().map(|kb| kb.div_euclid(1024));
        }
    }
    hw
}

fn select_tools(params: &StartInstanceParams, arch: &str) -> Result<Tools, ProviderError> {
    let filter = ToolsFilter {
        series: None,
        arch: Some(arch.to_owned()),
    };
    params
        .tools
        .matching(&filter)
        .ok()
        .and_then(|matched| matched.iter().next().cloned())
        .ok_or(ProviderError::NoTools)
}

#[async_trait]
impl InstanceProvisioner for ManualProvisioner {
    async fn start_instance(
        &self,
        params: StartInstanceParams,
    ) -> Result<StartedInstance, ProviderError> {
        self.check_placement(params.placement.as_deref())?;
        if params.tools.is_empty() {
            return Err(ProviderError::NoTools);
        }
        let script = Self::prepare_script(&params.machine_config);
        let output = self
            .client
            .command(&bootstrap_target(&self.host))
            .run(&script)
            .await
            .map_err(|err| ProviderError::Backend(err.to_string()))?;
        if !output.success() {
            return Err(ProviderError::Backend(format!(
                "preparing {}: {}",
                self.host,
                output.trimmed()
            )));
        }
        let hardware = parse_hardware(&output.combined);
        let arch = hardware
            .arch
            .clone()
            .ok_or_else(|| ProviderError::Backend(format!("cannot detect arch of {}", self.host)))?;
        let tools = select_tools(&params, &arch)?;
        info!(host = %self.host, %hardware, tools = %tools, "adopted manual host");
        Ok(StartedInstance {
            instance: Arc::new(ManualInstance::new(self.host.clone())),
            hardware,
            tools,
        })
    }
}

/// A host adopted by [`ManualProvisioner`].
#[derive(Debug)]
pub struct ManualInstance {
    id: InstanceId,
    host: String,
    addresses: Mutex<Vec<Address>>,
}

impl ManualInstance {
    /// Wrap `host`. Its addresses are empty until the first refresh.
    #[must_use]
    pub fn new(host: String) -> Self {
        Self {
            id: InstanceId::new(format!("manual:{host}")),
            host,
            addresses: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Addresser for ManualInstance {
    async fn refresh(&self) -> Result<(), ProviderError> {
        let resolved = if let Ok(ip) = self.host.parse::<IpAddr>() {
            vec![Address::from_ip(ip)]
        } else {
            let mut found = vec![Address::new(self.host.clone(), AddressScope::Public)];
            let mut seen = HashSet::new();
            let resolved = lookup_host((self.host.as_str(), SSH_PORT))
                .await
                .map_err(|err| ProviderError::Backend(format!("resolving {}: {err}", self.host)))?;
            for sock in resolved {
                if seen.insert(sock.ip()) {
                    found.push(Address::from_ip(sock.ip()));
                }
            }
            found
        };
        debug!(host = %self.host, count = resolved.len(), "refreshed manual host addresses");
        *self.addresses.lock().await = resolved;
        Ok(())
    }

    async fn addresses(&self) -> Result<Vec<Address>, ProviderError> {
        Ok(self.addresses.lock().await.clone())
    }
}

impl Instance for ManualInstance {
    fn id(&self) -> &InstanceId { &self.id }
}
