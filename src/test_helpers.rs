//! In-memory fakes for the bootstrap capabilities.
//!
//! Available to unit tests and, with the `test-support` feature, to the
//! integration tests under `tests/`.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Write},
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    configure::{ConfigureError, Configurator},
    context::{BootstrapContext, Progress},
    machine::{HardwareCharacteristics, MachineConfig},
    network::{Address, AddressScope},
    provider::{
        Addresser,
        Instance,
        InstanceId,
        InstanceProvisioner,
        ProviderError,
        StartInstanceParams,
        StartedInstance,
    },
    ssh::{CommandOutput, RemoteSession, SessionError, SshClient},
    tools::ToolsFilter,
    wait::SshTimeouts,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Parse `value` into an [`Address`], classifying IP literals by scope.
#[must_use]
pub fn address(value: &str) -> Address {
    value
        .parse::<IpAddr>()
        .map_or_else(|_| Address::new(value, AddressScope::Public), Address::from_ip)
}

/// Address timeouts short enough for paused-time tests: a 60s deadline,
/// 1s between attempts and 2s between polls.
#[must_use]
pub const fn test_timeouts() -> SshTimeouts {
    SshTimeouts {
        timeout: Duration::from_secs(60),
        retry_delay: Duration::from_secs(1),
        addresses_delay: Duration::from_secs(2),
    }
}

#[derive(Debug, Clone)]
enum Step {
    Output(CommandOutput),
    Hang,
    Transport(String),
}

#[derive(Debug, Default)]
struct SshState {
    steps: HashMap<String, VecDeque<Step>>,
    attempts: HashMap<String, usize>,
    targets: Vec<String>,
    scripts: Vec<String>,
}

/// [`SshClient`] that answers from a per-host script of outcomes.
///
/// Outcomes queued for a host are consumed in order, one per session; the
/// last one repeats forever. Hosts with nothing queued refuse connections.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSsh {
    state: Arc<Mutex<SshState>>,
}

impl ScriptedSsh {
    /// A client with no scripted hosts.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn push(&self, host: &str, step: Step) {
        lock(&self.state)
            .steps
            .entry(host.to_owned())
            .or_default()
            .push_back(step);
    }

    /// Queue a zero exit for `host`.
    pub fn succeed(&self, host: &str) { self.respond(host, 0, ""); }

    /// Queue a failing exit for `host` with `output`.
    pub fn fail(&self, host: &str, code: i32, output: &str) { self.respond(host, code, output); }

    /// Queue an exit with `code` and `output` for `host`.
    pub fn respond(&self, host: &str, code: i32, output: &str) {
        self.push(
            host,
            Step::Output(CommandOutput {
                status: Some(code),
                combined: output.to_owned(),
            }),
        );
    }

    /// Queue a session for `host` that never completes.
    pub fn hang(&self, host: &str) { self.push(host, Step::Hang); }

    /// Queue a transport failure for `host`.
    pub fn transport_error(&self, host: &str, message: &str) {
        self.push(host, Step::Transport(message.to_owned()));
    }

    /// Every `user@host` a session was opened against, in order.
    #[must_use]
    pub fn targets(&self) -> Vec<String> { lock(&self.state).targets.clone() }

    /// Every script run, in order.
    #[must_use]
    pub fn scripts(&self) -> Vec<String> { lock(&self.state).scripts.clone() }

    /// Number of sessions opened against `host`.
    #[must_use]
    pub fn attempts(&self, host: &str) -> usize {
        lock(&self.state).attempts.get(host).copied().unwrap_or_default()
    }
}

impl SshClient for ScriptedSsh {
    fn command(&self, user_host: &str) -> Box<dyn RemoteSession> {
        let host = user_host
            .split_once('@')
            .map_or(user_host, |(_, host)| host)
            .to_owned();
        let mut state = lock(&self.state);
        state.targets.push(user_host.to_owned());
        *state.attempts.entry(host.clone()).or_default() += 1;
        let queued = match state.steps.get_mut(&host) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        let step = queued.unwrap_or_else(|| {
            Step::Output(CommandOutput {
                status: Some(255),
                combined: format!("ssh: connect to host {host} port 22: Connection refused\n"),
            })
        });
        Box::new(ScriptedSession {
            step,
            state: Arc::clone(&self.state),
        })
    }
}

struct ScriptedSession {
    step: Step,
    state: Arc<Mutex<SshState>>,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn run(self: Box<Self>, script: &str) -> Result<CommandOutput, SessionError> {
        lock(&self.state).scripts.push(script.to_owned());
        match self.step {
            Step::Output(output) => Ok(output),
            Step::Hang => std::future::pending().await,
            Step::Transport(message) => Err(io::Error::other(message).into()),
        }
    }
}

#[derive(Debug, Default)]
struct InstanceState {
    pending: VecDeque<Vec<Address>>,
    current: Vec<Address>,
    refresh_error: Option<ProviderError>,
    addresses_error: Option<ProviderError>,
    refresh_delay: Option<Duration>,
    refreshes: usize,
}

/// [`Instance`] whose addresses change on each refresh.
#[derive(Debug)]
pub struct ScriptedInstance {
    id: InstanceId,
    state: Mutex<InstanceState>,
}

impl ScriptedInstance {
    /// An instance with no addresses.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: InstanceId::new(id),
            state: Mutex::new(InstanceState::default()),
        }
    }

    /// Queue the addresses reported after the next unconsumed refresh.
    ///
    /// The last queued list keeps being reported.
    #[must_use]
    pub fn then(self, addrs: &[&str]) -> Self {
        lock(&self.state)
            .pending
            .push_back(addrs.iter().map(|value| address(value)).collect());
        self
    }

    /// Make every refresh take `delay` before it completes.
    #[must_use]
    pub fn slow_refresh(self, delay: Duration) -> Self {
        lock(&self.state).refresh_delay = Some(delay);
        self
    }

    /// Make every refresh fail with `err`.
    pub fn fail_refresh(&self, err: ProviderError) { lock(&self.state).refresh_error = Some(err); }

    /// Make every address listing fail with `err`.
    pub fn fail_addresses(&self, err: ProviderError) {
        lock(&self.state).addresses_error = Some(err);
    }

    /// Number of refreshes so far.
    #[must_use]
    pub fn refreshes(&self) -> usize { lock(&self.state).refreshes }
}

#[async_trait]
impl Addresser for ScriptedInstance {
    async fn refresh(&self) -> Result<(), ProviderError> {
        let delay = {
            let mut state = lock(&self.state);
            state.refreshes += 1;
            state.refresh_delay
        };
        if let Some(pause) = delay {
            tokio::time::sleep(pause).await;
        }
        let mut state = lock(&self.state);
        if let Some(err) = state.refresh_error.clone() {
            return Err(err);
        }
        let next = if state.pending.len() > 1 {
            state.pending.pop_front()
        } else {
            state.pending.front().cloned()
        };
        if let Some(addrs) = next {
            state.current = addrs;
        }
        Ok(())
    }

    async fn addresses(&self) -> Result<Vec<Address>, ProviderError> {
        let state = lock(&self.state);
        match state.addresses_error.clone() {
            Some(err) => Err(err),
            None => Ok(state.current.clone()),
        }
    }
}

impl Instance for ScriptedInstance {
    fn id(&self) -> &InstanceId { &self.id }
}

/// [`InstanceProvisioner`] that hands out a prepared instance.
pub struct ScriptedProvisioner {
    instance: Arc<ScriptedInstance>,
    hardware: HardwareCharacteristics,
    error: Option<ProviderError>,
    requests: Mutex<Vec<StartInstanceParams>>,
}

impl ScriptedProvisioner {
    /// Start `instance` with `hardware` on every request.
    #[must_use]
    pub fn new(instance: Arc<ScriptedInstance>, hardware: HardwareCharacteristics) -> Self {
        Self {
            instance,
            hardware,
            error: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fail every request with `err`.
    #[must_use]
    pub fn failing(mut self, err: ProviderError) -> Self {
        self.error = Some(err);
        self
    }

    /// Every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<StartInstanceParams> { lock(&self.requests).clone() }
}

#[async_trait]
impl InstanceProvisioner for ScriptedProvisioner {
    async fn start_instance(
        &self,
        params: StartInstanceParams,
    ) -> Result<StartedInstance, ProviderError> {
        lock(&self.requests).push(params.clone());
        if let Some(err) = self.error.clone() {
            return Err(err);
        }
        let filter = ToolsFilter {
            series: None,
            arch: self.hardware.arch.clone(),
        };
        let tools = params
            .tools
            .matching(&filter)
            .ok()
            .and_then(|matched| matched.iter().next().cloned())
            .ok_or(ProviderError::NoTools)?;
        Ok(StartedInstance {
            instance: self.instance.clone(),
            hardware: self.hardware.clone(),
            tools,
        })
    }
}

/// [`Configurator`] that records its calls instead of running anything.
#[derive(Debug, Default)]
pub struct RecordingConfigurator {
    calls: Mutex<Vec<(String, MachineConfig)>>,
    error: Option<ConfigureError>,
}

impl RecordingConfigurator {
    /// A configurator that always succeeds.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Fail every call with `err`.
    #[must_use]
    pub fn failing(mut self, err: ConfigureError) -> Self {
        self.error = Some(err);
        self
    }

    /// Every `(host, machine config)` configured, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, MachineConfig)> { lock(&self.calls).clone() }
}

#[async_trait]
impl Configurator for RecordingConfigurator {
    async fn configure(
        &self,
        _ctx: &BootstrapContext,
        _client: &dyn SshClient,
        host: &str,
        mcfg: &MachineConfig,
    ) -> Result<(), ConfigureError> {
        lock(&self.calls).push((host.to_owned(), mcfg.clone()));
        self.error.clone().map_or(Ok(()), Err)
    }
}

/// Clonable in-memory sink for [`Progress`].
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// A [`Progress`] writing into this buffer.
    #[must_use]
    pub fn progress(&self) -> Progress { Progress::new(self.clone()) }

    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> String { String::from_utf8_lossy(&lock(&self.0)).into_owned() }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}
