//! In-memory stand-ins for the driver, the channel probe and the remote shell.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::boot::KeyInput;
use crate::config::ConnectionCredentials;
use crate::driver::{
    ArtifactRequest, ConsoleHandle, ConvertedArtifact, DriverError, GuestDriver, GuestInstance,
    GuestSpec, HardwareSpec, MediaSpec, PowerState,
};
use crate::remote::{ChannelTarget, RemoteError, RemoteShell, ShellOutput};
use crate::watcher::{ChannelProbe, ProbeError, ProbeOutcome};

/// Driver operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverCall {
    /// `create`
    Create,
    /// `send_keys`
    SendKeys,
    /// `guest_address`
    Address,
    /// `power_state`
    PowerState,
    /// `power_off`
    PowerOff,
    /// `artifact_exists`
    ArtifactExists,
    /// `convert_to_artifact`
    Convert,
    /// `destroy`
    Destroy,
}

/// A guest spec for tests.
#[must_use]
pub fn guest_spec(name: &str) -> GuestSpec {
    GuestSpec {
        build_id: uuid::Uuid::nil(),
        name: name.to_string(),
        hardware: HardwareSpec::default(),
        media: MediaSpec {
            iso_url: "file:///isos/rhel-9.4-x86_64-dvd.iso".to_string(),
            iso_checksum: None,
            extra: serde_json::Map::new(),
        },
    }
}

#[derive(Debug, Default)]
struct DriverState {
    next_id: usize,
    calls: HashMap<DriverCall, usize>,
    failures: HashMap<DriverCall, VecDeque<DriverError>>,
    delays: HashMap<DriverCall, Duration>,
    sent: Vec<(String, Vec<KeyInput>)>,
    address: Option<String>,
    power: HashMap<String, PowerState>,
    ignore_power_off: bool,
    live: Vec<String>,
    created: Vec<GuestInstance>,
    destroyed: Vec<String>,
    converted: Vec<String>,
    artifacts: HashSet<String>,
    artifact_files: Option<Vec<PathBuf>>,
}

/// A guest driver that keeps everything in memory.
///
/// Guests start `Running` and the address defaults to `192.168.122.40`.
/// Failures queued with [`fail_next`](Self::fail_next) are returned by the
/// next calls of that operation, in order.
#[derive(Debug)]
pub struct MockGuestDriver {
    state: Mutex<DriverState>,
}

impl Default for MockGuestDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGuestDriver {
    /// Creates a driver with no guests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DriverState {
                address: Some("192.168.122.40".to_string()),
                ..DriverState::default()
            }),
        }
    }

    /// Registers a running guest without going through `create`.
    pub fn guest(&self, name: &str) -> GuestInstance {
        let mut state = self.state.lock();
        Self::register(&mut state, name)
    }

    fn register(state: &mut DriverState, name: &str) -> GuestInstance {
        state.next_id += 1;
        let guest = GuestInstance {
            id: format!("mock-{}", state.next_id),
            name: name.to_string(),
            address: state.address.clone(),
            console: ConsoleHandle(format!("console-{}", state.next_id)),
        };
        state.power.insert(guest.id.clone(), PowerState::Running);
        state.live.push(guest.id.clone());
        guest
    }

    /// Makes the next call of `call` fail with `error`.
    pub fn fail_next(&self, call: DriverCall, error: DriverError) {
        self.state
            .lock()
            .failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Delays every call of `call`.
    pub fn set_delay(&self, call: DriverCall, delay: Duration) {
        self.state.lock().delays.insert(call, delay);
    }

    /// Sets the address reported by `guest_address`.
    pub fn set_address(&self, address: Option<&str>) {
        self.state.lock().address = address.map(String::from);
    }

    /// Sets the power state of every live guest.
    pub fn set_power(&self, power: PowerState) {
        let mut state = self.state.lock();
        let live = state.live.clone();
        for id in live {
            state.power.insert(id, power);
        }
    }

    /// Makes `power_off` succeed without changing the power state.
    pub fn ignore_power_off(&self) {
        self.state.lock().ignore_power_off = true;
    }

    /// Marks an artifact as already present in the inventory.
    pub fn add_existing_artifact(&self, name: &str) {
        self.state.lock().artifacts.insert(name.to_string());
    }

    /// Files returned by `convert_to_artifact` instead of the default disk.
    pub fn set_artifact_files(&self, files: Vec<PathBuf>) {
        self.state.lock().artifact_files = Some(files);
    }

    /// Number of times `call` was made.
    #[must_use]
    pub fn calls_of(&self, call: DriverCall) -> usize {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Every batch of keys sent, in order.
    #[must_use]
    pub fn sent_keys(&self) -> Vec<Vec<KeyInput>> {
        self.state.lock().sent.iter().map(|(_, keys)| keys.clone()).collect()
    }

    /// Batches of keys sent to one guest.
    #[must_use]
    pub fn sent_keys_to(&self, guest_id: &str) -> Vec<Vec<KeyInput>> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(id, _)| id == guest_id)
            .map(|(_, keys)| keys.clone())
            .collect()
    }

    /// Guests made through `create`.
    #[must_use]
    pub fn created(&self) -> Vec<GuestInstance> {
        self.state.lock().created.clone()
    }

    /// Identifiers passed to successful `destroy` calls.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    /// Identifiers of guests consumed by conversion.
    #[must_use]
    pub fn converted(&self) -> Vec<String> {
        self.state.lock().converted.clone()
    }

    /// Guests neither destroyed nor converted.
    #[must_use]
    pub fn live_guests(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Whether an artifact called `name` exists.
    #[must_use]
    pub fn has_artifact(&self, name: &str) -> bool {
        self.state.lock().artifacts.contains(name)
    }

    /// Powers off every live guest, as an in-guest shutdown would.
    pub fn halt_all(&self) {
        self.set_power(PowerState::Off);
    }

    /// Clears call counts and queued failures.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.failures.clear();
        state.sent.clear();
    }

    async fn enter(&self, call: DriverCall) -> Result<(), DriverError> {
        let (delay, failure) = {
            let mut state = self.state.lock();
            *state.calls.entry(call).or_insert(0) += 1;
            let failure = state.failures.get_mut(&call).and_then(VecDeque::pop_front);
            (state.delays.get(&call).copied(), failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        failure.map_or(Ok(()), Err)
    }

    fn require_live(&self, guest: &GuestInstance) -> Result<(), DriverError> {
        if self.state.lock().live.contains(&guest.id) {
            Ok(())
        } else {
            Err(DriverError::NotFound(guest.id.clone()))
        }
    }
}

#[async_trait]
impl GuestDriver for MockGuestDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(&self, spec: &GuestSpec) -> Result<GuestInstance, DriverError> {
        self.enter(DriverCall::Create).await?;
        let mut state = self.state.lock();
        let guest = Self::register(&mut state, &spec.name);
        state.created.push(guest.clone());
        Ok(guest)
    }

    async fn send_keys(&self, guest: &GuestInstance, keys: &[KeyInput]) -> Result<(), DriverError> {
        self.enter(DriverCall::SendKeys).await?;
        self.require_live(guest)?;
        self.state.lock().sent.push((guest.id.clone(), keys.to_vec()));
        Ok(())
    }

    async fn guest_address(&self, guest: &GuestInstance) -> Result<Option<String>, DriverError> {
        self.enter(DriverCall::Address).await?;
        self.require_live(guest)?;
        Ok(self.state.lock().address.clone())
    }

    async fn power_state(&self, guest: &GuestInstance) -> Result<PowerState, DriverError> {
        self.enter(DriverCall::PowerState).await?;
        self.state
            .lock()
            .power
            .get(&guest.id)
            .copied()
            .ok_or_else(|| DriverError::NotFound(guest.id.clone()))
    }

    async fn power_off(&self, guest: &GuestInstance) -> Result<(), DriverError> {
        self.enter(DriverCall::PowerOff).await?;
        self.require_live(guest)?;
        let mut state = self.state.lock();
        if !state.ignore_power_off {
            state.power.insert(guest.id.clone(), PowerState::Off);
        }
        Ok(())
    }

    async fn artifact_exists(&self, name: &str) -> Result<bool, DriverError> {
        self.enter(DriverCall::ArtifactExists).await?;
        Ok(self.has_artifact(name))
    }

    async fn convert_to_artifact(
        &self,
        guest: &GuestInstance,
        request: &ArtifactRequest,
    ) -> Result<ConvertedArtifact, DriverError> {
        self.enter(DriverCall::Convert).await?;
        self.require_live(guest)?;
        let configured = {
            let state = self.state.lock();
            if state.artifacts.contains(&request.name) && !request.replace {
                return Err(DriverError::Fatal(format!(
                    "artifact {} already exists",
                    request.name
                )));
            }
            state.artifact_files.clone()
        };

        let files = match (configured, request.output_directory.as_ref()) {
            (Some(files), _) => files,
            (None, Some(dir)) => {
                let dir = dir.join(&request.name);
                let disk = dir.join("disk-0.vmdk");
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| DriverError::Fatal(e.to_string()))?;
                tokio::fs::write(&disk, guest.id.as_bytes())
                    .await
                    .map_err(|e| DriverError::Fatal(e.to_string()))?;
                vec![disk]
            }
            (None, None) => Vec::new(),
        };

        let mut state = self.state.lock();
        state.live.retain(|id| id != &guest.id);
        state.converted.push(guest.id.clone());
        state.artifacts.insert(request.name.clone());
        Ok(ConvertedArtifact {
            id: request.name.clone(),
            files,
        })
    }

    async fn destroy(&self, guest: &GuestInstance) -> Result<(), DriverError> {
        self.enter(DriverCall::Destroy).await?;
        let mut state = self.state.lock();
        if !state.live.contains(&guest.id) {
            return Err(DriverError::NotFound(guest.id.clone()));
        }
        state.live.retain(|id| id != &guest.id);
        state.power.remove(&guest.id);
        state.destroyed.push(guest.id.clone());
        Ok(())
    }
}

/// One observed probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCall {
    /// Where the probe went.
    pub target: ChannelTarget,
    /// Login user.
    pub username: String,
}

#[derive(Debug)]
struct ProbeScript {
    queued: VecDeque<ProbeOutcome>,
    default: ProbeOutcome,
    seen: Vec<ProbeCall>,
}

/// A channel probe answering from a script.
///
/// Queued outcomes are returned first, then the default forever. Clones
/// share the script, so a test can keep one to inspect calls.
#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    script: Arc<Mutex<ProbeScript>>,
}

impl ScriptedProbe {
    /// A probe that answers `default` once the queue is empty.
    #[must_use]
    pub fn new(default: ProbeOutcome) -> Self {
        Self {
            script: Arc::new(Mutex::new(ProbeScript {
                queued: VecDeque::new(),
                default,
                seen: Vec::new(),
            })),
        }
    }

    /// A probe that always finds the channel usable.
    #[must_use]
    pub fn reachable() -> Self {
        Self::new(ProbeOutcome::Reachable)
    }

    /// Queues `outcome` ahead of the default.
    #[must_use]
    pub fn then(self, outcome: ProbeOutcome) -> Self {
        self.script.lock().queued.push_back(outcome);
        self
    }

    /// Number of probes made.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.script.lock().seen.len()
    }

    /// Every probe made, in order.
    #[must_use]
    pub fn seen(&self) -> Vec<ProbeCall> {
        self.script.lock().seen.clone()
    }
}

#[async_trait]
impl ChannelProbe for ScriptedProbe {
    async fn probe(
        &self,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
    ) -> Result<ProbeOutcome, ProbeError> {
        let mut script = self.script.lock();
        script.seen.push(ProbeCall {
            target: target.clone(),
            username: credentials.username.clone(),
        });
        let outcome = match script.queued.pop_front() {
            Some(outcome) => outcome,
            None => script.default.clone(),
        };
        Ok(outcome)
    }
}

/// A remote shell that records commands instead of running them.
///
/// With [`with_power_off`](Self::with_power_off) every command halts the
/// driver's guests, which is what a shutdown command does.
#[derive(Debug)]
pub struct RecordingShell {
    commands: Mutex<Vec<String>>,
    result: Mutex<Result<ShellOutput, RemoteError>>,
    halts: Option<Arc<MockGuestDriver>>,
    delay: Duration,
}

impl Default for RecordingShell {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingShell {
    /// A shell whose commands exit 0 without output.
    #[must_use]
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            result: Mutex::new(Ok(ShellOutput {
                exit_code: Some(0),
                output: String::new(),
            })),
            halts: None,
            delay: Duration::ZERO,
        }
    }

    /// Makes every command take `delay`, cut off at the command timeout.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Halts the guests of `driver` whenever a command runs.
    #[must_use]
    pub fn with_power_off(mut self, driver: Arc<MockGuestDriver>) -> Self {
        self.halts = Some(driver);
        self
    }

    /// Sets what every command returns.
    pub fn set_result(&self, result: Result<ShellOutput, RemoteError>) {
        *self.result.lock() = result;
    }

    /// Commands run so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl RemoteShell for RecordingShell {
    async fn execute(
        &self,
        _target: &ChannelTarget,
        _credentials: &ConnectionCredentials,
        command: &str,
        timeout: Duration,
    ) -> Result<ShellOutput, RemoteError> {
        self.commands.lock().push(command.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay.min(timeout)).await;
        }
        if let Some(ref driver) = self.halts {
            driver.halt_all();
        }
        self.result.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failures_are_consumed_in_order() {
        let driver = MockGuestDriver::new();
        driver.fail_next(DriverCall::Create, DriverError::Transient("busy".into()));
        driver.fail_next(DriverCall::Create, DriverError::Fatal("quota".into()));

        assert!(driver.create(&guest_spec("a")).await.unwrap_err().is_transient());
        assert_eq!(
            driver.create(&guest_spec("a")).await.unwrap_err(),
            DriverError::Fatal("quota".into())
        );
        let guest = driver.create(&guest_spec("a")).await.unwrap();
        assert_eq!(guest.id, "mock-1");
        assert_eq!(driver.calls_of(DriverCall::Create), 3);
    }

    #[tokio::test]
    async fn test_convert_consumes_guest() {
        let driver = MockGuestDriver::new();
        let guest = driver.guest("rhel9");
        let request = ArtifactRequest {
            build_id: uuid::Uuid::nil(),
            name: "golden".into(),
            replace: false,
            output_directory: None,
        };

        driver.convert_to_artifact(&guest, &request).await.unwrap();
        assert_eq!(driver.live_guests(), 0);
        assert!(driver.has_artifact("golden"));
        assert!(driver.convert_to_artifact(&driver.guest("rhel9"), &request).await.is_err());
        assert!(matches!(
            driver.destroy(&guest).await,
            Err(DriverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_probe_clones_share_script() {
        let probe = ScriptedProbe::reachable().then(ProbeOutcome::Unreachable("refused".into()));
        let handle = probe.clone();
        let creds = ConnectionCredentials::password("root", "pw");
        let target = ChannelTarget::new("10.0.0.7", 22);

        assert!(!probe.probe(&target, &creds).await.unwrap().port_open());
        assert_eq!(probe.probe(&target, &creds).await.unwrap(), ProbeOutcome::Reachable);
        assert_eq!(handle.calls(), 2);
        assert_eq!(handle.seen()[0].username, "root");
    }
}
