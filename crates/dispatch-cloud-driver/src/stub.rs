// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cloud driver.
//!
//! VMs live in a map owned by the instance set. Each [`StubVm`] emulates the
//! small shell surface the dispatcher relies on: the boot probe, a
//! `cat` of the instance secret file, and the supervisor's `--detach`,
//! `--list` and `--kill` subcommands. Behavior knobs let tests simulate slow
//! boots, broken hosts, unkillable supervisors, rate limits and quota.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CloudError;
use crate::traits::{Driver, ExecutorTarget, HostKeyChallenge, Instance, InstanceSet};
use crate::types::{ImageId, InitCommand, InstanceId, InstanceSetId, InstanceTags, InstanceType};

/// Exit code reported when the emulated shell cannot find a command.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Per-VM behavior.
#[derive(Debug, Clone)]
pub struct StubVmConfig {
    /// Time from creation until the boot probe succeeds.
    /// Default: 0
    pub boot_time: Duration,
    /// `--list` reports the host as broken.
    pub broken: bool,
    /// Every supervisor subcommand fails with exit code 127.
    pub supervisor_missing: bool,
    /// `--kill` never succeeds.
    pub unkillable: bool,
    /// The secret file holds a value that does not match the tag.
    pub reject_host_key: bool,
    /// How long a detached supervisor keeps running. `None` runs forever.
    pub run_time: Option<Duration>,
    /// Login user reported to executors.
    /// Default: "root"
    pub remote_user: String,
}

impl Default for StubVmConfig {
    fn default() -> Self {
        Self {
            boot_time: Duration::ZERO,
            broken: false,
            supervisor_missing: false,
            unkillable: false,
            reject_host_key: false,
            run_time: None,
            remote_user: "root".to_string(),
        }
    }
}

/// Instance set behavior.
#[derive(Debug, Clone, Default)]
pub struct StubDriverConfig {
    /// Calls to `create` closer together than this are rate limited.
    pub min_time_between_create_calls: Duration,
    /// Calls to `instances` closer together than this are rate limited.
    pub min_time_between_instances_calls: Duration,
    /// `create` fails with a quota error once this many instances exist.
    pub quota_max_instances: Option<usize>,
    /// Probability in `[0, 1]` that `destroy` fails.
    pub error_rate_destroy: f64,
    /// Behavior of every VM the set creates.
    pub vm: StubVmConfig,
}

/// Overrides accepted through opaque driver parameters.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StubDriverParams {
    min_time_between_create_calls_ms: Option<u64>,
    min_time_between_instances_calls_ms: Option<u64>,
    quota_max_instances: Option<usize>,
    error_rate_destroy: Option<f64>,
    boot_time_ms: Option<u64>,
    run_time_ms: Option<u64>,
}

impl StubDriverConfig {
    fn with_params(mut self, params: &serde_json::Value) -> Result<Self, CloudError> {
        if params.is_null() {
            return Ok(self);
        }
        let params: StubDriverParams = serde_json::from_value(params.clone())
            .map_err(|e| CloudError::Config(format!("stub driver parameters: {}", e)))?;
        if let Some(ms) = params.min_time_between_create_calls_ms {
            self.min_time_between_create_calls = Duration::from_millis(ms);
        }
        if let Some(ms) = params.min_time_between_instances_calls_ms {
            self.min_time_between_instances_calls = Duration::from_millis(ms);
        }
        if params.quota_max_instances.is_some() {
            self.quota_max_instances = params.quota_max_instances;
        }
        if let Some(rate) = params.error_rate_destroy {
            self.error_rate_destroy = rate;
        }
        if let Some(ms) = params.boot_time_ms {
            self.vm.boot_time = Duration::from_millis(ms);
        }
        if let Some(ms) = params.run_time_ms {
            self.vm.run_time = Some(Duration::from_millis(ms));
        }
        Ok(self)
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Driver that keeps every instance set in memory.
#[derive(Clone, Default)]
pub struct StubDriver {
    config: StubDriverConfig,
    sets: Arc<Mutex<Vec<StubInstanceSet>>>,
}

impl StubDriver {
    /// Create a driver whose instance sets use `config`.
    pub fn new(config: StubDriverConfig) -> Self {
        Self {
            config,
            sets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every instance set handed out so far.
    pub async fn instance_sets(&self) -> Vec<StubInstanceSet> {
        self.sets.lock().await.clone()
    }
}

#[async_trait]
impl Driver for StubDriver {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn instance_set(
        &self,
        config: &serde_json::Value,
        set_id: &InstanceSetId,
        shared_tags: &InstanceTags,
    ) -> Result<Arc<dyn InstanceSet>, CloudError> {
        let config = self.config.clone().with_params(config)?;
        let mut sets = self.sets.lock().await;
        // Asking again for a known set ID reopens it with its instances, as
        // a restarted dispatcher finds them in a real cloud account.
        if let Some(set) = sets.iter().find(|s| s.set_id() == set_id) {
            set.shared.state.lock().await.stopped = false;
            return Ok(Arc::new(set.clone()));
        }
        let set = StubInstanceSet::new(config, set_id.clone(), shared_tags.clone());
        sets.push(set.clone());
        Ok(Arc::new(set))
    }
}

// ============================================================================
// Instance set
// ============================================================================

struct StubServer {
    vm: Arc<StubVm>,
    tags: InstanceTags,
}

#[derive(Default)]
struct SetState {
    servers: BTreeMap<InstanceId, StubServer>,
    stopped: bool,
    next_id: u64,
    allow_create_at: Option<Instant>,
    allow_instances_at: Option<Instant>,
    create_calls: usize,
    instances_calls: usize,
    fail_next_create: Option<CloudError>,
}

struct SetShared {
    config: StubDriverConfig,
    set_id: InstanceSetId,
    shared_tags: InstanceTags,
    state: Mutex<SetState>,
}

/// In-memory instance set.
#[derive(Clone)]
pub struct StubInstanceSet {
    shared: Arc<SetShared>,
}

impl StubInstanceSet {
    /// Create an empty instance set.
    pub fn new(config: StubDriverConfig, set_id: InstanceSetId, shared_tags: InstanceTags) -> Self {
        Self {
            shared: Arc::new(SetShared {
                config,
                set_id,
                shared_tags,
                state: Mutex::new(SetState::default()),
            }),
        }
    }

    /// The set ID this instance set was created for.
    pub fn set_id(&self) -> &InstanceSetId {
        &self.shared.set_id
    }

    /// Look up a live VM.
    pub async fn vm(&self, id: &InstanceId) -> Option<Arc<StubVm>> {
        let state = self.shared.state.lock().await;
        state.servers.get(id).map(|s| s.vm.clone())
    }

    /// All live VMs, ordered by instance ID.
    pub async fn vms(&self) -> Vec<Arc<StubVm>> {
        let state = self.shared.state.lock().await;
        state.servers.values().map(|s| s.vm.clone()).collect()
    }

    /// Current tags of a live VM.
    pub async fn tags_of(&self, id: &InstanceId) -> Option<InstanceTags> {
        let state = self.shared.state.lock().await;
        state.servers.get(id).map(|s| s.tags.clone())
    }

    /// Number of `create` calls that reached the provider.
    pub async fn create_calls(&self) -> usize {
        self.shared.state.lock().await.create_calls
    }

    /// Number of `instances` calls that reached the provider.
    pub async fn instances_calls(&self) -> usize {
        self.shared.state.lock().await.instances_calls
    }

    /// Whether `stop` has been called.
    pub async fn is_stopped(&self) -> bool {
        self.shared.state.lock().await.stopped
    }

    /// Make the next `create` call fail with `err`.
    pub async fn fail_next_create(&self, err: CloudError) {
        self.shared.state.lock().await.fail_next_create = Some(err);
    }

    /// Add a VM as if a previous process had created it.
    ///
    /// The VM is already booted. No init command runs, so any files it
    /// needs must be written with [`StubVm::write_file`].
    pub async fn inject_instance(
        &self,
        provider_type: &str,
        tags: InstanceTags,
        vm_config: StubVmConfig,
    ) -> Arc<StubVm> {
        let mut state = self.shared.state.lock().await;
        state.next_id += 1;
        let id = InstanceId(format!("stub-{}-{}", state.next_id, provider_type));
        let vm = Arc::new(StubVm::new(
            id.clone(),
            provider_type.to_string(),
            vm_config,
            Instant::now(),
        ));
        state.servers.insert(
            id,
            StubServer {
                vm: vm.clone(),
                tags,
            },
        );
        vm
    }

    fn handle(&self, server: &StubServer) -> Arc<dyn Instance> {
        Arc::new(StubInstance {
            vm: server.vm.clone(),
            tags: server.tags.clone(),
            set: self.shared.clone(),
        })
    }
}

#[async_trait]
impl InstanceSet for StubInstanceSet {
    async fn create(
        &self,
        instance_type: &InstanceType,
        _image_id: &ImageId,
        tags: InstanceTags,
        init_command: InitCommand,
        _public_key: Option<&str>,
    ) -> Result<Arc<dyn Instance>, CloudError> {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock().await;
        if state.stopped {
            return Err(CloudError::Stopped);
        }
        let now = Instant::now();
        if let Some(wait) = state
            .allow_create_at
            .and_then(|allow_at| allow_at.checked_duration_since(now))
            .filter(|wait| !wait.is_zero())
        {
            return Err(CloudError::RateLimited {
                message: "stub: create called too soon".to_string(),
                earliest_retry: Utc::now()
                    + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero()),
            });
        }
        state.allow_create_at = Some(now + config.min_time_between_create_calls);
        state.create_calls += 1;

        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }
        if let Some(max) = config
            .quota_max_instances
            .filter(|max| state.servers.len() >= *max)
        {
            return Err(CloudError::Quota(format!(
                "InstanceLimitExceeded: {} instances allowed",
                max
            )));
        }

        state.next_id += 1;
        let id = InstanceId(format!("stub-{}-{}", state.next_id, instance_type.provider_type));
        let vm = StubVm::new(
            id.clone(),
            instance_type.provider_type.clone(),
            config.vm.clone(),
            now + config.vm.boot_time,
        );
        vm.run_init_command(&init_command).await;

        let mut all_tags = self.shared.shared_tags.clone();
        all_tags.extend(tags);
        let server = StubServer {
            vm: Arc::new(vm),
            tags: all_tags,
        };
        let handle = self.handle(&server);
        debug!(instance_id = %id, instance_type = %instance_type.name, "stub instance created");
        state.servers.insert(id, server);
        Ok(handle)
    }

    async fn instances(
        &self,
        filter_tags: &InstanceTags,
    ) -> Result<Vec<Arc<dyn Instance>>, CloudError> {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock().await;
        if state.stopped {
            return Err(CloudError::Stopped);
        }
        let now = Instant::now();
        if let Some(wait) = state
            .allow_instances_at
            .and_then(|allow_at| allow_at.checked_duration_since(now))
            .filter(|wait| !wait.is_zero())
        {
            return Err(CloudError::RateLimited {
                message: "stub: instances called too soon".to_string(),
                earliest_retry: Utc::now()
                    + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero()),
            });
        }
        state.allow_instances_at = Some(now + config.min_time_between_instances_calls);
        state.instances_calls += 1;

        Ok(state
            .servers
            .values()
            .filter(|s| {
                filter_tags
                    .iter()
                    .all(|(k, v)| s.tags.get(k).is_some_and(|have| have == v))
            })
            .map(|s| self.handle(s))
            .collect())
    }

    async fn stop(&self) {
        self.shared.state.lock().await.stopped = true;
    }
}

// ============================================================================
// Instance handle
// ============================================================================

/// Handle returned by [`StubInstanceSet`]. Tags are a snapshot taken when the
/// handle was created, so writes become visible on the next listing.
pub struct StubInstance {
    vm: Arc<StubVm>,
    tags: InstanceTags,
    set: Arc<SetShared>,
}

impl StubInstance {
    /// The emulated VM behind this handle.
    pub fn vm(&self) -> &Arc<StubVm> {
        &self.vm
    }
}

impl fmt::Display for StubInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.vm.id)
    }
}

#[async_trait]
impl ExecutorTarget for StubInstance {
    fn address(&self) -> Option<String> {
        Some(self.vm.address())
    }

    fn remote_user(&self) -> String {
        self.vm.config.remote_user.clone()
    }

    async fn verify_host_key(
        &self,
        host_key: &[u8],
        _challenge: &dyn HostKeyChallenge,
    ) -> Result<(), CloudError> {
        if self.vm.config.reject_host_key || host_key != self.vm.host_key().as_slice() {
            return Err(CloudError::HostKey(format!(
                "host key for {} does not match",
                self.vm.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Instance for StubInstance {
    fn id(&self) -> InstanceId {
        self.vm.id.clone()
    }

    fn provider_type(&self) -> String {
        self.vm.provider_type.clone()
    }

    fn tags(&self) -> InstanceTags {
        self.tags.clone()
    }

    async fn set_tags(&self, tags: InstanceTags) -> Result<(), CloudError> {
        let mut state = self.set.state.lock().await;
        match state.servers.get_mut(&self.vm.id) {
            Some(server) => {
                server.tags = tags;
                Ok(())
            }
            None => Err(CloudError::NotFound(self.vm.id.to_string())),
        }
    }

    async fn destroy(&self) -> Result<(), CloudError> {
        if self.set.config.error_rate_destroy > 0.0
            && rand::random::<f64>() < self.set.config.error_rate_destroy
        {
            return Err(CloudError::Provider(format!(
                "stub: destroy {} failed",
                self.vm.id
            )));
        }
        let mut state = self.set.state.lock().await;
        state.servers.remove(&self.vm.id);
        self.vm.state.lock().await.destroyed = true;
        debug!(instance_id = %self.vm.id, "stub instance destroyed");
        Ok(())
    }
}

// ============================================================================
// Emulated VM
// ============================================================================

/// Output of a command run on a [`StubVm`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubExecOutput {
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
    /// Process exit code.
    pub exit_code: i32,
}

impl StubExecOutput {
    fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    fn fail(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: code,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct VmState {
    // uuid -> time the supervisor exits on its own
    running: BTreeMap<String, Option<Instant>>,
    stale: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    stdin_by_uuid: BTreeMap<String, Vec<u8>>,
    kill_signals: Vec<(String, i32)>,
    commands: Vec<String>,
    broken: bool,
    unkillable: bool,
    destroyed: bool,
}

/// An emulated VM.
pub struct StubVm {
    id: InstanceId,
    provider_type: String,
    config: StubVmConfig,
    booted_at: Instant,
    state: Mutex<VmState>,
}

impl StubVm {
    fn new(id: InstanceId, provider_type: String, config: StubVmConfig, booted_at: Instant) -> Self {
        let state = VmState {
            broken: config.broken,
            unkillable: config.unkillable,
            ..Default::default()
        };
        Self {
            id,
            provider_type,
            config,
            booted_at,
            state: Mutex::new(state),
        }
    }

    /// Instance ID.
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Emulated network address.
    pub fn address(&self) -> String {
        format!("{}.stub:22", self.id)
    }

    /// Host key presented to executors.
    pub fn host_key(&self) -> Vec<u8> {
        format!("ssh-stub {}", self.id).into_bytes()
    }

    async fn run_init_command(&self, init: &InitCommand) {
        static ECHO: OnceLock<Option<Regex>> = OnceLock::new();
        let Some(re) = ECHO
            .get_or_init(|| Regex::new(r#"echo -n "([^"]*)" *>(\S+)"#).ok())
            .as_ref()
        else {
            return;
        };
        let mut state = self.state.lock().await;
        for cap in re.captures_iter(&init.0) {
            let contents = if self.config.reject_host_key {
                "0000000000000000000000000000000000000000".to_string()
            } else {
                cap[1].to_string()
            };
            state.files.insert(cap[2].to_string(), contents.into_bytes());
        }
    }

    /// Write a file readable with `cat`.
    pub async fn write_file(&self, path: &str, contents: &[u8]) {
        let mut state = self.state.lock().await;
        state.files.insert(path.to_string(), contents.to_vec());
    }

    /// Run `command` as the emulated shell would.
    pub async fn exec(
        &self,
        env: &BTreeMap<String, String>,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<StubExecOutput, CloudError> {
        let mut state = self.state.lock().await;
        if state.destroyed {
            return Err(CloudError::NotFound(self.id.to_string()));
        }
        state.commands.push(command.to_string());
        let _ = env;

        let command = command.strip_prefix("sudo ").unwrap_or(command);
        let words: Vec<&str> = command.split_whitespace().collect();
        let is_supervisor = words
            .iter()
            .any(|w| matches!(*w, "--detach" | "--list" | "--kill"));

        if is_supervisor && self.config.supervisor_missing {
            return Ok(StubExecOutput::fail(
                EXIT_COMMAND_NOT_FOUND,
                format!("{}: command not found\n", words.first().copied().unwrap_or("")),
            ));
        }

        let now = Instant::now();
        if words.contains(&"--detach") {
            let Some(uuid) = words.last().map(|w| unquote(w)) else {
                return Ok(StubExecOutput::fail(2, "missing uuid\n"));
            };
            if state.running.contains_key(&uuid) {
                return Ok(StubExecOutput::fail(1, format!("{} already running\n", uuid)));
            }
            let finish_at = self.config.run_time.map(|d| now + d);
            state
                .stdin_by_uuid
                .insert(uuid.clone(), stdin.map(|s| s.to_vec()).unwrap_or_default());
            state.running.insert(uuid, finish_at);
            return Ok(StubExecOutput::default());
        }

        if words.contains(&"--list") {
            state
                .running
                .retain(|_, finish_at| finish_at.is_none_or(|at| at > now));
            let mut out = String::new();
            for uuid in state.running.keys() {
                out.push_str(uuid);
                out.push('\n');
            }
            for uuid in &state.stale {
                out.push_str(uuid);
                out.push_str(" stale\n");
            }
            if state.broken {
                out.push_str("broken\n");
            }
            return Ok(StubExecOutput::ok(out));
        }

        if let Some(pos) = words.iter().position(|w| *w == "--kill") {
            let signal = words
                .get(pos + 1)
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(15);
            let Some(uuid) = words.get(pos + 2).map(|w| unquote(w)) else {
                return Ok(StubExecOutput::fail(2, "missing uuid\n"));
            };
            state.kill_signals.push((uuid.clone(), signal));
            if state.unkillable && state.running.contains_key(&uuid) {
                return Ok(StubExecOutput::fail(1, "process did not exit\n"));
            }
            state.running.remove(&uuid);
            return Ok(StubExecOutput::default());
        }

        if words.first() == Some(&"cat") {
            let path = words.get(1).copied().unwrap_or("");
            return Ok(match state.files.get(path) {
                Some(contents) => StubExecOutput::ok(contents.clone()),
                None => StubExecOutput::fail(1, format!("cat: {}: No such file\n", path)),
            });
        }

        if now < self.booted_at {
            return Ok(StubExecOutput::fail(1, "not booted\n"));
        }
        Ok(StubExecOutput::default())
    }

    /// Make a supervisor exit as if its container finished.
    pub async fn finish(&self, uuid: &str) {
        self.state.lock().await.running.remove(uuid);
    }

    /// Start a supervisor directly, as a previous dispatcher would have.
    pub async fn inject_running(&self, uuid: &str) {
        self.state.lock().await.running.insert(uuid.to_string(), None);
    }

    /// Report `uuid` as holding a stale run lock.
    pub async fn set_stale(&self, uuid: &str) {
        self.state.lock().await.stale.insert(uuid.to_string());
    }

    /// UUIDs of running supervisors.
    pub async fn running(&self) -> Vec<String> {
        self.state.lock().await.running.keys().cloned().collect()
    }

    /// Every `(uuid, signal)` pair sent with `--kill`.
    pub async fn kill_signals(&self) -> Vec<(String, i32)> {
        self.state.lock().await.kill_signals.clone()
    }

    /// Stdin received by the supervisor started for `uuid`.
    pub async fn stdin_for(&self, uuid: &str) -> Option<Vec<u8>> {
        self.state.lock().await.stdin_by_uuid.get(uuid).cloned()
    }

    /// Every command run on this VM, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }

    /// Toggle the `broken` flag reported by `--list`.
    pub async fn set_broken(&self, broken: bool) {
        self.state.lock().await.broken = broken;
    }

    /// Toggle whether `--kill` succeeds.
    pub async fn set_unkillable(&self, unkillable: bool) {
        self.state.lock().await.unkillable = unkillable;
    }

    /// Whether the VM has been destroyed.
    pub async fn is_destroyed(&self) -> bool {
        self.state.lock().await.destroyed
    }
}

fn unquote(word: &str) -> String {
    word.trim_matches(|c| c == '\'' || c == '"').to_string()
}
