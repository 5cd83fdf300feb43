//! Scripted provider and shell doubles for provisioning tests.
//!
//! Both record every call so tests can assert on ordering and call counts, and
//! both replay scripted lifecycle states instead of talking to a real cloud.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::types::{
    Image, IngressRule, Instance, InstanceState, Reservation, SecurityGroup, Volume, VolumeState,
};
use crate::io::config::{LauncherConfig, LoadedConfig, load_config};
use crate::io::provider::{Provider, RunInstancesRequest};
use crate::io::remote::{RemoteOutput, RemoteShell};

pub const TEST_AMI: &str = "ami-test";
pub const TEST_ZONE: &str = "us-east-1d";
pub const TEST_HOST: &str = "ec2-203-0-113-7.compute-1.amazonaws.com";

/// Launcher tuning with zero sleep intervals and the documented attempt budgets.
pub fn fast_launcher_config() -> LauncherConfig {
    LauncherConfig {
        instance_poll_interval_secs: 0,
        volume_create_interval_secs: 0,
        volume_attach_interval_secs: 0,
        format_interval_secs: 0,
        readiness_interval_secs: 0,
        ..LauncherConfig::default()
    }
}

/// Instance as the provider reports it once addresses are populated.
pub fn instance(id: &str, state: InstanceState) -> Instance {
    Instance {
        id: id.to_string(),
        state,
        zone: TEST_ZONE.to_string(),
        public_dns_name: Some(TEST_HOST.to_string()),
        public_ip: Some("203.0.113.7".to_string()),
        private_ip: Some("10.0.0.7".to_string()),
    }
}

pub fn volume(id: &str, state: VolumeState, zone: &str) -> Volume {
    Volume {
        id: id.to_string(),
        state,
        size_gb: 1,
        zone: zone.to_string(),
    }
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    GetImage(String),
    FindSecurityGroup(String),
    CreateSecurityGroup(String),
    AuthorizeIngress { group: String, rule: IngressRule },
    RunInstances(RunInstancesRequest),
    GetInstances(Vec<String>),
    CreateVolume { size_gb: u32, zone: String },
    GetVolumes(Vec<String>),
    AttachVolume {
        volume_id: String,
        instance_id: String,
        device: String,
        /// Volume state the provider held when attach was requested.
        state_at_attach: VolumeState,
    },
}

#[derive(Debug, Default)]
struct ProviderState {
    calls: Vec<ProviderCall>,
    existing_groups: Vec<SecurityGroup>,
    fail_group_create: bool,
    fail_launch: bool,
    fail_image: bool,
    /// Poll results for the launched instance; `Err` is a transient poll failure.
    instance_polls: VecDeque<Result<InstanceState, String>>,
    launched: Option<Instance>,
    fail_refetch: bool,
    volumes: HashMap<String, Volume>,
    volume_scripts: HashMap<String, VecDeque<VolumeState>>,
    create_script: Vec<VolumeState>,
    attach_script: Vec<VolumeState>,
    next_id: u32,
}

/// Provider double that replays scripted lifecycle states.
///
/// Instance polls return the scripted states without network addresses; once the
/// script is exhausted, fetches return the fully populated instance, mirroring a
/// control plane whose launch and poll responses lag behind a full describe.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    state: RefCell<ProviderState>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing_group(self, name: &str) -> Self {
        self.state.borrow_mut().existing_groups.push(SecurityGroup {
            id: format!("sg-{name}"),
            name: name.to_string(),
            description: name.to_string(),
            rules: Vec::new(),
        });
        self
    }

    pub fn failing_group_create(self) -> Self {
        self.state.borrow_mut().fail_group_create = true;
        self
    }

    pub fn failing_launch(self) -> Self {
        self.state.borrow_mut().fail_launch = true;
        self
    }

    pub fn failing_image(self) -> Self {
        self.state.borrow_mut().fail_image = true;
        self
    }

    pub fn failing_refetch(self) -> Self {
        self.state.borrow_mut().fail_refetch = true;
        self
    }

    /// Script the results of successive instance polls.
    pub fn with_instance_polls(self, polls: Vec<Result<InstanceState, String>>) -> Self {
        self.state.borrow_mut().instance_polls = polls.into();
        self
    }

    pub fn with_volume(self, volume: Volume) -> Self {
        self.state
            .borrow_mut()
            .volumes
            .insert(volume.id.clone(), volume);
        self
    }

    /// States reported by polls of a freshly created volume. The last one sticks.
    pub fn with_create_states(self, states: Vec<VolumeState>) -> Self {
        self.state.borrow_mut().create_script = states;
        self
    }

    /// States reported by polls after an attach call. The last one sticks.
    pub fn with_attach_states(self, states: Vec<VolumeState>) -> Self {
        self.state.borrow_mut().attach_script = states;
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state.borrow().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&ProviderCall) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ProviderCall) {
        self.state.borrow_mut().calls.push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        format!("{prefix}-{:04}", state.next_id)
    }
}

impl Provider for ScriptedProvider {
    fn get_image(&self, image_id: &str) -> Result<Image> {
        self.record(ProviderCall::GetImage(image_id.to_string()));
        if self.state.borrow().fail_image {
            return Err(anyhow!("image {image_id} not found"));
        }
        Ok(Image {
            id: image_id.to_string(),
            name: Some("scripted".to_string()),
            state: Some("available".to_string()),
        })
    }

    fn find_security_group(&self, name: &str) -> Result<Option<SecurityGroup>> {
        self.record(ProviderCall::FindSecurityGroup(name.to_string()));
        Ok(self
            .state
            .borrow()
            .existing_groups
            .iter()
            .find(|g| g.name == name)
            .cloned())
    }

    fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup> {
        self.record(ProviderCall::CreateSecurityGroup(name.to_string()));
        if self.state.borrow().fail_group_create {
            return Err(anyhow!("InvalidGroup.Duplicate: {name}"));
        }
        let group = SecurityGroup {
            id: format!("sg-{name}"),
            name: name.to_string(),
            description: description.to_string(),
            rules: Vec::new(),
        };
        self.state.borrow_mut().existing_groups.push(group.clone());
        Ok(group)
    }

    fn authorize_ingress(&self, group: &SecurityGroup, rule: &IngressRule) -> Result<()> {
        self.record(ProviderCall::AuthorizeIngress {
            group: group.name.clone(),
            rule: rule.clone(),
        });
        Ok(())
    }

    fn run_instances(&self, request: &RunInstancesRequest) -> Result<Reservation> {
        self.record(ProviderCall::RunInstances(request.clone()));
        if self.state.borrow().fail_launch {
            return Err(anyhow!("InstanceLimitExceeded"));
        }
        let id = self.next_id("i");
        let zone = request
            .placement
            .clone()
            .unwrap_or_else(|| TEST_ZONE.to_string());
        let launched = Instance {
            zone,
            ..instance(&id, InstanceState::Running)
        };
        self.state.borrow_mut().launched = Some(launched.clone());
        Ok(Reservation {
            id: self.next_id("r"),
            instances: vec![Instance {
                state: InstanceState::Pending,
                public_dns_name: None,
                public_ip: None,
                private_ip: None,
                ..launched
            }],
        })
    }

    fn get_instances(&self, ids: &[String]) -> Result<Vec<Instance>> {
        self.record(ProviderCall::GetInstances(ids.to_vec()));
        let mut state = self.state.borrow_mut();
        let launched = state
            .launched
            .clone()
            .ok_or_else(|| anyhow!("no instance launched"))?;
        if !ids.contains(&launched.id) {
            return Ok(Vec::new());
        }
        match state.instance_polls.pop_front() {
            Some(Ok(polled)) => Ok(vec![Instance {
                state: polled,
                public_dns_name: None,
                public_ip: None,
                private_ip: None,
                ..launched
            }]),
            Some(Err(message)) => Err(anyhow!(message)),
            None if state.fail_refetch => Err(anyhow!("RequestLimitExceeded")),
            None => Ok(vec![launched]),
        }
    }

    fn create_volume(&self, size_gb: u32, zone: &str) -> Result<Volume> {
        self.record(ProviderCall::CreateVolume {
            size_gb,
            zone: zone.to_string(),
        });
        let id = self.next_id("vol");
        let created = Volume {
            size_gb,
            ..volume(&id, VolumeState::Creating, zone)
        };
        let mut state = self.state.borrow_mut();
        let script = state.create_script.clone();
        state.volumes.insert(id.clone(), created.clone());
        state.volume_scripts.insert(id, script.into());
        Ok(created)
    }

    fn get_volumes(&self, ids: &[String]) -> Result<Vec<Volume>> {
        self.record(ProviderCall::GetVolumes(ids.to_vec()));
        let mut state = self.state.borrow_mut();
        let mut found = Vec::new();
        for id in ids {
            let next = state.volume_scripts.get_mut(id).and_then(|script| {
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().cloned()
                }
            });
            if let Some(volume) = state.volumes.get_mut(id) {
                if let Some(next) = next {
                    volume.state = next;
                }
                found.push(volume.clone());
            }
        }
        Ok(found)
    }

    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeState> {
        let state_at_attach = self
            .state
            .borrow()
            .volumes
            .get(volume_id)
            .map(|v| v.state.clone())
            .ok_or_else(|| anyhow!("volume {volume_id} not found"))?;
        self.record(ProviderCall::AttachVolume {
            volume_id: volume_id.to_string(),
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            state_at_attach,
        });
        let mut state = self.state.borrow_mut();
        let script = state.attach_script.clone();
        state
            .volume_scripts
            .insert(volume_id.to_string(), script.into());
        if let Some(volume) = state.volumes.get_mut(volume_id) {
            volume.state = VolumeState::Attaching;
        }
        Ok(VolumeState::Attaching)
    }
}

/// Shell double that replays exit codes per command pattern.
#[derive(Debug)]
pub struct ScriptedShell {
    identity: Option<PathBuf>,
    /// (substring, remaining exit codes); the last code sticks.
    scripts: RefCell<Vec<(String, VecDeque<i32>)>>,
    log: RefCell<Vec<(String, String)>>,
}

impl Default for ScriptedShell {
    fn default() -> Self {
        Self {
            identity: Some(PathBuf::from("/keys/test_rsa")),
            scripts: RefCell::new(Vec::new()),
            log: RefCell::new(Vec::new()),
        }
    }
}

impl ScriptedShell {
    /// Shell where every command succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_identity(mut self) -> Self {
        self.identity = None;
        self
    }

    /// Commands containing `pattern` exit with `codes` in order.
    pub fn with_exit_codes(self, pattern: &str, codes: Vec<i32>) -> Self {
        self.scripts
            .borrow_mut()
            .push((pattern.to_string(), codes.into()));
        self
    }

    /// Every `(host, command)` pair executed so far.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.log.borrow().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.borrow().iter().map(|(_, c)| c.clone()).collect()
    }
}

impl RemoteShell for ScriptedShell {
    fn identity(&self) -> Option<&Path> {
        self.identity.as_deref()
    }

    fn exec(&self, host: &str, command: &str) -> Result<RemoteOutput> {
        self.log
            .borrow_mut()
            .push((host.to_string(), command.to_string()));
        let mut scripts = self.scripts.borrow_mut();
        let code = scripts
            .iter_mut()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .and_then(|(_, codes)| {
                if codes.len() > 1 {
                    codes.pop_front()
                } else {
                    codes.front().copied()
                }
            })
            .unwrap_or(0);
        Ok(RemoteOutput::exited(code, format!("scripted exit {code}")))
    }
}

/// Config file plus templates written to a temporary directory.
pub struct ConfigFixture {
    dir: tempfile::TempDir,
}

impl ConfigFixture {
    pub fn new(config: &str) -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        fs::write(dir.path().join("launch.toml"), config).context("write launch.toml")?;
        Ok(Self { dir })
    }

    pub fn with_template(self, name: &str, contents: &str) -> Result<Self> {
        fs::write(self.dir.path().join(name), contents)
            .with_context(|| format!("write template {name}"))?;
        Ok(self)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("launch.toml")
    }

    /// Load the config with zero poll intervals.
    pub fn load(&self) -> Result<LoadedConfig> {
        let mut loaded = load_config(&self.config_path())?;
        let launcher = &mut loaded.launcher;
        launcher.instance_poll_interval_secs = 0;
        launcher.volume_create_interval_secs = 0;
        launcher.volume_attach_interval_secs = 0;
        launcher.format_interval_secs = 0;
        launcher.readiness_interval_secs = 0;
        Ok(loaded)
    }
}
