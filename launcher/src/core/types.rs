//! Provider-side resource model shared by the provisioning stages.
//!
//! These are plain data: lifecycle changes happen only when a fresh copy is
//! fetched from the provider.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine image resolved from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Where ingress traffic may originate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Cidr(String),
    /// Members of the group the rule is attached to.
    SameGroup,
}

/// One ingress permission. ICMP rules use `-1..-1` as the port range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: Protocol,
    pub from_port: i32,
    pub to_port: i32,
    pub source: RuleSource,
}

impl IngressRule {
    pub fn new(protocol: Protocol, from_port: i32, to_port: i32, source: RuleSource) -> Self {
        Self {
            protocol,
            from_port,
            to_port,
            source,
        }
    }
}

impl fmt::Display for IngressRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            RuleSource::Cidr(cidr) => cidr.as_str(),
            RuleSource::SameGroup => "self",
        };
        write!(
            f,
            "{} {}..{} from {}",
            self.protocol.as_str(),
            self.from_port,
            self.to_port,
            source
        )
    }
}

/// Named ingress policy. `rules` lists what this run authorized on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub description: String,
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    #[serde(untagged)]
    Other(String),
}

impl InstanceState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "terminated" => InstanceState::Terminated,
            other => InstanceState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminated => "terminated",
            InstanceState::Other(raw) => raw,
        }
    }

    /// States from which an instance will never reach `running` on its own.
    pub fn is_dead_end(&self) -> bool {
        matches!(
            self,
            InstanceState::ShuttingDown | InstanceState::Stopped | InstanceState::Terminated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    pub zone: String,
    pub public_dns_name: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

impl Instance {
    /// Address used for SSH: public DNS name, then public IP.
    pub fn ssh_host(&self) -> Option<&str> {
        self.public_dns_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| self.public_ip.as_deref().filter(|ip| !ip.is_empty()))
    }
}

/// Result of a launch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: String,
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    Attaching,
    InUse,
    Deleting,
    Deleted,
    Error,
    #[serde(untagged)]
    Other(String),
}

impl VolumeState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "creating" => VolumeState::Creating,
            "available" => VolumeState::Available,
            "attaching" => VolumeState::Attaching,
            "in-use" => VolumeState::InUse,
            "deleting" => VolumeState::Deleting,
            "deleted" => VolumeState::Deleted,
            "error" => VolumeState::Error,
            other => VolumeState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::Attaching => "attaching",
            VolumeState::InUse => "in-use",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
            VolumeState::Error => "error",
            VolumeState::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub state: VolumeState,
    pub size_gb: u32,
    pub zone: String,
}
