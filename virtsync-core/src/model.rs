//! Domain model shared by the engine and the registry adapters

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::rules::RuleSet;

/// Default agent port advertised on every created host interface.
pub const DEFAULT_INTERFACE_PORT: u16 = 10050;

/// Kind of virtualization object handled by one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Vm,
    Hypervisor,
    Datastore,
}

impl ObjectType {
    /// Processing order of a full run.
    pub const ALL: [ObjectType; 3] = [ObjectType::Vm, ObjectType::Hypervisor, ObjectType::Datastore];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Vm => "vm",
            ObjectType::Hypervisor => "hypervisor",
            ObjectType::Datastore => "datastore",
        }
    }

    /// Bulk discovery key answered with `{"data": [...]}`.
    pub fn discovery_key(&self) -> &'static str {
        match self {
            ObjectType::Vm => "vm.discovery[*]",
            ObjectType::Hypervisor => "hv.discovery[*]",
            ObjectType::Datastore => "ds.discovery[*]",
        }
    }

    pub fn uuid_field(&self) -> &'static str {
        match self {
            ObjectType::Vm => "{#VM.UUID}",
            ObjectType::Hypervisor => "{#HV.UUID}",
            ObjectType::Datastore => "{#DS.UUID}",
        }
    }

    pub fn name_field(&self) -> &'static str {
        match self {
            ObjectType::Vm => "{#VM.NAME}",
            ObjectType::Hypervisor => "{#HV.NAME}",
            ObjectType::Datastore => "{#DS.NAME}",
        }
    }

    /// Attribute methods whose value depends on power state.
    /// Skipped when re-validating hosts that are already monitored.
    pub fn transient_methods(&self) -> &'static [&'static str] {
        match self {
            ObjectType::Vm => &["vm.powerstate"],
            ObjectType::Hypervisor => &["hv.powerstate", "hv.connectionstate"],
            ObjectType::Datastore => &["ds.accessible"],
        }
    }

    /// Live guest hostname attribute, VMs only.
    pub fn guest_name_method(&self) -> Option<&'static str> {
        match self {
            ObjectType::Vm => Some("vm.guest.name"),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a discovery answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredObject {
    /// UUID or name, depending on the identifier scheme of the type.
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Enabled,
    Disabled,
}

/// Host record as stored by the monitoring registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedHost {
    pub id: String,
    /// Technical name, equal to a `DiscoveredObject::key` when in sync.
    pub host: String,
    pub name: String,
    pub status: HostStatus,
}

/// Agent interface attached to created hosts: primary, no IP, resolved by DNS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInterface {
    pub dns: String,
    pub port: u16,
}

impl HostInterface {
    pub fn agent(dns: impl Into<String>) -> Self {
        Self {
            dns: dns.into(),
            port: DEFAULT_INTERFACE_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Macro {
    pub name: String,
    pub value: String,
}

/// Registry references and rules shared by every candidate of one type.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub proxy_id: Option<String>,
    pub template_ids: Vec<String>,
    pub group_ids: Vec<String>,
    pub macros: Vec<Macro>,
    pub rules: RuleSet,
}

impl HostOptions {
    /// Fresh candidate for `object`; owns its own group/template lists.
    pub fn candidate(&self, object: &DiscoveredObject) -> HostCandidate {
        HostCandidate {
            host: object.key.clone(),
            name: object.name.clone(),
            interface: HostInterface::agent(object.name.clone()),
            group_ids: self.group_ids.clone(),
            template_ids: self.template_ids.clone(),
            proxy_id: self.proxy_id.clone(),
            macros: self.macros.clone(),
        }
    }
}

/// Host about to be submitted to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostCandidate {
    pub host: String,
    pub name: String,
    pub interface: HostInterface,
    pub group_ids: Vec<String>,
    pub template_ids: Vec<String>,
    pub proxy_id: Option<String>,
    pub macros: Vec<Macro>,
}

impl HostCandidate {
    pub fn with_group(mut self, group_id: &str) -> Self {
        if !self.group_ids.iter().any(|g| g == group_id) {
            self.group_ids.push(group_id.to_string());
        }
        self
    }

    pub fn with_template(mut self, template_id: &str) -> Self {
        if !self.template_ids.iter().any(|t| t == template_id) {
            self.template_ids.push(template_id.to_string());
        }
        self
    }

    pub fn with_dns(mut self, dns: impl Into<String>) -> Self {
        self.interface.dns = dns.into();
        self
    }
}
