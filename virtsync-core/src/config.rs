//! Typed configuration schema
//!
//! Loaded once from YAML and validated up front: every problem is collected
//! and reported together instead of surfacing deep inside a reconciliation pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::ObjectType;
use crate::protocol::{AgentClient, DEFAULT_AGENT_PORT};
use crate::rules::Rule;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentSettings,
    pub registry: RegistrySettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    pub vm: Option<ObjectTypeConfig>,
    pub hypervisor: Option<ObjectTypeConfig>,
    pub datastore: Option<ObjectTypeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub host: String,
    #[serde(default = "default_agent_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    pub url: String,
    /// API token; `VIRTSYNC_REGISTRY_TOKEN` is used when absent.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Width of the per-object worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    #[serde(default)]
    pub to: Vec<String>,
    pub from: Option<String>,
    #[serde(default = "default_mail_command")]
    pub command: String,
    #[serde(default = "default_subject")]
    pub subject: String,
}

/// Per object-type section. An absent section skips the type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectTypeConfig {
    pub proxy: Option<String>,
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub macros: BTreeMap<String, String>,
    /// Key objects by stable UUID (default) or by display name.
    #[serde(default = "default_use_uuid")]
    pub use_uuid: bool,
    #[serde(default)]
    pub include: Vec<RuleConfig>,
    #[serde(default)]
    pub exclude: Vec<RuleConfig>,
    #[serde(default)]
    pub optional_groups: Vec<OptionalRuleConfig>,
    #[serde(default)]
    pub optional_templates: Vec<OptionalRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub method: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionalRuleConfig {
    pub method: String,
    pub pattern: String,
    /// Group or template name attached on match.
    pub target: String,
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    30
}

fn default_registry_timeout() -> u64 {
    30
}

fn default_workers() -> usize {
    4
}

fn default_mail_command() -> String {
    "/usr/sbin/sendmail -t".to_string()
}

fn default_subject() -> String {
    "[virtsync] inventory changes".to_string()
}

fn default_use_uuid() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            to: Vec::new(),
            from: None,
            command: default_mail_command(),
            subject: default_subject(),
        }
    }
}

impl AgentSettings {
    pub fn client(&self) -> AgentClient {
        AgentClient::new(self.host.clone(), self.port).with_timeouts(
            Duration::from_secs(self.connect_timeout_secs),
            Duration::from_secs(self.read_timeout_secs),
        )
    }
}

impl NotifySettings {
    /// Both a destination and a sender are required to send anything.
    pub fn is_enabled(&self) -> bool {
        !self.to.is_empty() && self.from.as_deref().is_some_and(|f| !f.trim().is_empty())
    }
}

impl ObjectTypeConfig {
    /// Template names with blank entries dropped.
    pub fn effective_templates(&self) -> Vec<&str> {
        non_blank(&self.templates)
    }

    /// Group names with blank entries dropped.
    pub fn effective_groups(&self) -> Vec<&str> {
        non_blank(&self.groups)
    }

    fn problems(&self, object_type: ObjectType) -> Vec<String> {
        let mut problems = Vec::new();

        if self.effective_templates().is_empty() {
            problems.push(format!("{object_type}: at least one template is required"));
        }
        if self.effective_groups().is_empty() {
            problems.push(format!("{object_type}: at least one group is required"));
        }

        let plain = self.include.iter().chain(&self.exclude).map(|r| (&r.method, &r.pattern));
        let optional = self
            .optional_groups
            .iter()
            .chain(&self.optional_templates)
            .map(|r| (&r.method, &r.pattern));
        for (method, pattern) in plain.chain(optional) {
            if method.trim().is_empty() {
                problems.push(format!("{object_type}: rule with empty method (pattern {pattern:?})"));
            }
            if let Err(e) = Rule::new(method.as_str(), pattern) {
                problems.push(format!("{object_type}: invalid pattern {pattern:?} for {method}: {e}"));
            }
        }

        for rule in self.optional_groups.iter().chain(&self.optional_templates) {
            if rule.target.trim().is_empty() {
                problems.push(format!("{object_type}: optional rule on {} has no target", rule.method));
            }
        }

        problems
    }
}

fn non_blank(names: &[String]) -> Vec<&str> {
    names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect()
}

impl Config {
    /// Reads, parses and validates a YAML configuration file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn object_type(&self, object_type: ObjectType) -> Option<&ObjectTypeConfig> {
        match object_type {
            ObjectType::Vm => self.vm.as_ref(),
            ObjectType::Hypervisor => self.hypervisor.as_ref(),
            ObjectType::Datastore => self.datastore.as_ref(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.agent.host.trim().is_empty() {
            problems.push("agent.host must not be empty".to_string());
        }
        if self.registry.url.trim().is_empty() {
            problems.push("registry.url must not be empty".to_string());
        }
        if self.engine.workers == 0 {
            problems.push("engine.workers must be at least 1".to_string());
        }

        let mut configured = 0;
        for object_type in ObjectType::ALL {
            if let Some(section) = self.object_type(object_type) {
                configured += 1;
                problems.extend(section.problems(object_type));
            }
        }
        if configured == 0 {
            problems.push("no object type configured (vm, hypervisor, datastore)".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
