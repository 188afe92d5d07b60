/*!
Test harness for reconciliation runs

Wires a `StubAgent` and a `MockRegistry` together and builds discovery
payloads and configurations with sensible defaults.
*/

use anyhow::Result;
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;
use virtsync_core::config::{AgentSettings, Config, EngineSettings, NotifySettings, ObjectTypeConfig, RegistrySettings, RuleConfig};
use virtsync_core::engine::Engine;
use virtsync_core::model::ObjectType;
use virtsync_core::reconcile::RunContext;
use virtsync_core::report::SyncOutcome;

use crate::agent_stub::StubAgent;
use crate::registry_stub::MockRegistry;

/// Builds `{"data": [...]}` discovery answers.
pub struct DiscoveryBuilder {
    object_type: ObjectType,
    entries: Vec<Value>,
}

impl DiscoveryBuilder {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            entries: Vec::new(),
        }
    }

    pub fn object(mut self, uuid: &str, name: &str) -> Self {
        let mut entry = Map::new();
        entry.insert(self.object_type.uuid_field().to_string(), json!(uuid));
        entry.insert(self.object_type.name_field().to_string(), json!(name));
        self.entries.push(Value::Object(entry));
        self
    }

    /// `count` objects named `<prefix>-NNN` with uuid `<prefix>-uuid-NNN`.
    pub fn objects(mut self, prefix: &str, count: usize) -> Self {
        for i in 0..count {
            self = self.object(&format!("{prefix}-uuid-{i:03}"), &format!("{prefix}-{i:03}"));
        }
        self
    }

    pub fn build(self) -> String {
        json!({ "data": self.entries }).to_string()
    }
}

/// Type section with one template and one group and no rules.
pub fn type_section(template: &str, group: &str) -> ObjectTypeConfig {
    ObjectTypeConfig {
        templates: vec![template.to_string()],
        groups: vec![group.to_string()],
        use_uuid: true,
        ..Default::default()
    }
}

pub fn rule(method: &str, pattern: &str) -> RuleConfig {
    RuleConfig {
        method: method.to_string(),
        pattern: pattern.to_string(),
    }
}

pub struct TestHarness {
    pub agent: StubAgent,
    pub registry: MockRegistry,
}

impl TestHarness {
    /// Starts the stub agent; the registry knows nothing yet.
    pub async fn start() -> Result<Self> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
        Ok(Self {
            agent: StubAgent::start().await?,
            registry: MockRegistry::new(),
        })
    }

    pub fn with_registry(mut self, registry: MockRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Configuration pointing at the stub agent, with only the given sections.
    pub fn config(&self, sections: &[(ObjectType, ObjectTypeConfig)]) -> Config {
        let mut config = Config {
            agent: AgentSettings {
                host: self.agent.addr().ip().to_string(),
                port: self.agent.addr().port(),
                connect_timeout_secs: 2,
                read_timeout_secs: 5,
            },
            registry: RegistrySettings {
                url: "http://registry.invalid/api_jsonrpc.php".to_string(),
                token: None,
                timeout_secs: 5,
            },
            engine: EngineSettings::default(),
            notify: NotifySettings::default(),
            vm: None,
            hypervisor: None,
            datastore: None,
        };
        for (object_type, section) in sections {
            let slot = match object_type {
                ObjectType::Vm => &mut config.vm,
                ObjectType::Hypervisor => &mut config.hypervisor,
                ObjectType::Datastore => &mut config.datastore,
            };
            *slot = Some(section.clone());
        }
        config
    }

    pub fn discover(&self, object_type: ObjectType, payload: String) {
        self.agent.answer(object_type.discovery_key(), payload);
    }

    /// Full run against the stub agent and the mock registry.
    pub async fn run(&self, config: &Config, ctx: RunContext) -> SyncOutcome {
        let client = config.agent.client();
        let engine = Engine::new(&self.registry, &client, ctx);
        let outcome = engine.run(config).await;
        log::info!("[harness] {}", outcome.summary());
        outcome
    }
}
