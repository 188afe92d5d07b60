/*!
In-memory monitoring registry

Implements the `Registry` port over plain vectors so reconciliation runs can
be asserted without a server. Failures can be injected per method or per host.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use virtsync_core::model::{HostCandidate, HostStatus, ManagedHost};
use virtsync_core::registry::{Registry, RegistryError};

/// Host as stored by the mock, with everything the candidate carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHost {
    pub id: String,
    pub host: String,
    pub name: String,
    pub status: HostStatus,
    pub dns: String,
    pub group_ids: Vec<String>,
    pub template_ids: Vec<String>,
    pub proxy_id: Option<String>,
    pub macros: BTreeMap<String, String>,
}

impl StoredHost {
    fn managed(&self) -> ManagedHost {
        ManagedHost {
            id: self.id.clone(),
            host: self.host.clone(),
            name: self.name.clone(),
            status: self.status,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    hosts: Vec<StoredHost>,
    groups: BTreeMap<String, String>,
    templates: BTreeMap<String, String>,
    proxies: BTreeMap<String, String>,
    calls: Vec<String>,
    failing_methods: HashSet<String>,
    rejected_hosts: HashSet<String>,
}

impl RegistryState {
    fn allocate(&mut self) -> String {
        self.next_id += 1;
        (10_000 + self.next_id).to_string()
    }

    fn enter(&mut self, method: &str) -> Result<(), RegistryError> {
        self.calls.push(method.to_string());
        if self.failing_methods.contains(method) {
            return Err(RegistryError::Api {
                method: method.to_string(),
                code: -32500,
                message: "Application error.".to_string(),
                data: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<RegistryState>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, name: &str, id: &str) -> Self {
        self.state.lock().groups.insert(name.to_string(), id.to_string());
        self
    }

    pub fn with_template(self, name: &str, id: &str) -> Self {
        self.state.lock().templates.insert(name.to_string(), id.to_string());
        self
    }

    pub fn with_proxy(self, name: &str, id: &str) -> Self {
        self.state.lock().proxies.insert(name.to_string(), id.to_string());
        self
    }

    /// Seeds an existing host and returns its id.
    pub fn seed_host(&self, host: &str, name: &str, group_ids: &[&str], status: HostStatus) -> String {
        let mut state = self.state.lock();
        let id = state.allocate();
        state.hosts.push(StoredHost {
            id: id.clone(),
            host: host.to_string(),
            name: name.to_string(),
            status,
            dns: name.to_string(),
            group_ids: group_ids.iter().map(|g| g.to_string()).collect(),
            template_ids: Vec::new(),
            proxy_id: None,
            macros: BTreeMap::new(),
        });
        id
    }

    /// Makes every call to `method` fail with an API error.
    pub fn fail_method(&self, method: &str) {
        self.state.lock().failing_methods.insert(method.to_string());
    }

    /// Makes `host.create` fail for this technical name only.
    pub fn reject_host(&self, host: &str) {
        self.state.lock().rejected_hosts.insert(host.to_string());
    }

    pub fn hosts_snapshot(&self) -> Vec<StoredHost> {
        self.state.lock().hosts.clone()
    }

    pub fn host(&self, host: &str) -> Option<StoredHost> {
        self.state.lock().hosts.iter().find(|h| h.host == host).cloned()
    }

    pub fn group_id(&self, name: &str) -> Option<String> {
        self.state.lock().groups.get(name).cloned()
    }

    /// Number of calls made to `method`, failed ones included.
    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| c.as_str() == method).count()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn hosts(&self, group_ids: Option<&[String]>) -> Result<Vec<ManagedHost>, RegistryError> {
        let mut state = self.state.lock();
        state.enter("host.get")?;
        Ok(state
            .hosts
            .iter()
            .filter(|h| match group_ids {
                Some(groups) => h.group_ids.iter().any(|g| groups.contains(g)),
                None => true,
            })
            .map(StoredHost::managed)
            .collect())
    }

    async fn find_group(&self, name: &str) -> Result<Option<String>, RegistryError> {
        let mut state = self.state.lock();
        state.enter("hostgroup.get")?;
        Ok(state.groups.get(name).cloned())
    }

    async fn create_group(&self, name: &str) -> Result<String, RegistryError> {
        let mut state = self.state.lock();
        state.enter("hostgroup.create")?;
        if state.groups.contains_key(name) {
            return Err(RegistryError::Api {
                method: "hostgroup.create".to_string(),
                code: -32602,
                message: "Invalid params.".to_string(),
                data: format!("Host group \"{name}\" already exists."),
            });
        }
        let id = state.allocate();
        state.groups.insert(name.to_string(), id.clone());
        log::info!("[mock-registry] group {} created as {}", name, id);
        Ok(id)
    }

    async fn find_template(&self, name: &str) -> Result<Option<String>, RegistryError> {
        let mut state = self.state.lock();
        state.enter("template.get")?;
        Ok(state.templates.get(name).cloned())
    }

    async fn find_proxy(&self, name: &str) -> Result<Option<String>, RegistryError> {
        let mut state = self.state.lock();
        state.enter("proxy.get")?;
        Ok(state.proxies.get(name).cloned())
    }

    async fn create_host(&self, host: &HostCandidate) -> Result<String, RegistryError> {
        let mut state = self.state.lock();
        state.enter("host.create")?;
        if state.rejected_hosts.contains(&host.host) || state.hosts.iter().any(|h| h.host == host.host) {
            return Err(RegistryError::Api {
                method: "host.create".to_string(),
                code: -32602,
                message: "Invalid params.".to_string(),
                data: format!("Host with the same name \"{}\" already exists.", host.host),
            });
        }

        let id = state.allocate();
        state.hosts.push(StoredHost {
            id: id.clone(),
            host: host.host.clone(),
            name: host.name.clone(),
            status: HostStatus::Enabled,
            dns: host.interface.dns.clone(),
            group_ids: host.group_ids.clone(),
            template_ids: host.template_ids.clone(),
            proxy_id: host.proxy_id.clone(),
            macros: host.macros.iter().map(|m| (m.name.clone(), m.value.clone())).collect(),
        });
        log::info!("[mock-registry] host {} created as {}", host.host, id);
        Ok(id)
    }

    async fn set_host_status(&self, host_id: &str, status: HostStatus) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.enter("host.update")?;
        match state.hosts.iter_mut().find(|h| h.id == host_id) {
            Some(host) => {
                host.status = status;
                Ok(())
            }
            None => Err(unknown_host("host.update", host_id)),
        }
    }

    async fn delete_host(&self, host_id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.enter("host.delete")?;
        let before = state.hosts.len();
        state.hosts.retain(|h| h.id != host_id);
        if state.hosts.len() == before {
            return Err(unknown_host("host.delete", host_id));
        }
        Ok(())
    }
}

fn unknown_host(method: &str, host_id: &str) -> RegistryError {
    RegistryError::Api {
        method: method.to_string(),
        code: -32500,
        message: "Application error.".to_string(),
        data: format!("No permissions to referred object or it does not exist! ({host_id})"),
    }
}
