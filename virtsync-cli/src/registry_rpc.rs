//! JSON-RPC 2.0 adapter for the monitoring registry
//!
//! Every call is a POST of `{"jsonrpc":"2.0","method":..,"params":..,"id":..}`
//! with a bearer token. Error envelopes become `RegistryError::Api`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use virtsync_core::model::{HostCandidate, HostStatus, ManagedHost};
use virtsync_core::registry::{Registry, RegistryError};

/// Interface type of an agent interface in the registry API.
const AGENT_INTERFACE_TYPE: u8 = 1;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct HostRecord {
    hostid: String,
    host: String,
    name: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct GroupRecord {
    groupid: String,
}

#[derive(Debug, Deserialize)]
struct TemplateRecord {
    templateid: String,
}

#[derive(Debug, Deserialize)]
struct ProxyRecord {
    proxyid: String,
}

#[derive(Debug, Deserialize)]
struct CreatedGroups {
    groupids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChangedHosts {
    hostids: Vec<String>,
}

pub struct JsonRpcRegistry {
    client: reqwest::Client,
    url: String,
    token: String,
    next_id: AtomicU64,
}

impl JsonRpcRegistry {
    pub fn new(url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("virtsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::Transport {
                method: "client".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            url: url.into(),
            token: token.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        trace!(method, id, "registry request");

        let transport = |e: reqwest::Error| RegistryError::Transport {
            method: method.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Transport {
                method: method.to_string(),
                message: format!("HTTP {status}"),
            });
        }

        let envelope: RpcResponse = response.json().await.map_err(|e| RegistryError::Decode {
            method: method.to_string(),
            message: e.to_string(),
        })?;

        if let Some(error) = envelope.error {
            let data = match error.data {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => String::new(),
            };
            debug!(method, code = error.code, %data, "registry rejected call");
            return Err(RegistryError::Api {
                method: method.to_string(),
                code: error.code,
                message: error.message,
                data,
            });
        }

        let result = envelope.result.ok_or_else(|| RegistryError::Decode {
            method: method.to_string(),
            message: "envelope has neither result nor error".to_string(),
        })?;

        serde_json::from_value(result).map_err(|e| RegistryError::Decode {
            method: method.to_string(),
            message: e.to_string(),
        })
    }

    fn first_id<I: IntoIterator<Item = String>>(ids: I, method: &str) -> Result<String, RegistryError> {
        ids.into_iter().next().ok_or_else(|| RegistryError::Decode {
            method: method.to_string(),
            message: "no id returned".to_string(),
        })
    }
}

fn status_code(status: HostStatus) -> &'static str {
    match status {
        HostStatus::Enabled => "0",
        HostStatus::Disabled => "1",
    }
}

#[async_trait]
impl Registry for JsonRpcRegistry {
    async fn hosts(&self, group_ids: Option<&[String]>) -> Result<Vec<ManagedHost>, RegistryError> {
        let mut params = json!({ "output": ["hostid", "host", "name", "status"] });
        if let Some(groups) = group_ids {
            params["groupids"] = json!(groups);
        }

        let records: Vec<HostRecord> = self.call("host.get", params).await?;
        Ok(records
            .into_iter()
            .map(|r| ManagedHost {
                id: r.hostid,
                host: r.host,
                name: r.name,
                status: if r.status == "0" {
                    HostStatus::Enabled
                } else {
                    HostStatus::Disabled
                },
            })
            .collect())
    }

    async fn find_group(&self, name: &str) -> Result<Option<String>, RegistryError> {
        let params = json!({ "output": ["groupid"], "filter": { "name": [name] } });
        let records: Vec<GroupRecord> = self.call("hostgroup.get", params).await?;
        Ok(records.into_iter().next().map(|r| r.groupid))
    }

    async fn create_group(&self, name: &str) -> Result<String, RegistryError> {
        let created: CreatedGroups = self.call("hostgroup.create", json!({ "name": name })).await?;
        Self::first_id(created.groupids, "hostgroup.create")
    }

    async fn find_template(&self, name: &str) -> Result<Option<String>, RegistryError> {
        let params = json!({ "output": ["templateid"], "filter": { "host": [name] } });
        let records: Vec<TemplateRecord> = self.call("template.get", params).await?;
        Ok(records.into_iter().next().map(|r| r.templateid))
    }

    async fn find_proxy(&self, name: &str) -> Result<Option<String>, RegistryError> {
        let params = json!({ "output": ["proxyid"], "filter": { "host": [name] } });
        let records: Vec<ProxyRecord> = self.call("proxy.get", params).await?;
        Ok(records.into_iter().next().map(|r| r.proxyid))
    }

    async fn create_host(&self, host: &HostCandidate) -> Result<String, RegistryError> {
        let mut params = json!({
            "host": host.host,
            "name": host.name,
            "interfaces": [{
                "type": AGENT_INTERFACE_TYPE,
                "main": 1,
                "useip": 0,
                "ip": "",
                "dns": host.interface.dns,
                "port": host.interface.port.to_string(),
            }],
            "groups": host.group_ids.iter().map(|id| json!({ "groupid": id })).collect::<Vec<_>>(),
            "templates": host.template_ids.iter().map(|id| json!({ "templateid": id })).collect::<Vec<_>>(),
            "macros": host.macros.iter().map(|m| json!({ "macro": m.name, "value": m.value })).collect::<Vec<_>>(),
        });
        if let Some(proxy) = &host.proxy_id {
            params["proxy_hostid"] = json!(proxy);
        }

        let created: ChangedHosts = self.call("host.create", params).await?;
        Self::first_id(created.hostids, "host.create")
    }

    async fn set_host_status(&self, host_id: &str, status: HostStatus) -> Result<(), RegistryError> {
        let params = json!({ "hostid": host_id, "status": status_code(status) });
        let _: ChangedHosts = self.call("host.update", params).await?;
        Ok(())
    }

    async fn delete_host(&self, host_id: &str) -> Result<(), RegistryError> {
        let _: ChangedHosts = self.call("host.delete", json!([host_id])).await?;
        Ok(())
    }
}
