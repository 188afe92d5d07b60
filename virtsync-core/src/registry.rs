//! Monitoring registry port
//!
//! The engine only reads host records and requests mutations through this
//! trait; transports (JSON-RPC, in-memory doubles) live outside the core.

use async_trait::async_trait;

use crate::model::{HostCandidate, HostStatus, ManagedHost};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Typed error envelope returned by the registry API.
    #[error("{method} rejected by registry: [{code}] {message} {data}")]
    Api {
        method: String,
        code: i64,
        message: String,
        data: String,
    },
    #[error("transport failure on {method}: {message}")]
    Transport { method: String, message: String },
    #[error("unexpected response to {method}: {message}")]
    Decode { method: String, message: String },
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// All hosts, or only members of `group_ids` when given.
    async fn hosts(&self, group_ids: Option<&[String]>) -> Result<Vec<ManagedHost>, RegistryError>;

    async fn find_group(&self, name: &str) -> Result<Option<String>, RegistryError>;

    async fn create_group(&self, name: &str) -> Result<String, RegistryError>;

    async fn find_template(&self, name: &str) -> Result<Option<String>, RegistryError>;

    async fn find_proxy(&self, name: &str) -> Result<Option<String>, RegistryError>;

    /// Returns the id of the new host.
    async fn create_host(&self, host: &HostCandidate) -> Result<String, RegistryError>;

    async fn set_host_status(&self, host_id: &str, status: HostStatus) -> Result<(), RegistryError>;

    async fn delete_host(&self, host_id: &str) -> Result<(), RegistryError>;
}
