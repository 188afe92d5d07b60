//! Error types for the reconciliation engine
//!
//! Each layer owns its error enum; `SyncError` is what aborts an object-type
//! pass and wraps the lower layers through `#[from]`.

use crate::model::ObjectType;
use crate::protocol::ProtocolError;
use crate::registry::RegistryError;

/// Failure of a single object-type pass.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Socket or framing failure while talking to the discovery agent.
    #[error("agent connectivity: {0}")]
    Connectivity(#[from] ProtocolError),

    /// Mandatory configuration missing or unresolvable in the registry.
    #[error("configuration error for {object_type}: {message}")]
    Configuration {
        object_type: ObjectType,
        message: String,
    },

    /// Registry lookup rejected; per-host mutations never surface here.
    #[error("registry api: {0}")]
    Registry(#[from] RegistryError),

    /// Discovery payload is not the expected structured data.
    #[error("cannot decode discovery payload for {object_type}: {message}")]
    Decode {
        object_type: ObjectType,
        message: String,
    },

    /// The agent answered a rule query with its not-supported sentinel.
    #[error("agent does not support key {key}: {detail}")]
    Unsupported { key: String, detail: String },
}

impl SyncError {
    pub fn configuration(object_type: ObjectType, message: impl Into<String>) -> Self {
        Self::Configuration {
            object_type,
            message: message.into(),
        }
    }

    pub fn decode(object_type: ObjectType, message: impl Into<String>) -> Self {
        Self::Decode {
            object_type,
            message: message.into(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}
