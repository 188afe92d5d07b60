//! Discovery payload parsing
//!
//! The agent answers a discovery key with `{"data": [{"{#VM.UUID}": "...", "{#VM.NAME}": "..."}, ...]}`.
//! Field names depend on the object type; the key field depends on the identifier scheme.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{SyncError, SyncResult};
use crate::model::{DiscoveredObject, ObjectType};
use crate::protocol::NOT_SUPPORTED_PREFIX;

#[derive(Debug, Deserialize)]
struct DiscoveryPayload {
    data: Vec<Map<String, Value>>,
}

/// Discovered objects of one type indexed by key.
pub type Inventory = BTreeMap<String, DiscoveredObject>;

pub fn parse_discovery(object_type: ObjectType, payload: &str, use_uuid: bool) -> SyncResult<Inventory> {
    if payload.trim_start().starts_with(NOT_SUPPORTED_PREFIX) {
        return Err(SyncError::decode(
            object_type,
            format!("agent does not support {}: {}", object_type.discovery_key(), payload.trim()),
        ));
    }

    let parsed: DiscoveryPayload =
        serde_json::from_str(payload).map_err(|e| SyncError::decode(object_type, e.to_string()))?;

    let key_field = if use_uuid {
        object_type.uuid_field()
    } else {
        object_type.name_field()
    };
    let name_field = object_type.name_field();

    let mut inventory = Inventory::new();
    for (index, entry) in parsed.data.iter().enumerate() {
        let key = string_field(object_type, entry, key_field, index)?;
        let name = string_field(object_type, entry, name_field, index)?;

        let object = DiscoveredObject { key: key.clone(), name };
        if let Some(previous) = inventory.insert(key, object) {
            warn!(object_type = %object_type, key = %previous.key, "duplicate key in discovery answer, keeping the last entry");
        }
    }
    Ok(inventory)
}

fn string_field(object_type: ObjectType, entry: &Map<String, Value>, field: &str, index: usize) -> SyncResult<String> {
    match entry.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) => Err(SyncError::decode(
            object_type,
            format!("entry #{index}: field {field} is not a non-empty string ({other})"),
        )),
        None => Err(SyncError::decode(object_type, format!("entry #{index}: missing field {field}"))),
    }
}
