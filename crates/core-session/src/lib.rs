//! Session runtime and process-wide dispatcher: the seam between the
//! transport, the script VM, the tracker, and the hot-reload pipeline.
//!
//! Each session's entire mutable state (script runtime, tracker, wrappers)
//! lives on one dedicated worker thread; the [`Dispatcher`] holds a Send
//! handle per session and serializes inbound handling, change sweeps, and
//! outbound emission in that order. Outbound records flow through one
//! crossbeam channel to whatever transport the embedder runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod dispatcher;
mod runtime;

pub use dispatcher::{Dispatcher, SessionOutput};
pub use runtime::SessionRuntime;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session {0:?}")]
    UnknownSession(String),
    #[error("session {0:?} already exists")]
    DuplicateSession(String),
    #[error("failed to spawn session worker: {0}")]
    Spawn(String),
    #[error("create requires a path property")]
    MissingPath,
    #[error(transparent)]
    Track(#[from] core_track::TrackError),
    #[error(transparent)]
    Script(#[from] core_script::ScriptError),
    #[error(transparent)]
    Exec(#[from] core_script::ExecError),
}

/// Inbound variable operation from a frontend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Inbound {
    /// `create(id, parentId, properties)`; `path` is required.
    Create {
        id: u32,
        #[serde(rename = "parentId")]
        parent_id: u32,
        #[serde(default)]
        properties: serde_json::Map<String, serde_json::Value>,
    },
    /// `update(varId, value?, properties?)`; properties-only updates skip
    /// the path write.
    Update {
        #[serde(rename = "varId")]
        var_id: u32,
        #[serde(default)]
        value: Option<serde_json::Value>,
        #[serde(default)]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
    Destroy {
        #[serde(rename = "varId")]
        var_id: u32,
    },
}

/// Outbound record materialized from a sweep.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Outbound {
    /// Variable delta: serialized value when it changed, plus the subset of
    /// properties that changed.
    #[serde(rename_all = "camelCase")]
    Update {
        var_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
    /// Field definition for an object id mentioned for the first time.
    #[serde(rename_all = "camelCase")]
    ObjectDef {
        obj_id: u32,
        #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
        type_name: Option<String>,
        fields: serde_json::Map<String, serde_json::Value>,
    },
}

fn props_to_entries(map: &serde_json::Map<String, serde_json::Value>) -> Vec<(String, String)> {
    map.iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_ops_deserialize() {
        let create: Inbound = serde_json::from_str(
            r#"{"op":"create","id":7,"parentId":1,"properties":{"path":"items"}}"#,
        )
        .unwrap();
        assert!(matches!(create, Inbound::Create { id: 7, parent_id: 1, .. }));

        let update: Inbound =
            serde_json::from_str(r#"{"op":"update","varId":7,"value":"x"}"#).unwrap();
        assert!(matches!(update, Inbound::Update { var_id: 7, .. }));

        let destroy: Inbound = serde_json::from_str(r#"{"op":"destroy","varId":7}"#).unwrap();
        assert!(matches!(destroy, Inbound::Destroy { var_id: 7 }));
    }

    #[test]
    fn outbound_update_omits_empty_parts() {
        let rec = Outbound::Update {
            var_id: 3,
            value: Some(serde_json::json!({"obj": 1})),
            properties: None,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"varId\":3"));
        assert!(!json.contains("properties"));
    }
}
