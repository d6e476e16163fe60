pub mod test_objects;

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Composite identifier for any entity in the fleet, VM or factory.
///
/// A `NodeId` is unique per `(machine, local)` pair. The `local` half is
/// handed out by the node registry's per-machine sequence, so two ids
/// allocated for the same machine never collide, even across processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    machine: String,
    local: u64,
}

impl NodeId {
    pub fn new(machine: impl Into<String>, local: u64) -> Self {
        Self {
            machine: machine.into(),
            local,
        }
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn local(&self) -> u64 {
        self.local
    }

    /// Store key form. Injective: `local` is the digits-only final segment,
    /// so a machine name containing `|` cannot produce a collision.
    pub fn key(&self) -> String {
        format!("{}|{}", self.machine, self.local)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine, self.local)
    }
}

/// The unit of work a factory currently holds. At most one non-idle
/// assignment exists per factory at any time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum FactoryAssignment {
    #[default]
    Idle,
    BuildClean {
        /// Set by `note_clean_id` once the factory has produced a concrete
        /// VM; `finish` registers it.
        noted_vm: Option<NodeId>,
    },
    DestroyDirty {
        vm: NodeId,
    },
}

impl FactoryAssignment {
    pub fn is_idle(&self) -> bool {
        matches!(self, FactoryAssignment::Idle)
    }
}

/// Persisted state of a registered factory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FactoryRecord {
    pub assignment: FactoryAssignment,
}

/// Persisted state of a registered VM. Metadata lives in a separate hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    pub dirty: bool,
}

/// What the coordinator told a factory to do, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrabResponse {
    /// No work available right now; poll again later.
    NoWork,
    /// Build a fresh sandbox VM.
    BuildClean,
    /// Destroy the named dirty VM.
    DestroyDirty(NodeId),
}

/// Caller-supplied admission hints for `grab`. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrabHints {
    /// System-wide bound on concurrently outstanding clean builds.
    /// `None` means uncapped. Dirty destruction is never subject to it.
    pub max_clean_vms: Option<u64>,
}

impl GrabHints {
    pub fn capped(max_clean_vms: u64) -> Self {
        Self {
            max_clean_vms: Some(max_clean_vms),
        }
    }

    /// Decodes hints arriving over the boundary. The value must be a JSON
    /// object; `max_clean_vms`, when present, must be a non-negative integer.
    pub fn from_value(value: &Value) -> Result<Self, CoordinationError> {
        let fields = value.as_object().ok_or_else(|| CoordinationError::TypeContract {
            what: "grab hints",
            got: json_type_name(value),
        })?;
        let max_clean_vms = match fields.get("max_clean_vms") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(raw.as_u64().ok_or_else(|| CoordinationError::TypeContract {
                what: "max_clean_vms hint",
                got: json_type_name(raw),
            })?),
        };
        Ok(Self { max_clean_vms })
    }
}

/// Errors surfaced by the coordination layer.
///
/// `Store` failures are transient and may be retried by the caller with
/// backoff; the coordination layer itself never retries. The other variants
/// are caller contract violations and must not be retried.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoordinationError {
    #[error("unexpected type for {what}: got {got}")]
    TypeContract { what: &'static str, got: &'static str },

    #[error("node {id} is not registered")]
    NotRegistered { id: NodeId },

    #[error("factory {id} violated the grab/finish protocol: {reason}")]
    ProtocolState { id: NodeId, reason: String },

    #[error("shared store operation failed: {source}")]
    Store { source: anyhow::Error },
}

impl CoordinationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

/// Validates a boundary argument that the contract requires to be text.
/// Non-text values are rejected, never coerced.
pub fn require_text<'a>(value: &'a Value, what: &'static str) -> Result<&'a str, CoordinationError> {
    value.as_str().ok_or_else(|| CoordinationError::TypeContract {
        what,
        got: json_type_name(value),
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_objects::tests::{UNICODE_PONY, UNICODE_SCRIBBLES};

    #[test]
    fn node_id_equality_is_by_value() {
        let a = NodeId::new("localhost", 3);
        let b = NodeId::new("localhost", 3);
        let c = NodeId::new("localhost", 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, NodeId::new("otherhost", 3));
    }

    #[test]
    fn node_id_key_is_injective_for_hostile_machine_names() {
        // "a|1" local 2 and "a" local 12 must not collide.
        assert_ne!(NodeId::new("a|1", 2).key(), NodeId::new("a", 12).key());
        let pony = NodeId::new(UNICODE_PONY, 1);
        let scribbles = NodeId::new(UNICODE_SCRIBBLES, 1);
        assert_ne!(pony.key(), scribbles.key());
    }

    #[test]
    fn node_id_round_trips_through_json() {
        let id = NodeId::new(UNICODE_PONY, 42);
        let encoded = serde_json::to_vec(&id).unwrap();
        let decoded: NodeId = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn hints_decode_ignores_unknown_keys() {
        let hints = GrabHints::from_value(&json!({
            "max_clean_vms": 2,
            "some_future_hint": "ignored",
        }))
        .unwrap();
        assert_eq!(hints.max_clean_vms, Some(2));
    }

    #[test]
    fn hints_missing_cap_means_uncapped() {
        let hints = GrabHints::from_value(&json!({})).unwrap();
        assert_eq!(hints.max_clean_vms, None);
    }

    #[test]
    fn hints_reject_wrong_types() {
        let err = GrabHints::from_value(&json!({ "max_clean_vms": -1 })).unwrap_err();
        assert!(matches!(err, CoordinationError::TypeContract { .. }));

        let err = GrabHints::from_value(&json!({ "max_clean_vms": "two" })).unwrap_err();
        assert!(matches!(err, CoordinationError::TypeContract { .. }));

        let err = GrabHints::from_value(&json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(err, CoordinationError::TypeContract { .. }));
    }

    #[test]
    fn require_text_accepts_strings_only() {
        assert_eq!(require_text(&json!("localhost"), "machine name").unwrap(), "localhost");
        assert_eq!(require_text(&json!(UNICODE_PONY), "machine name").unwrap(), UNICODE_PONY);

        for wrong in [json!(2), json!(null), json!(true), json!({}), json!([])] {
            let err = require_text(&wrong, "machine name").unwrap_err();
            assert!(matches!(err, CoordinationError::TypeContract { .. }));
        }
    }
}
