//! Static registry of publishable event names.
//!
//! Unknown names and payloads missing required fields are rejected
//! before anything is persisted.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Required string fields per event name. `(field, nullable)`: a
/// nullable field must be present but may be JSON null.
type FieldSpec = &'static [(&'static str, bool)];

pub static EVENT_REGISTRY: Lazy<HashMap<&'static str, FieldSpec>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, FieldSpec> = HashMap::new();
    registry.insert(
        "session.started",
        &[
            ("sessionId", false),
            ("epicId", true),
            ("agentId", false),
            ("tmuxSessionName", false),
        ],
    );
    registry.insert(
        "orchestrator.worktree.activity",
        &[
            ("worktreeId", false),
            ("ownerProjectId", false),
            ("type", false),
        ],
    );
    registry.insert(
        "orchestrator.worktree.merged",
        &[("worktreeId", false), ("mergeCommit", false)],
    );
    registry.insert("worktree.task-merge-requested", &[("worktreeId", false)]);
    registry
});

/// Event name with rolling retention; everything else is kept forever.
pub const ACTIVITY_EVENT: &str = "orchestrator.worktree.activity";

pub fn is_registered(name: &str) -> bool {
    EVENT_REGISTRY.contains_key(name)
}

/// Validate a payload against the registry. Returns a description of
/// the first violation, `None` when the payload is acceptable.
pub fn validate_payload(name: &str, payload: &serde_json::Value) -> Option<String> {
    let spec = EVENT_REGISTRY.get(name)?;
    if !payload.is_object() {
        return Some("payload must be a JSON object".to_string());
    }
    for (field, nullable) in spec.iter() {
        match payload.get(field) {
            None => return Some(format!("missing field '{field}'")),
            Some(serde_json::Value::Null) if !nullable => {
                return Some(format!("field '{field}' must not be null"))
            }
            Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::String(_)) => {}
            Some(_) => return Some(format!("field '{field}' must be a string")),
        }
    }
    None
}
