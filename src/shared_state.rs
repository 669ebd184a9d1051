//! The cross-process-visible state map.
//!
//! The main process holds the authoritative copy; every worker holds a mirror that is seeded
//! with a snapshot at spawn time and kept in sync by `update_state_value` and `cancel`
//! notifications afterwards. Each mirror has a single writer (the worker's notification
//! listener), so per-worker notification ordering keeps mirrors consistent without a shared
//! memory segment.
//!
use crate::protocol::SubmissionId;
use dashmap::DashMap;
use serde_json::Value;

/// Reserved key holding the host-defined state bag that offloaded functions can consult for
/// go/no-go style decisions.
pub const CURRENT_STATE_KEY: &str = "current_state";

const CANCEL_KEY_PREFIX: &str = "cancel:";

fn cancel_key(id: SubmissionId) -> String {
    format!("{CANCEL_KEY_PREFIX}{id}")
}

#[derive(Debug, Default)]
pub struct SharedState {
    values: DashMap<String, Value>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Atomic read-modify-write of a single key. Compound updates that span processes must go
    /// through the owning (main) process; see `Pool::update_state_value`.
    pub fn update<F>(&self, key: impl Into<String>, f: F)
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let key = key.into();
        let mut entry = self.values.entry(key).or_insert(Value::Null);
        let current = entry.value();
        let next = f(if current.is_null() { None } else { Some(current) });
        *entry.value_mut() = next;
    }

    pub fn current_state(&self) -> Option<Value> {
        self.get(CURRENT_STATE_KEY)
    }

    /// Sets the cancel flag for a submission. The flag only ever goes false→true; marking an
    /// already-cancelled submission is a no-op. Returns whether the flag was newly set.
    pub fn mark_cancelled(&self, id: SubmissionId) -> bool {
        self.values
            .insert(cancel_key(id), Value::Bool(true))
            .is_none()
    }

    pub fn is_cancelled(&self, id: SubmissionId) -> bool {
        matches!(self.get(&cancel_key(id)), Some(Value::Bool(true)))
    }

    /// Removes the cancel flag once its submission reached a terminal state.
    pub fn purge_cancelled(&self, id: SubmissionId) {
        self.values.remove(&cancel_key(id));
    }

    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Replaces the whole map. Used on the worker side to apply the spawn-time snapshot.
    pub fn replace(&self, map: serde_json::Map<String, Value>) {
        self.values.clear();
        for (key, value) in map {
            self.values.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_round_trip() {
        let state = SharedState::new();
        state.set("answer", json!(42));
        assert_eq!(state.get("answer"), Some(json!(42)));
        assert_eq!(state.get("question"), None);
    }

    #[test]
    fn update_sees_the_previous_value() {
        let state = SharedState::new();
        state.set("hits", json!(1));
        state.update("hits", |old| {
            json!(old.and_then(Value::as_u64).unwrap_or(0) + 1)
        });
        assert_eq!(state.get("hits"), Some(json!(2)));
    }

    #[test]
    fn cancel_flags_only_transition_false_to_true() {
        let state = SharedState::new();
        let id = SubmissionId::from(7);
        assert!(!state.is_cancelled(id));
        assert!(state.mark_cancelled(id));
        assert!(state.is_cancelled(id));
        // a second mark is a no-op, not a new transition
        assert!(!state.mark_cancelled(id));
        assert!(state.is_cancelled(id));
    }

    #[test]
    fn purged_cancel_flags_disappear_from_the_map() {
        let state = SharedState::new();
        let id = SubmissionId::from(7);
        state.mark_cancelled(id);
        state.purge_cancelled(id);
        assert!(!state.is_cancelled(id));
        assert!(state.snapshot().is_empty());
    }

    #[test]
    fn replace_applies_a_snapshot() {
        let source = SharedState::new();
        source.set(CURRENT_STATE_KEY, json!({"go": true}));
        source.set("config_path", json!("/etc/app.toml"));

        let mirror = SharedState::new();
        mirror.set("stale", json!(true));
        mirror.replace(source.snapshot());

        assert_eq!(mirror.current_state(), Some(json!({"go": true})));
        assert_eq!(mirror.get("stale"), None);
    }
}
