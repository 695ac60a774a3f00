//! Ephemeral per-flow state.
//!
//! Two process-global maps, one mutex each: service state keyed by
//! (chat, user, service) and the per-(chat, user) active-flow session. No
//! retention across restart, by design.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::protocol::{JsonMap, StateDirective};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub chat_id: String,
    pub user_id: String,
    pub service_id: String,
}

impl StateKey {
    pub fn new(
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            service_id: service_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceState {
    pub version: u64,
    pub value: JsonMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveFlow {
    pub service_id: String,
    pub since: i64,
    pub ttl_ms: Option<i64>,
}

impl ActiveFlow {
    fn expired(&self, now: i64) -> bool {
        match self.ttl_ms {
            Some(ttl) => now - self.since > ttl,
            None => false,
        }
    }
}

#[derive(Default)]
pub struct FlowStateStore {
    states: Mutex<HashMap<StateKey, ServiceState>>,
    flows: Mutex<HashMap<(String, String), ActiveFlow>>,
}

impl FlowStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<StateKey, ServiceState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flows(&self) -> MutexGuard<'_, HashMap<(String, String), ActiveFlow>> {
        self.flows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Service state ───────────────────────────────────────────────

    pub fn get_service_state(&self, key: &StateKey) -> Option<ServiceState> {
        self.states().get(key).cloned()
    }

    /// Next version is `version`, or one past the current one.
    #[allow(dead_code)]
    pub fn set_service_state(
        &self,
        key: &StateKey,
        value: JsonMap,
        version: Option<u64>,
    ) -> ServiceState {
        let mut states = self.states();
        let next_version =
            version.unwrap_or_else(|| states.get(key).map(|s| s.version).unwrap_or(0) + 1);
        let state = ServiceState { version: next_version, value };
        states.insert(key.clone(), state.clone());
        state
    }

    /// Apply a directive, returning the post-image (absent after `clear`).
    /// Merge is shallow: nested objects are replaced, not deep-merged.
    pub fn apply_state_directive(
        &self,
        key: &StateKey,
        directive: &StateDirective,
    ) -> Option<ServiceState> {
        let mut states = self.states();
        match directive {
            StateDirective::Clear => {
                states.remove(key);
                None
            }
            StateDirective::Replace { value } => {
                let version = states.get(key).map(|s| s.version).unwrap_or(0) + 1;
                let state = ServiceState { version, value: value.clone() };
                states.insert(key.clone(), state.clone());
                Some(state)
            }
            StateDirective::Merge { value } => {
                let current = states.get(key);
                let version = current.map(|s| s.version).unwrap_or(0) + 1;
                let mut merged = current.map(|s| s.value.clone()).unwrap_or_default();
                for (k, v) in value {
                    merged.insert(k.clone(), v.clone());
                }
                let state = ServiceState { version, value: merged };
                states.insert(key.clone(), state.clone());
                Some(state)
            }
        }
    }

    // ── Active-flow sessions ────────────────────────────────────────

    pub fn set_active_flow(
        &self,
        chat_id: &str,
        user_id: &str,
        service_id: &str,
        ttl_ms: Option<i64>,
    ) {
        self.set_active_flow_at(chat_id, user_id, service_id, ttl_ms, now_ms());
    }

    pub fn set_active_flow_at(
        &self,
        chat_id: &str,
        user_id: &str,
        service_id: &str,
        ttl_ms: Option<i64>,
        now: i64,
    ) {
        self.flows().insert(
            (chat_id.to_string(), user_id.to_string()),
            ActiveFlow { service_id: service_id.to_string(), since: now, ttl_ms },
        );
    }

    /// Expired sessions are deleted on read.
    pub fn get_active_flow(&self, chat_id: &str, user_id: &str) -> Option<ActiveFlow> {
        self.get_active_flow_at(chat_id, user_id, now_ms())
    }

    pub fn get_active_flow_at(&self, chat_id: &str, user_id: &str, now: i64) -> Option<ActiveFlow> {
        let key = (chat_id.to_string(), user_id.to_string());
        let mut flows = self.flows();
        match flows.get(&key) {
            Some(flow) if flow.expired(now) => {
                flows.remove(&key);
                None
            }
            Some(flow) => Some(flow.clone()),
            None => None,
        }
    }

    pub fn clear_active_flow(&self, chat_id: &str, user_id: &str) {
        self.flows().remove(&(chat_id.to_string(), user_id.to_string()));
    }

    /// Bulk-remove every expired session; returns how many were dropped.
    pub fn sweep_expired_flows(&self, now: Option<i64>) -> usize {
        let now = now.unwrap_or_else(now_ms);
        let mut flows = self.flows();
        let before = flows.len();
        flows.retain(|_, flow| !flow.expired(now));
        before - flows.len()
    }

    /// Diagnostics/tests only.
    pub fn dump(&self) -> (Vec<(StateKey, ServiceState)>, Vec<((String, String), ActiveFlow)>) {
        let states = self.states().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let flows = self.flows().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        (states, flows)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, serde_json::Value)]) -> JsonMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn versions_increase_monotonically() {
        let store = FlowStateStore::new();
        let key = StateKey::new("c", "u", "svc");

        let mut last = 0;
        for directive in [
            StateDirective::Replace { value: map(&[("step", json!(1))]) },
            StateDirective::Merge { value: map(&[("step", json!(2))]) },
            StateDirective::Replace { value: map(&[("step", json!(3))]) },
        ] {
            let state = store.apply_state_directive(&key, &directive).unwrap();
            assert!(state.version > last);
            last = state.version;
        }
    }

    #[test]
    fn merge_is_shallow() {
        let store = FlowStateStore::new();
        let key = StateKey::new("c", "u", "svc");

        store.apply_state_directive(
            &key,
            &StateDirective::Replace {
                value: map(&[("keep", json!("yes")), ("nested", json!({"a": 1, "b": 2}))]),
            },
        );
        let state = store
            .apply_state_directive(
                &key,
                &StateDirective::Merge { value: map(&[("nested", json!({"a": 9}))]) },
            )
            .unwrap();

        assert_eq!(state.value["keep"], json!("yes"));
        // Nested objects are replaced wholesale, not deep-merged.
        assert_eq!(state.value["nested"], json!({"a": 9}));
    }

    #[test]
    fn clear_removes_and_returns_absent() {
        let store = FlowStateStore::new();
        let key = StateKey::new("c", "u", "svc");
        store.set_service_state(&key, map(&[("x", json!(1))]), None);

        assert!(store.apply_state_directive(&key, &StateDirective::Clear).is_none());
        assert!(store.get_service_state(&key).is_none());
    }

    #[test]
    fn set_service_state_respects_explicit_version() {
        let store = FlowStateStore::new();
        let key = StateKey::new("c", "u", "svc");
        let state = store.set_service_state(&key, map(&[]), Some(42));
        assert_eq!(state.version, 42);
        let next = store.set_service_state(&key, map(&[]), None);
        assert_eq!(next.version, 43);
    }

    #[test]
    fn active_flow_expires_on_read() {
        let store = FlowStateStore::new();
        store.set_active_flow_at("c", "u", "flow", Some(1000), 10_000);

        // Within the ttl the session is visible.
        let flow = store.get_active_flow_at("c", "u", 10_500).unwrap();
        assert_eq!(flow.service_id, "flow");

        // Past the ttl it is gone, and gone for good.
        assert!(store.get_active_flow_at("c", "u", 11_001).is_none());
        assert!(store.get_active_flow_at("c", "u", 10_500).is_none());
    }

    #[test]
    fn one_session_per_chat_user() {
        let store = FlowStateStore::new();
        store.set_active_flow_at("c", "u", "first", None, 0);
        store.set_active_flow_at("c", "u", "second", None, 1);
        let flow = store.get_active_flow_at("c", "u", 2).unwrap();
        assert_eq!(flow.service_id, "second");
    }

    #[test]
    fn sweep_removes_only_expired_sessions() {
        let store = FlowStateStore::new();
        store.set_active_flow_at("c1", "u", "a", Some(100), 0);
        store.set_active_flow_at("c2", "u", "b", Some(10_000), 0);
        store.set_active_flow_at("c3", "u", "c", None, 0);

        let swept = store.sweep_expired_flows(Some(5_000));
        assert_eq!(swept, 1);
        assert!(store.get_active_flow_at("c2", "u", 5_000).is_some());
        assert!(store.get_active_flow_at("c3", "u", 5_000).is_some());
    }
}
