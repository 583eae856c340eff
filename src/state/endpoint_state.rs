//! Endpoint State
//!
//! The full gossip view of one endpoint: its heartbeat, the map of
//! versioned application states, a liveness flag and the monotonic stamp
//! of the last touch. Only the gossip merge path and local updates mutate
//! an `EndpointState`; everyone else reads snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::heartbeat::HeartbeatState;
use crate::state::versioned::{is_dead_status_token, ApplicationKey, VersionedValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointState {
    heartbeat: HeartbeatState,
    application_states: BTreeMap<ApplicationKey, VersionedValue>,
    #[serde(skip)]
    alive: bool,
    /// Monotonic nanos of the last touch; not meaningful across processes
    #[serde(skip)]
    update_timestamp_nanos: u64,
}

impl EndpointState {
    pub fn new(heartbeat: HeartbeatState, now_nanos: u64) -> Self {
        Self {
            heartbeat,
            application_states: BTreeMap::new(),
            alive: true,
            update_timestamp_nanos: now_nanos,
        }
    }

    pub fn heartbeat(&self) -> HeartbeatState {
        self.heartbeat
    }

    pub fn heartbeat_mut(&mut self) -> &mut HeartbeatState {
        &mut self.heartbeat
    }

    pub fn set_heartbeat(&mut self, heartbeat: HeartbeatState) {
        self.heartbeat = heartbeat;
    }

    pub fn generation(&self) -> i32 {
        self.heartbeat.generation
    }

    pub fn application_state(&self, key: ApplicationKey) -> Option<&VersionedValue> {
        self.application_states.get(&key)
    }

    pub fn application_states(&self) -> impl Iterator<Item = (ApplicationKey, &VersionedValue)> {
        self.application_states.iter().map(|(k, v)| (*k, v))
    }

    pub fn add_application_state(&mut self, key: ApplicationKey, value: VersionedValue) {
        self.application_states.insert(key, value);
    }

    /// The greatest of the heartbeat version and every entry version
    pub fn max_version(&self) -> i32 {
        let mut max = self.heartbeat.version;
        for value in self.application_states.values() {
            max = max.max(value.version);
        }
        max
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn mark_alive(&mut self) {
        self.alive = true;
    }

    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    /// Whether the status entry carries a dead token, irrespective of the
    /// liveness flag
    pub fn is_dead_state(&self) -> bool {
        match self.application_state(ApplicationKey::Status) {
            Some(value) => is_dead_status_token(value.status_token()),
            None => false,
        }
    }

    pub fn update_timestamp_nanos(&self) -> u64 {
        self.update_timestamp_nanos
    }

    pub fn touch(&mut self, now_nanos: u64) {
        self.update_timestamp_nanos = now_nanos;
    }

    /// Build the partial state holding everything newer than `version`:
    /// the heartbeat if it is newer, plus every newer application entry.
    /// The heartbeat is always included when any entry qualifies; a stale
    /// heartbeat is simply discarded by the receiver.
    pub fn newer_than(&self, version: i32) -> Option<EndpointState> {
        let mut partial: Option<EndpointState> = if self.heartbeat.version > version {
            Some(EndpointState::new(self.heartbeat, 0))
        } else {
            None
        };
        for (key, value) in &self.application_states {
            if value.version > version {
                partial
                    .get_or_insert_with(|| EndpointState::new(self.heartbeat, 0))
                    .add_application_state(*key, value.clone());
            }
        }
        partial
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  generation:{}", self.heartbeat.generation)?;
        writeln!(f, "  heartbeat:{}", self.heartbeat.version)?;
        for (key, value) in &self.application_states {
            writeln!(f, "  {:?}:{}", key, value.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::heartbeat::VersionGenerator;
    use crate::state::versioned::ValueFactory;
    use std::sync::Arc;

    fn factory() -> ValueFactory {
        ValueFactory::new(Arc::new(VersionGenerator::new()))
    }

    #[test]
    fn test_max_version_covers_heartbeat_and_entries() {
        let values = factory();
        let mut state = EndpointState::new(HeartbeatState::with_version(1, 3), 0);
        assert_eq!(state.max_version(), 3);

        let dc = values.datacenter("east");
        let dc_version = dc.version;
        state.add_application_state(ApplicationKey::Datacenter, dc);
        assert_eq!(state.max_version(), dc_version.max(3));
    }

    #[test]
    fn test_dead_state_from_status() {
        let values = factory();
        let mut state = EndpointState::new(HeartbeatState::new(1), 0);
        assert!(!state.is_dead_state());

        state.add_application_state(ApplicationKey::Status, values.normal());
        assert!(!state.is_dead_state());

        state.add_application_state(ApplicationKey::Status, values.left(0));
        assert!(state.is_dead_state());
    }

    #[test]
    fn test_newer_than_filters_entries() {
        let values = factory();
        let mut state = EndpointState::new(HeartbeatState::with_version(1, 1), 0);
        let dc = values.datacenter("east");
        let rack = values.rack("r1");
        let cut = dc.version;
        state.add_application_state(ApplicationKey::Datacenter, dc);
        state.add_application_state(ApplicationKey::Rack, rack);

        let partial = state.newer_than(cut).unwrap();
        assert!(partial
            .application_state(ApplicationKey::Datacenter)
            .is_none());
        assert!(partial.application_state(ApplicationKey::Rack).is_some());

        // nothing newer than the max version
        assert!(state.newer_than(state.max_version()).is_none());
    }

    #[test]
    fn test_newer_than_includes_heartbeat_only() {
        let state = EndpointState::new(HeartbeatState::with_version(1, 10), 0);
        let partial = state.newer_than(5).unwrap();
        assert_eq!(partial.heartbeat().version, 10);
        assert_eq!(partial.application_states().count(), 0);
    }
}
