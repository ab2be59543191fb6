//! Per-room chat turn state and its process-wide registry.
//!
//! Grounded on `original_source/backend/room_states.py`: a room state is a
//! tiny value carrying a cooperative stop flag, consulted by the streaming
//! loop between events; a registry keyed by room id hands back the same
//! object for a given id on every call, lazily creating it on first access
//! and never removing it (mirrors the original's module-level dict that is
//! never pruned — rooms are assumed to live for the process lifetime).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A small per-room value exposing cooperative stop/failed semantics for a
/// chat turn. No cross-room sharing: each room id owns exactly one
/// instance (via [`RoomStateRegistry`]).
#[derive(Default)]
pub struct RoomState {
    stopped: AtomicBool,
}

impl RoomState {
    pub fn new() -> Self {
        Self { stopped: AtomicBool::new(false) }
    }

    /// Requests cancellation of whatever turn is currently streaming in
    /// this room. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Clears the stop flag so the room can start a fresh turn. Called by
    /// the orchestrator before it begins streaming a new turn.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}

/// Keyed by room id, ensures there is at most one [`RoomState`] object per
/// room for the lifetime of the process.
#[derive(Default)]
pub struct RoomStateRegistry {
    rooms: Mutex<HashMap<String, Arc<RoomState>>>,
}

impl RoomStateRegistry {
    pub fn new() -> Self {
        Self { rooms: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_create(&self, room_id: &str) -> Arc<RoomState> {
        let mut rooms = self.rooms.lock().unwrap();
        Arc::clone(rooms.entry(room_id.to_string()).or_insert_with(|| Arc::new(RoomState::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_hands_back_the_same_object_per_room_id() {
        let registry = RoomStateRegistry::new();
        let a = registry.get_or_create("room-1");
        let b = registry.get_or_create("room-1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_rooms_get_distinct_state() {
        let registry = RoomStateRegistry::new();
        let a = registry.get_or_create("room-1");
        let b = registry.get_or_create("room-2");
        a.stop();
        assert!(a.is_stopped());
        assert!(!b.is_stopped());
    }

    #[test]
    fn reset_clears_a_prior_stop() {
        let state = RoomState::new();
        state.stop();
        assert!(state.is_stopped());
        state.reset();
        assert!(!state.is_stopped());
    }
}
