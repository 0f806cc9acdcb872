// src/registry.rs
//
// Process-wide map from room name to live `Room`.
//
// The map lock is a plain mutex that is never held across an await: lookups
// and replacements are instantaneous, and all slow work happens under the
// per-room lock.  Rooms are created by the first join that names them and
// dropped once they retire (their last participant left).  No other message
// creates a room.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::SignalingError;
use crate::media::IceCandidate;
use crate::room::{Room, RoomServices};

/// A retired room is swapped for a fresh one between attempts, so only a
/// room retiring under us on every try can exhaust this.
const MAX_ATTEMPTS: usize = 3;

pub struct RoomRegistry {
    services: RoomServices,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new(services: RoomServices) -> Self {
        Self {
            services,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live room for `room_id`, created if absent.  A retired room still in
    /// the map is replaced.
    pub fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        let mut rooms = self.rooms();
        if let Some(room) = rooms.get(room_id) {
            if !room.is_retired() {
                return room.clone();
            }
        }
        let room = Arc::new(Room::new(room_id, self.services.clone()));
        rooms.insert(room_id.to_string(), room.clone());
        info!(room_id = %room_id, rooms = rooms.len(), "room created");
        room
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms()
            .get(room_id)
            .filter(|room| !room.is_retired())
            .cloned()
    }

    /// Drop `room` from the map if it is retired and still the registered
    /// instance for its name.  Returns whether it was removed.
    pub fn remove_if_empty(&self, room: &Arc<Room>) -> bool {
        if !room.is_retired() {
            return false;
        }
        let mut rooms = self.rooms();
        match rooms.get(room.room_id()) {
            Some(current) if Arc::ptr_eq(current, room) => {
                rooms.remove(room.room_id());
                info!(room_id = %room.room_id(), rooms = rooms.len(), "room removed");
                true
            }
            _ => false,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }

    pub fn participant_count(&self) -> usize {
        self.rooms().values().map(|r| r.participant_count()).sum()
    }

    // ─── Message entry points ──────────────────────────────────────────────

    /// `early` holds the candidates the participant sent for this room
    /// before joining it.
    pub async fn join(
        &self,
        room_id: &str,
        participant_id: &str,
        early: Vec<IceCandidate>,
    ) -> Result<(), SignalingError> {
        for _ in 0..MAX_ATTEMPTS {
            let room = self.get_or_create(room_id);
            match room.join(participant_id, early.clone()).await {
                Err(SignalingError::RoomNotFound { .. }) if room.is_retired() => {
                    debug!(room_id = %room_id, "room retired during join, retrying");
                    self.remove_if_empty(&room);
                }
                outcome => {
                    self.remove_if_empty(&room);
                    return outcome;
                }
            }
        }
        Err(SignalingError::room_not_found(room_id))
    }

    pub async fn receive_offer(
        &self,
        room_id: &str,
        participant_id: &str,
        offer: &str,
    ) -> Result<String, SignalingError> {
        let room = self
            .get(room_id)
            .ok_or_else(|| SignalingError::room_not_found(room_id))?;
        room.receive_offer(participant_id, offer).await
    }

    /// A candidate for a room that is gone is `RoomNotFound`; nothing is
    /// created or kept for it.
    pub async fn receive_candidate(
        &self,
        room_id: &str,
        participant_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let room = self
            .get(room_id)
            .ok_or_else(|| SignalingError::room_not_found(room_id))?;
        room.receive_candidate(participant_id, candidate).await
    }

    /// No-op for unknown rooms and participants.
    pub async fn leave(&self, room_id: &str, participant_id: &str) {
        let Some(room) = self.get(room_id) else {
            debug!(room_id = %room_id, participant_id = %participant_id, "leave for unknown room");
            return;
        };
        if room.leave(participant_id).await {
            self.remove_if_empty(&room);
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
