//! History boundary for chat and notification rooms.
//!
//! The hub appends every sequenced chat or notification message and replays
//! recent history to sessions joining a chat room. Storage engines live
//! outside this crate; [`MemoryHistory`] keeps a bounded window per room.

use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::debug;

use crate::protocol::{Message, RoomId};
use crate::HubResult;

/// Room history collaborator
///
/// Called from the hub's control loop, so implementations should return
/// quickly and hand slow work off to their own tasks.
pub trait HistoryStore: Send + Sync {
    /// Record a sequenced message for `room_id`
    fn append(&self, room_id: &str, message: &Message) -> HubResult<()>;

    /// The most recent `limit` messages of a room, oldest first
    fn load(&self, room_id: &str, limit: usize) -> HubResult<Vec<Message>>;
}

/// In-memory history keeping the last `capacity` messages of each room
pub struct MemoryHistory {
    rooms: DashMap<RoomId, VecDeque<Message>>,
    capacity: usize,
}

impl MemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity,
        }
    }

    /// Number of messages retained for a room
    pub fn len(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |entry| entry.len())
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(200)
    }
}

impl HistoryStore for MemoryHistory {
    fn append(&self, room_id: &str, message: &Message) -> HubResult<()> {
        if self.capacity == 0 {
            return Ok(());
        }

        let mut entry = self.rooms.entry(room_id.to_string()).or_default();
        if entry.len() == self.capacity {
            entry.pop_front();
        }
        entry.push_back(message.clone());

        debug!(
            "Appended message {} to history of room '{}'",
            message.seq, room_id
        );
        Ok(())
    }

    fn load(&self, room_id: &str, limit: usize) -> HubResult<Vec<Message>> {
        Ok(self
            .rooms
            .get(room_id)
            .map(|entry| {
                let skip = entry.len().saturating_sub(limit);
                entry.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }
}
