use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::protocol::RoomId;
use crate::session::SessionId;

/// Result of removing a session from one room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The session was not a member
    NotMember,
    /// The session was removed; `emptied` is set when it was the last member
    Left { emptied: bool },
}

/// Room membership bookkeeping
///
/// Keeps both directions (room to members, session to rooms) so that a
/// disconnect can be processed without scanning every room. Owned by the
/// hub's control loop; nothing else mutates it.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, HashSet<SessionId>>,
    memberships: HashMap<SessionId, HashSet<RoomId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a room, creating the room if needed.
    ///
    /// Returns false if the session was already a member.
    pub fn join(&mut self, room_id: &str, session_id: &SessionId) -> bool {
        let added = self
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(session_id.clone());

        if added {
            self.memberships
                .entry(session_id.clone())
                .or_default()
                .insert(room_id.to_string());
            debug!("Session {} joined room '{}'", session_id, room_id);
        }

        added
    }

    /// Remove a session from a room; an emptied room is removed
    pub fn leave(&mut self, room_id: &str, session_id: &SessionId) -> LeaveOutcome {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return LeaveOutcome::NotMember;
        };
        if !members.remove(session_id) {
            return LeaveOutcome::NotMember;
        }

        let emptied = members.is_empty();
        if emptied {
            self.rooms.remove(room_id);
        }

        if let Some(rooms) = self.memberships.get_mut(session_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                self.memberships.remove(session_id);
            }
        }

        debug!("Session {} left room '{}'", session_id, room_id);
        LeaveOutcome::Left { emptied }
    }

    /// Remove a session from every room it belongs to.
    ///
    /// Returns each affected room with whether it became empty, ordered by room ID.
    pub fn leave_all(&mut self, session_id: &SessionId) -> Vec<(RoomId, bool)> {
        let mut rooms: Vec<RoomId> = self
            .memberships
            .remove(session_id)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();
        rooms.sort();

        rooms
            .into_iter()
            .map(|room_id| {
                let emptied = match self.rooms.get_mut(&room_id) {
                    Some(members) => {
                        members.remove(session_id);
                        members.is_empty()
                    }
                    None => true,
                };
                if emptied {
                    self.rooms.remove(&room_id);
                }
                (room_id, emptied)
            })
            .collect()
    }

    /// Snapshot of a room's members, ordered by session ID
    pub fn members(&self, room_id: &str) -> Vec<SessionId> {
        let mut members: Vec<SessionId> = self
            .rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Rooms a session belongs to, ordered by room ID
    pub fn rooms_of(&self, session_id: &SessionId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .memberships
            .get(session_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn contains(&self, room_id: &str, session_id: &SessionId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|members| members.contains(session_id))
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut registry = RoomRegistry::new();
        assert!(registry.join("general", &sid("a")));
        assert!(!registry.join("general", &sid("a")));

        assert_eq!(registry.members("general"), vec![sid("a")]);
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn test_leave_removes_empty_room() {
        let mut registry = RoomRegistry::new();
        registry.join("general", &sid("a"));
        registry.join("general", &sid("b"));

        assert_eq!(
            registry.leave("general", &sid("a")),
            LeaveOutcome::Left { emptied: false }
        );
        assert_eq!(
            registry.leave("general", &sid("a")),
            LeaveOutcome::NotMember
        );
        assert_eq!(
            registry.leave("general", &sid("b")),
            LeaveOutcome::Left { emptied: true }
        );
        assert!(!registry.has_room("general"));
        assert!(registry.rooms_of(&sid("b")).is_empty());
    }

    #[test]
    fn test_leave_unknown_room() {
        let mut registry = RoomRegistry::new();
        assert_eq!(registry.leave("nowhere", &sid("a")), LeaveOutcome::NotMember);
    }

    #[test]
    fn test_leave_all() {
        let mut registry = RoomRegistry::new();
        registry.join("general", &sid("a"));
        registry.join("general", &sid("b"));
        registry.join("doc1", &sid("a"));

        let left = registry.leave_all(&sid("a"));
        assert_eq!(
            left,
            vec![("doc1".to_string(), true), ("general".to_string(), false)]
        );
        assert!(!registry.contains("general", &sid("a")));
        assert!(registry.contains("general", &sid("b")));
        assert!(!registry.has_room("doc1"));

        assert!(registry.leave_all(&sid("a")).is_empty());
    }

    #[test]
    fn test_membership_is_consistent_both_ways() {
        let mut registry = RoomRegistry::new();
        registry.join("r1", &sid("a"));
        registry.join("r2", &sid("a"));
        registry.join("r2", &sid("b"));

        for session in [sid("a"), sid("b")] {
            for room in registry.rooms_of(&session) {
                assert!(registry.members(&room).contains(&session));
            }
        }
        assert_eq!(
            registry.rooms_of(&sid("a")),
            vec!["r1".to_string(), "r2".to_string()]
        );
    }
}
