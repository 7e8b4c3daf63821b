use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::document::{DocumentState, Operation};
use crate::protocol::{RejectReason, RoomId, RoomKind};

/// Outcome of submitting an edit to a room
#[derive(Debug)]
pub(crate) enum EditOutcome {
    /// The operation as applied, transformed to the version it produced
    Applied(Operation),
    /// The edit was invalid; nothing changed
    Rejected(RejectReason),
    /// Transforming or applying failed unexpectedly; the room is now degraded
    Fault(String),
}

/// Per-room state owned by the hub
#[derive(Debug)]
pub(crate) struct Room {
    pub(crate) id: RoomId,
    pub(crate) kind: RoomKind,
    /// Last sequence number handed out; 0 before the first broadcast
    pub(crate) last_seq: u64,
    pub(crate) document: Option<DocumentState>,
    pub(crate) degraded: bool,
}

impl Room {
    pub(crate) fn new(id: RoomId, kind: RoomKind) -> Self {
        let document = match kind {
            RoomKind::Document => Some(DocumentState::new()),
            RoomKind::Chat => None,
        };
        Self {
            id,
            kind,
            last_seq: 0,
            document,
            degraded: false,
        }
    }

    /// Assign the next room-scoped sequence number
    pub(crate) fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    /// Validate, transform and apply an edit.
    ///
    /// A panic or inconsistency while transforming marks the room degraded
    /// and discards the operation; the document keeps its previous state.
    pub(crate) fn submit_edit(&mut self, op: Operation) -> EditOutcome {
        if self.degraded {
            return EditOutcome::Rejected(RejectReason::RoomDegraded);
        }
        let Some(doc) = self.document.as_mut() else {
            return EditOutcome::Rejected(RejectReason::WrongRoomKind { actual: self.kind });
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let rebased = match doc.rebase(op) {
                Ok(rebased) => rebased,
                Err(reason) => return EditOutcome::Rejected(reason),
            };
            match doc.apply(rebased) {
                Ok(_) => match doc.log().last() {
                    Some(applied) => EditOutcome::Applied(applied.clone()),
                    None => EditOutcome::Fault("operation log empty after apply".to_string()),
                },
                Err(e) => EditOutcome::Fault(e.to_string()),
            }
        }))
        .unwrap_or_else(|panic| EditOutcome::Fault(panic_message(panic.as_ref())));

        if matches!(outcome, EditOutcome::Fault(_)) {
            self.degraded = true;
        }
        outcome
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("transform panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("transform panicked: {}", message)
    } else {
        "transform panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Edit;
    use crate::session::SessionId;

    fn insert(position: usize, content: &str, base: u64) -> Operation {
        Operation::new(
            Edit::Insert {
                position,
                content: content.to_string(),
            },
            SessionId::from("author"),
            base,
        )
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut room = Room::new("general".to_string(), RoomKind::Chat);
        assert_eq!(room.next_seq(), 1);
        assert_eq!(room.next_seq(), 2);
        assert_eq!(room.last_seq, 2);
    }

    #[test]
    fn test_chat_room_rejects_edits() {
        let mut room = Room::new("general".to_string(), RoomKind::Chat);
        assert!(matches!(
            room.submit_edit(insert(0, "x", 0)),
            EditOutcome::Rejected(RejectReason::WrongRoomKind {
                actual: RoomKind::Chat
            })
        ));
        assert!(!room.degraded);
    }

    #[test]
    fn test_applied_edit_reports_transformed_operation() {
        let mut room = Room::new("doc1".to_string(), RoomKind::Document);
        assert!(matches!(
            room.submit_edit(insert(0, "abc", 0)),
            EditOutcome::Applied(_)
        ));

        match room.submit_edit(insert(0, "X", 0)) {
            EditOutcome::Applied(op) => {
                assert_eq!(op.base_version, 1);
                assert_eq!(op.edit.position(), 0);
            }
            other => panic!("Expected applied edit, got: {:?}", other),
        }
        assert_eq!(room.document.as_ref().unwrap().version(), 2);
    }

    #[test]
    fn test_inconsistent_log_degrades_room() {
        let mut room = Room::new("doc1".to_string(), RoomKind::Document);
        room.document = Some(DocumentState::corrupted("abc", 10));

        let outcome = room.submit_edit(insert(8, "x", 1));
        assert!(matches!(outcome, EditOutcome::Fault(_)));
        assert!(room.degraded);

        let doc = room.document.as_ref().unwrap();
        assert_eq!(doc.content(), "abc");
        assert_eq!(doc.version(), 1);

        assert!(matches!(
            room.submit_edit(insert(0, "x", 1)),
            EditOutcome::Rejected(RejectReason::RoomDegraded)
        ));
    }
}
