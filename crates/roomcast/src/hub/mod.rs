//! The hub: a single control loop that owns every room, document and
//! session record.
//!
//! Sessions reach the hub only through its intake channel. Because the loop
//! handles one command at a time, every member of a room sees that room's
//! messages in the same sequence-number order, and no locks guard the
//! registry or document state.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub mod registry;
mod room;

pub use registry::{LeaveOutcome, RoomRegistry};

use self::room::{EditOutcome, Room};
use crate::config::HubConfig;
use crate::document::{DocumentSnapshot, Edit, Operation};
use crate::persistence::HistoryStore;
use crate::protocol::{
    ClientMessage, Message, MessageKind, NotificationFilter, Payload, RejectReason, RoomId,
    RoomKind, ServerMessage,
};
use crate::session::{
    Delivery, DisconnectReason, FrameSink, FrameStream, Identity, Outbox, Session, SessionId,
};
use crate::{HubError, HubResult};

/// Commands consumed by the control loop
#[derive(Debug)]
enum Command {
    Register {
        session_id: SessionId,
        identity: Identity,
        outbox: Outbox,
        reply: oneshot::Sender<HubResult<()>>,
    },
    Client {
        session_id: SessionId,
        message: ClientMessage,
    },
    Heartbeat {
        session_id: SessionId,
    },
    Disconnect {
        session_id: SessionId,
        reason: DisconnectReason,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Document {
        room_id: RoomId,
        reply: oneshot::Sender<Option<DocumentSnapshot>>,
    },
    Shutdown,
}

/// Point-in-time view of the hub
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub rooms: BTreeMap<RoomId, RoomStats>,
    /// Emptied rooms whose state is kept for a rejoin
    pub dormant_rooms: usize,
}

/// Point-in-time view of one active room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub kind: RoomKind,
    pub members: Vec<SessionId>,
    pub last_seq: u64,
    /// Document version, for document rooms
    pub version: Option<u64>,
    pub degraded: bool,
}

/// Hub-side record of a registered session
struct SessionEntry {
    identity: Identity,
    outbox: Outbox,
    deadline: Instant,
    filter: NotificationFilter,
    read_markers: HashMap<RoomId, u64>,
    /// Set once the session is scheduled for removal; nothing more is enqueued
    closing: bool,
}

/// Cloneable handle used to talk to a running hub
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
    config: Arc<HubConfig>,
}

impl HubHandle {
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Start a session for an authenticated identity on the given transport
    pub fn connect(
        &self,
        identity: Identity,
        reader: FrameStream,
        writer: FrameSink,
    ) -> JoinHandle<HubResult<DisconnectReason>> {
        self.spawn_session(Session::new(identity), reader, writer)
    }

    /// Run an already constructed session on its own task
    pub fn spawn_session(
        &self,
        session: Session,
        reader: FrameStream,
        writer: FrameSink,
    ) -> JoinHandle<HubResult<DisconnectReason>> {
        tokio::spawn(session.run(self.clone(), reader, writer))
    }

    pub(crate) async fn register(
        &self,
        session_id: SessionId,
        identity: Identity,
        outbox: Outbox,
    ) -> HubResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Register {
                session_id,
                identity,
                outbox,
                reply,
            })
            .await?;
        rx.await?
    }

    /// Hand a client message to the control loop on behalf of a session
    pub async fn submit(&self, session_id: SessionId, message: ClientMessage) -> HubResult<()> {
        self.tx
            .send(Command::Client {
                session_id,
                message,
            })
            .await?;
        Ok(())
    }

    /// Report a liveness response from a session
    pub async fn heartbeat(&self, session_id: SessionId) -> HubResult<()> {
        self.tx.send(Command::Heartbeat { session_id }).await?;
        Ok(())
    }

    /// Remove a session from every room; a no-op for unknown sessions
    pub async fn disconnect(
        &self,
        session_id: SessionId,
        reason: DisconnectReason,
    ) -> HubResult<()> {
        self.tx
            .send(Command::Disconnect { session_id, reason })
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> HubResult<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Stats { reply }).await?;
        Ok(rx.await?)
    }

    /// Current snapshot of a document room, active or dormant
    pub async fn document(&self, room_id: &str) -> HubResult<Option<DocumentSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Document {
                room_id: room_id.to_string(),
                reply,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Stop the control loop and close every session's queue
    pub async fn shutdown(&self) -> HubResult<()> {
        self.tx.send(Command::Shutdown).await?;
        Ok(())
    }
}

/// The control loop and all state it owns
pub struct Hub {
    config: Arc<HubConfig>,
    intake: mpsc::Receiver<Command>,
    registry: RoomRegistry,
    sessions: HashMap<SessionId, SessionEntry>,
    rooms: HashMap<RoomId, Room>,
    /// Emptied rooms and the instant their state expires
    dormant: HashMap<RoomId, (Room, Instant)>,
    history: Option<Arc<dyn HistoryStore>>,
    /// Sessions to remove once the current command is fully handled
    pending_drops: VecDeque<(SessionId, DisconnectReason)>,
}

impl Hub {
    /// Create a hub and the handle used to reach it
    pub fn new(config: HubConfig, history: Option<Arc<dyn HistoryStore>>) -> (Self, HubHandle) {
        let config = Arc::new(config);
        let (tx, intake) = mpsc::channel(config.intake_capacity);

        let hub = Self {
            config: config.clone(),
            intake,
            registry: RoomRegistry::new(),
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            dormant: HashMap::new(),
            history,
            pending_drops: VecDeque::new(),
        };

        (hub, HubHandle { tx, config })
    }

    /// Create a hub and run its control loop on a new task
    pub fn spawn(
        config: HubConfig,
        history: Option<Arc<dyn HistoryStore>>,
    ) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config, history);
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Run until shut down or until every handle is dropped
    pub async fn run(mut self) {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Hub control loop started");

        loop {
            tokio::select! {
                command = self.intake.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = ticker.tick() => self.on_tick(),
            }
            self.flush_drops();
        }

        let sessions = self.sessions.len();
        self.sessions.clear();
        info!("Hub control loop stopped, closed {} sessions", sessions);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                session_id,
                identity,
                outbox,
                reply,
            } => {
                let _ = reply.send(self.on_register(session_id, identity, outbox));
            }
            Command::Client {
                session_id,
                message,
            } => self.on_client_message(session_id, message),
            Command::Heartbeat { session_id } => {
                let deadline = Instant::now() + self.config.liveness_timeout();
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    entry.deadline = deadline;
                }
            }
            Command::Disconnect { session_id, reason } => {
                self.remove_session(&session_id, reason);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Document { room_id, reply } => {
                let snapshot = self
                    .rooms
                    .get(&room_id)
                    .or_else(|| self.dormant.get(&room_id).map(|(room, _)| room))
                    .and_then(|room| room.document.as_ref())
                    .map(|doc| doc.snapshot());
                let _ = reply.send(snapshot);
            }
            Command::Shutdown => {}
        }
    }

    /// Record a new session; an ID already in use is refused without touching its owner
    fn on_register(
        &mut self,
        session_id: SessionId,
        identity: Identity,
        outbox: Outbox,
    ) -> HubResult<()> {
        if self.sessions.contains_key(&session_id) {
            warn!(
                "Refusing duplicate registration of session {}",
                session_id
            );
            return Err(HubError::DuplicateSession(session_id.to_string()));
        }

        let welcome = Arc::new(ServerMessage::Welcome {
            session_id: session_id.clone(),
            identity: identity.clone(),
        });

        info!(
            "Registered session {} for user {}",
            session_id, identity.user_id
        );

        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                identity,
                outbox,
                deadline: Instant::now() + self.config.liveness_timeout(),
                filter: NotificationFilter::default(),
                read_markers: HashMap::new(),
                closing: false,
            },
        );
        self.deliver(&session_id, welcome);
        Ok(())
    }

    fn on_client_message(&mut self, session_id: SessionId, message: ClientMessage) {
        match self.sessions.get(&session_id) {
            Some(entry) if !entry.closing => {}
            _ => {
                debug!(
                    "Ignoring message from unregistered session {}",
                    session_id
                );
                return;
            }
        }

        match message {
            ClientMessage::Join { room_id, kind } => self.on_join(session_id, room_id, kind),
            ClientMessage::Leave { room_id } => self.on_leave(session_id, room_id),
            ClientMessage::Chat { room_id, text } => {
                self.on_post(session_id, room_id, MessageKind::Chat, Payload::Text(text))
            }
            ClientMessage::Notify {
                room_id,
                text,
                priority,
            } => self.on_post(
                session_id,
                room_id,
                MessageKind::Notification,
                Payload::Notice { text, priority },
            ),
            ClientMessage::Edit {
                room_id,
                edit,
                base_version,
            } => self.on_edit(session_id, room_id, edit, base_version),
            ClientMessage::SetFilter { filter } => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    debug!("Session {} set filter {:?}", session_id, filter);
                    entry.filter = filter;
                }
                self.ack(&session_id, "set_filter");
            }
            ClientMessage::MarkRead { room_id, seq } => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    let marker = entry.read_markers.entry(room_id).or_insert(0);
                    *marker = (*marker).max(seq);
                }
                self.ack(&session_id, "mark_read");
            }
            ClientMessage::Disconnect => {
                self.remove_session(&session_id, DisconnectReason::Requested);
            }
        }
    }

    fn on_join(&mut self, session_id: SessionId, room_id: RoomId, kind: RoomKind) {
        let existing_kind = self
            .rooms
            .get(&room_id)
            .or_else(|| self.dormant.get(&room_id).map(|(room, _)| room))
            .map(|room| room.kind);
        if let Some(actual) = existing_kind {
            if actual != kind {
                self.reject(
                    &session_id,
                    Some(room_id),
                    RejectReason::WrongRoomKind { actual },
                );
                return;
            }
        }

        if !self.rooms.contains_key(&room_id) {
            let room = match self.dormant.remove(&room_id) {
                Some((room, _)) => {
                    info!("Restoring dormant room '{}'", room_id);
                    room
                }
                None => self.create_room(&room_id, kind),
            };
            self.rooms.insert(room_id.clone(), room);
        }

        let added = self.registry.join(&room_id, &session_id);

        // The joining session gets its starting state before any broadcast
        let initial = match self.rooms.get(&room_id) {
            Some(Room {
                document: Some(doc),
                last_seq,
                ..
            }) => Some(ServerMessage::Snapshot {
                room_id: room_id.clone(),
                content: doc.content().to_string(),
                version: doc.version(),
                seq: *last_seq,
            }),
            _ => self.history_for(&session_id, &room_id).map(|messages| {
                ServerMessage::History {
                    room_id: room_id.clone(),
                    messages,
                }
            }),
        };
        if let Some(initial) = initial {
            self.deliver(&session_id, Arc::new(initial));
        }

        if added {
            if let Some(identity) = self.sessions.get(&session_id).map(|e| e.identity.clone()) {
                self.broadcast(
                    &room_id,
                    MessageKind::Join,
                    session_id,
                    Payload::Presence(identity),
                );
            }
        }
    }

    fn create_room(&self, room_id: &str, kind: RoomKind) -> Room {
        let mut room = Room::new(room_id.to_string(), kind);

        // Continue numbering after persisted history so seqs never repeat
        if kind == RoomKind::Chat {
            if let Some(history) = &self.history {
                match history.load(room_id, 1) {
                    Ok(messages) => {
                        room.last_seq = messages.last().map_or(0, |m| m.seq);
                    }
                    Err(e) => warn!("Failed to load history for room '{}': {}", room_id, e),
                }
            }
        }

        info!("Created {:?} room '{}'", kind, room.id);
        room
    }

    /// History to replay to a session joining a chat room, after its filter
    fn history_for(&self, session_id: &SessionId, room_id: &str) -> Option<Vec<Message>> {
        let history = self.history.as_ref()?;
        let entry = self.sessions.get(session_id)?;

        let messages = match history.load(room_id, self.config.history_replay_limit) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to load history for room '{}': {}", room_id, e);
                Vec::new()
            }
        };
        let last_read = entry.read_markers.get(room_id).copied();

        Some(
            messages
                .into_iter()
                .filter(|message| entry.filter.accepts(message, last_read))
                .collect(),
        )
    }

    fn on_leave(&mut self, session_id: SessionId, room_id: RoomId) {
        match self.registry.leave(&room_id, &session_id) {
            LeaveOutcome::NotMember => {
                let reason = if self.registry.has_room(&room_id) {
                    RejectReason::NotAMember
                } else {
                    RejectReason::UnknownRoom
                };
                self.reject(&session_id, Some(room_id), reason);
            }
            LeaveOutcome::Left { emptied } => {
                self.after_leave(&session_id, &room_id, emptied);
            }
        }
    }

    fn after_leave(&mut self, session_id: &SessionId, room_id: &str, emptied: bool) {
        if emptied {
            self.retire_room(room_id);
            return;
        }

        let identity = self.sessions.get(session_id).map(|e| e.identity.clone());
        if let Some(identity) = identity {
            self.broadcast(
                room_id,
                MessageKind::Leave,
                session_id.clone(),
                Payload::Presence(identity),
            );
        }
    }

    fn on_post(&mut self, session_id: SessionId, room_id: RoomId, kind: MessageKind, payload: Payload) {
        if !self.rooms.contains_key(&room_id) {
            self.reject(&session_id, Some(room_id), RejectReason::UnknownRoom);
            return;
        }
        if !self.registry.contains(&room_id, &session_id) {
            self.reject(&session_id, Some(room_id), RejectReason::NotAMember);
            return;
        }

        self.broadcast(&room_id, kind, session_id, payload);
    }

    fn on_edit(&mut self, session_id: SessionId, room_id: RoomId, edit: Edit, base_version: u64) {
        if !self.rooms.contains_key(&room_id) {
            self.reject(&session_id, Some(room_id), RejectReason::UnknownRoom);
            return;
        }
        if !self.registry.contains(&room_id, &session_id) {
            self.reject(&session_id, Some(room_id), RejectReason::NotAMember);
            return;
        }

        let op = Operation::new(edit, session_id.clone(), base_version);
        let outcome = match self.rooms.get_mut(&room_id) {
            Some(room) => room.submit_edit(op),
            None => return,
        };

        match outcome {
            EditOutcome::Applied(op) => {
                debug!(
                    "Applied edit from {} to room '{}' at version {}",
                    session_id,
                    room_id,
                    op.base_version + 1
                );
                self.broadcast(&room_id, MessageKind::Edit, session_id, Payload::Edit(op));
            }
            EditOutcome::Rejected(reason) => {
                self.reject(&session_id, Some(room_id), reason);
            }
            EditOutcome::Fault(detail) => {
                error!("Room '{}' degraded: {}", room_id, detail);
                self.reject(&session_id, Some(room_id.clone()), RejectReason::RoomDegraded);
                self.broadcast(
                    &room_id,
                    MessageKind::System,
                    session_id,
                    Payload::Text("document editing suspended after an internal error".to_string()),
                );
            }
        }
    }

    /// Sequence a message and enqueue it to every member whose filter accepts it.
    ///
    /// Returns the assigned sequence number, or `None` if the message was dropped.
    fn broadcast(
        &mut self,
        room_id: &str,
        kind: MessageKind,
        author: SessionId,
        payload: Payload,
    ) -> Option<u64> {
        let members = self.registry.members(room_id);
        if members.is_empty() {
            warn!(
                "Dropping {:?} message for room '{}': no registered members",
                kind, room_id
            );
            return None;
        }
        let Some(room) = self.rooms.get_mut(room_id) else {
            warn!(
                "Dropping {:?} message for room '{}': room not found",
                kind, room_id
            );
            return None;
        };

        let message = Message {
            kind,
            room_id: room_id.to_string(),
            author,
            payload,
            timestamp: Utc::now(),
            seq: room.next_seq(),
        };
        let seq = message.seq;

        if matches!(kind, MessageKind::Chat | MessageKind::Notification) {
            if let Some(history) = &self.history {
                if let Err(e) = history.append(room_id, &message) {
                    warn!("Failed to append to history of room '{}': {}", room_id, e);
                }
            }
        }

        let targets: Vec<SessionId> = members
            .into_iter()
            .filter(|member| match self.sessions.get(member) {
                Some(entry) => {
                    !entry.closing
                        && entry
                            .filter
                            .accepts(&message, entry.read_markers.get(room_id).copied())
                }
                None => {
                    warn!(
                        "Room '{}' lists unknown session {}, skipping",
                        room_id, member
                    );
                    false
                }
            })
            .collect();

        let envelope = Arc::new(ServerMessage::Message(message));
        for target in &targets {
            self.deliver(target, envelope.clone());
        }

        debug!(
            "Broadcast {:?} #{} in room '{}' to {} sessions",
            kind,
            seq,
            room_id,
            targets.len()
        );
        Some(seq)
    }

    /// Enqueue to one session; a refused enqueue schedules the session's removal
    fn deliver(&mut self, session_id: &SessionId, message: Arc<ServerMessage>) {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            debug!("Not delivering to unknown session {}", session_id);
            return;
        };
        if entry.closing {
            return;
        }

        let reason = match entry.outbox.send(message) {
            Delivery::Delivered => return,
            Delivery::Full => {
                warn!(
                    "Dropping session {}: outbound queue of {} overflowed",
                    session_id,
                    entry.outbox.capacity()
                );
                DisconnectReason::QueueOverflow
            }
            Delivery::Closed => {
                debug!(
                    "Dropping session {}: its pumps already stopped",
                    session_id
                );
                DisconnectReason::ClientClosed
            }
        };
        entry.closing = true;
        self.pending_drops.push_back((session_id.clone(), reason));
    }

    fn reject(&mut self, session_id: &SessionId, room_id: Option<RoomId>, reason: RejectReason) {
        debug!(
            "Rejected request from {} in room {:?}: {}",
            session_id, room_id, reason
        );
        self.deliver(
            session_id,
            Arc::new(ServerMessage::Rejected { room_id, reason }),
        );
    }

    fn ack(&mut self, session_id: &SessionId, request: &str) {
        self.deliver(
            session_id,
            Arc::new(ServerMessage::Ack {
                request: request.to_string(),
            }),
        );
    }

    /// Remove every session scheduled during this iteration, including any
    /// scheduled while broadcasting their departures
    fn flush_drops(&mut self) {
        while let Some((session_id, reason)) = self.pending_drops.pop_front() {
            self.remove_session(&session_id, reason);
        }
    }

    /// Close a session's queue and take it out of every room
    fn remove_session(&mut self, session_id: &SessionId, reason: DisconnectReason) {
        let Some(entry) = self.sessions.remove(session_id) else {
            return;
        };
        // Dropping the outbox closes the queue and ends the write pump
        let SessionEntry { identity, .. } = entry;

        let rooms = self.registry.rooms_of(session_id);
        if !rooms.is_empty() {
            debug!("Session {} leaving rooms {:?}", session_id, rooms);
        }
        for (room_id, emptied) in self.registry.leave_all(session_id) {
            if emptied {
                self.retire_room(&room_id);
            } else {
                self.broadcast(
                    &room_id,
                    MessageKind::Leave,
                    session_id.clone(),
                    Payload::Presence(identity.clone()),
                );
            }
        }

        info!(
            "Unregistered session {} for user {} ({:?}), {} rooms active",
            session_id,
            identity.user_id,
            reason,
            self.registry.room_count()
        );
    }

    /// Move an emptied room to the dormant set, or discard it without retention
    fn retire_room(&mut self, room_id: &str) {
        let Some(room) = self.rooms.remove(room_id) else {
            return;
        };

        let retention = self.config.room_retention();
        if retention.is_zero() {
            info!("Discarded empty room '{}'", room_id);
        } else {
            info!(
                "Room '{}' is empty, keeping its state for {:?}",
                room_id, retention
            );
            self.dormant
                .insert(room_id.to_string(), (room, Instant::now() + retention));
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, entry)| !entry.closing && entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in expired {
            warn!("Session {} missed its liveness deadline", session_id);
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                entry.closing = true;
            }
            self.pending_drops
                .push_back((session_id, DisconnectReason::LivenessTimeout));
        }

        self.dormant.retain(|room_id, (_, expires)| {
            let keep = *expires > now;
            if !keep {
                info!("Discarding dormant room '{}'", room_id);
            }
            keep
        });
    }

    fn stats(&self) -> HubStats {
        let rooms = self
            .rooms
            .iter()
            .map(|(room_id, room)| {
                (
                    room_id.clone(),
                    RoomStats {
                        kind: room.kind,
                        members: self.registry.members(room_id),
                        last_seq: room.last_seq,
                        version: room.document.as_ref().map(|doc| doc.version()),
                        degraded: room.degraded,
                    },
                )
            })
            .collect();

        HubStats {
            sessions: self.sessions.len(),
            rooms,
            dormant_rooms: self.dormant.len(),
        }
    }
}
