//! Client sessions: one per connected participant.
//!
//! A session registers with the hub, then runs two pumps until either one
//! ends. The read pump decodes inbound frames and forwards them to the hub;
//! the write pump drains the bounded outbound queue and sends liveness pings.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod transport;

pub use transport::{Frame, FrameSink, FrameStream, MemoryClient};

use crate::hub::HubHandle;
use crate::protocol::{decode_message, encode_message, ClientMessage, ServerMessage};
use crate::HubResult;

/// Opaque identifier of a session
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Verified participant identity supplied by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Identity established, not yet registered with the hub
    Connecting,
    /// Registered; both pumps running
    Active,
    /// Shutting down; nothing more is accepted into the outbound queue
    Closing,
    /// Transport released and removed from every room
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the transport
    ClientClosed,
    /// Reading from or writing to the transport failed
    TransportError,
    /// An inbound frame could not be decoded
    MalformedFrame,
    /// The client asked to disconnect
    Requested,
    /// The outbound queue was full when the hub tried to enqueue
    QueueOverflow,
    /// No liveness response arrived before the deadline
    LivenessTimeout,
    /// The hub closed the outbound queue
    DroppedByHub,
    /// The hub stopped running
    HubShutdown,
}

/// Result of enqueueing into a session's outbound queue
///
/// Anything but `Delivered` means the session must be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The consumer fell behind
    Full,
    /// The write pump is gone
    Closed,
}

/// Producer end of a session's bounded outbound queue, held by the hub
///
/// Dropping the outbox closes the queue, which ends the write pump.
#[derive(Debug)]
pub struct Outbox {
    session_id: SessionId,
    tx: mpsc::Sender<Arc<ServerMessage>>,
}

impl Outbox {
    /// Create a queue of fixed `capacity` for `session_id`
    pub fn channel(
        session_id: SessionId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<ServerMessage>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { session_id, tx }, rx)
    }

    /// Enqueue without waiting
    pub fn send(&self, message: Arc<ServerMessage>) -> Delivery {
        match self.tx.try_send(message) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full for session {}", self.session_id);
                Delivery::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound queue closed for session {}", self.session_id);
                Delivery::Closed
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Server-side representative of one connected participant
pub struct Session {
    id: SessionId,
    identity: Identity,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// Create a session for an authenticated identity
    pub fn new(identity: Identity) -> Self {
        Self::with_id(SessionId::new(), identity)
    }

    /// Create a session with a caller-chosen ID
    pub fn with_id(id: SessionId, identity: Identity) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id,
            identity,
            state,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Register with the hub and pump frames until the session ends
    pub async fn run(
        self,
        hub: HubHandle,
        reader: FrameStream,
        writer: FrameSink,
    ) -> HubResult<DisconnectReason> {
        let (outbox, rx) = Outbox::channel(self.id.clone(), hub.config().outbound_capacity);

        if let Err(e) = hub
            .register(self.id.clone(), self.identity.clone(), outbox)
            .await
        {
            self.state.send_replace(SessionState::Closed);
            return Err(e);
        }
        self.state.send_replace(SessionState::Active);

        info!(
            "Session {} active for user {}",
            self.id, self.identity.user_id
        );

        let mut sender_task = tokio::spawn(write_pump(
            self.id.clone(),
            rx,
            writer,
            hub.config().ping_interval(),
            hub.config().liveness_timeout(),
        ));
        let mut receiver_task = tokio::spawn(read_pump(self.id.clone(), reader, hub.clone()));

        // Whichever pump ends first decides why the session closes
        let reason = tokio::select! {
            result = &mut sender_task => result.unwrap_or(DisconnectReason::TransportError),
            result = &mut receiver_task => result.unwrap_or(DisconnectReason::TransportError),
        };

        self.state.send_replace(SessionState::Closing);
        info!("Session {} closing ({:?})", self.id, reason);

        sender_task.abort();
        receiver_task.abort();

        if hub.disconnect(self.id.clone(), reason).await.is_err() {
            debug!("Hub already stopped while closing session {}", self.id);
        }

        self.state.send_replace(SessionState::Closed);
        info!("Session {} closed", self.id);

        Ok(reason)
    }
}

async fn read_pump(
    session_id: SessionId,
    mut reader: FrameStream,
    hub: HubHandle,
) -> DisconnectReason {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Frame::Binary(data)) => match decode_message::<ClientMessage>(&data) {
                Ok(ClientMessage::Disconnect) => {
                    info!("Session {} requested disconnect", session_id);
                    return DisconnectReason::Requested;
                }
                Ok(message) => {
                    if hub.submit(session_id.clone(), message).await.is_err() {
                        return DisconnectReason::HubShutdown;
                    }
                }
                Err(e) => {
                    warn!("Malformed frame from session {}: {}", session_id, e);
                    return DisconnectReason::MalformedFrame;
                }
            },
            Ok(Frame::Text(text)) => {
                warn!(
                    "Received unexpected text message from session {}: {}",
                    session_id, text
                );
            }
            Ok(Frame::Pong(_)) => {
                debug!("Received pong from session {}", session_id);
                if hub.heartbeat(session_id.clone()).await.is_err() {
                    return DisconnectReason::HubShutdown;
                }
            }
            Ok(Frame::Ping(_)) => {
                debug!("Received ping from session {}", session_id);
            }
            Ok(Frame::Close) => {
                info!("Session {} closed connection normally", session_id);
                return DisconnectReason::ClientClosed;
            }
            Err(e) => {
                warn!("Transport error for session {}: {}", session_id, e);
                return DisconnectReason::TransportError;
            }
        }
    }

    debug!("Inbound stream ended for session {}", session_id);
    DisconnectReason::ClientClosed
}

async fn write_pump(
    session_id: SessionId,
    mut rx: mpsc::Receiver<Arc<ServerMessage>>,
    mut writer: FrameSink,
    ping_interval: Duration,
    write_timeout: Duration,
) -> DisconnectReason {
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => match encode_message(message.as_ref()) {
                    Ok(encoded) => {
                        match timeout(write_timeout, writer.send(Frame::Binary(encoded))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                error!("Failed to send message to session {}: {}", session_id, e);
                                return DisconnectReason::TransportError;
                            }
                            Err(_) => {
                                warn!(
                                    "Write to session {} stalled for {:?}",
                                    session_id, write_timeout
                                );
                                return DisconnectReason::TransportError;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Failed to encode message for session {}: {}", session_id, e);
                    }
                },
                None => {
                    debug!("Outbound queue closed for session {}", session_id);
                    let _ = timeout(write_timeout, writer.send(Frame::Close)).await;
                    return DisconnectReason::DroppedByHub;
                }
            },
            _ = ping.tick() => {
                match timeout(write_timeout, writer.send(Frame::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Failed to ping session {}: {}", session_id, e);
                        return DisconnectReason::TransportError;
                    }
                    Err(_) => {
                        warn!(
                            "Ping to session {} stalled for {:?}",
                            session_id, write_timeout
                        );
                        return DisconnectReason::TransportError;
                    }
                }
            }
        }
    }
}
