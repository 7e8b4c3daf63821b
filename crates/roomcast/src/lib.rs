//! # Roomcast - room-partitioned real-time broadcast
//!
//! A hub for chat, notification and collaborative-document traffic between
//! connected clients, with an Axum WebSocket front end.
//!
//! Every room's traffic passes through a single control loop that assigns
//! room-scoped sequence numbers, so all members observe the same order.
//! Document rooms resolve concurrent edits with operational transformation.

pub mod config;
pub mod document;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod protocol;
pub mod session;

#[cfg(feature = "axum")]
pub mod axum;

// Re-exports for convenience
pub use config::HubConfig;
pub use document::{transform, DocumentSnapshot, DocumentState, Edit, Operation};
pub use error::{HubError, HubResult};
pub use hub::{Hub, HubHandle, HubStats, RoomStats};
pub use persistence::{HistoryStore, MemoryHistory};
pub use protocol::{
    ClientMessage, Message, MessageKind, NotificationFilter, Payload, Priority, RejectReason,
    RoomKind, ServerMessage,
};
pub use session::{DisconnectReason, Identity, Session, SessionId};

#[cfg(feature = "axum")]
pub use axum::{router_with_hub, HubState, IdentityProvider, TrustedHeaders, WebSocketHandler};
