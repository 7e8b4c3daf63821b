//! Transport boundary for client sessions.
//!
//! A session only sees a stream of inbound [`Frame`]s and a sink for outbound
//! ones. The axum adapter and the in-memory duplex below both produce that pair.

use futures_util::{sink, stream, Sink, Stream};
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::protocol::{decode_message, encode_message, ClientMessage, ServerMessage};
use crate::{HubError, HubResult};

/// One frame of a duplex message transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An encoded protocol message
    Binary(Vec<u8>),
    /// Text frames are not part of the protocol and are ignored
    Text(String),
    /// Liveness ping
    Ping(Vec<u8>),
    /// Liveness response
    Pong(Vec<u8>),
    Close,
}

/// Inbound half of a transport
pub type FrameStream = Pin<Box<dyn Stream<Item = HubResult<Frame>> + Send>>;

/// Outbound half of a transport
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = HubError> + Send>>;

/// Create an in-memory transport.
///
/// Returns the server half, to hand to a session, and the client half used to
/// drive it. `capacity` bounds each direction; a client that stops reading
/// eventually stalls the session's write pump like a congested socket would.
pub fn memory(capacity: usize) -> (FrameStream, FrameSink, MemoryClient) {
    let (to_server, inbound) = mpsc::channel::<HubResult<Frame>>(capacity);
    let (outbound, from_server) = mpsc::channel::<Frame>(capacity);

    let reader: FrameStream = Box::pin(stream::unfold(inbound, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    let writer: FrameSink = Box::pin(sink::unfold(outbound, |tx, frame: Frame| async move {
        tx.send(frame)
            .await
            .map_err(|_| HubError::Transport("memory peer closed".to_string()))?;
        Ok::<_, HubError>(tx)
    }));

    (
        reader,
        writer,
        MemoryClient {
            to_server,
            from_server,
        },
    )
}

/// Client end of an in-memory transport
pub struct MemoryClient {
    to_server: mpsc::Sender<HubResult<Frame>>,
    from_server: mpsc::Receiver<Frame>,
}

impl MemoryClient {
    /// Encode and send a protocol message
    pub async fn send(&self, message: &ClientMessage) -> HubResult<()> {
        self.send_frame(Frame::Binary(encode_message(message)?))
            .await
    }

    /// Send a raw frame
    pub async fn send_frame(&self, frame: Frame) -> HubResult<()> {
        self.to_server
            .send(Ok(frame))
            .await
            .map_err(|_| HubError::Transport("memory session closed".to_string()))
    }

    /// Inject a transport failure into the session's read pump
    pub async fn fail(&self, reason: &str) -> HubResult<()> {
        self.to_server
            .send(Err(HubError::Transport(reason.to_string())))
            .await
            .map_err(|_| HubError::Transport("memory session closed".to_string()))
    }

    /// Receive the next raw frame, `None` once the session is gone
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.from_server.recv().await
    }

    /// Receive the next protocol message, answering pings along the way.
    ///
    /// Returns `None` when the session closed its end.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.from_server.recv().await? {
                Frame::Binary(data) => match decode_message(&data) {
                    Ok(message) => return Some(message),
                    Err(e) => {
                        tracing::warn!("Memory client could not decode frame: {}", e);
                    }
                },
                Frame::Ping(payload) => {
                    let _ = self.send_frame(Frame::Pong(payload)).await;
                }
                Frame::Close => return None,
                Frame::Text(_) | Frame::Pong(_) => {}
            }
        }
    }
}
