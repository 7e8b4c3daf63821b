use axum::extract::ws::{Message, WebSocket};
use futures_util::{future, SinkExt, StreamExt};
use tracing::{error, info};

use super::HubState;
use crate::session::{Frame, FrameSink, FrameStream, Identity, Session};
use crate::HubError;

/// Handles WebSocket connections for individual clients
pub struct WebSocketHandler {
    socket: WebSocket,
    state: HubState,
    identity: Identity,
}

impl WebSocketHandler {
    /// Create a new WebSocket handler
    pub fn new(socket: WebSocket, state: HubState, identity: Identity) -> Self {
        Self {
            socket,
            state,
            identity,
        }
    }

    /// Handle the WebSocket connection until the session ends
    pub async fn handle(self) {
        let (ws_sender, ws_receiver) = self.socket.split();

        let reader: FrameStream = Box::pin(ws_receiver.map(|msg| match msg {
            Ok(msg) => Ok(into_frame(msg)),
            Err(e) => Err(HubError::Transport(e.to_string())),
        }));
        let writer: FrameSink = Box::pin(
            ws_sender
                .sink_map_err(|e| HubError::Transport(e.to_string()))
                .with(|frame: Frame| future::ready(Ok::<_, HubError>(into_message(frame)))),
        );

        let session = Session::new(self.identity);
        let session_id = session.id().clone();

        info!(
            "New WebSocket connection established for session {} (user {})",
            session_id,
            session.identity().user_id
        );

        match session.run(self.state.hub().clone(), reader, writer).await {
            Ok(reason) => info!(
                "WebSocket connection for session {} ended ({:?})",
                session_id, reason
            ),
            Err(e) => error!(
                "WebSocket session {} could not start: {}",
                session_id, e
            ),
        }
    }
}

fn into_frame(msg: Message) -> Frame {
    match msg {
        Message::Binary(data) => Frame::Binary(data.to_vec()),
        Message::Text(text) => Frame::Text(text.as_str().to_string()),
        Message::Ping(data) => Frame::Ping(data.to_vec()),
        Message::Pong(data) => Frame::Pong(data.to_vec()),
        Message::Close(_) => Frame::Close,
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close => Message::Close(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_map_to_websocket_messages() {
        for frame in [
            Frame::Binary(vec![1, 2, 3]),
            Frame::Text("hello".to_string()),
            Frame::Ping(vec![9]),
            Frame::Pong(Vec::new()),
            Frame::Close,
        ] {
            assert_eq!(into_frame(into_message(frame.clone())), frame);
        }
    }
}
