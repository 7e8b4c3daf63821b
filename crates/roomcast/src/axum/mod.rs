use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::warn;

pub mod handler;

pub use handler::WebSocketHandler;

use crate::hub::HubHandle;
use crate::session::Identity;

/// Resolves the identity of an incoming connection.
///
/// Authentication happens outside the hub; a provider only reports who an
/// already-authenticated request belongs to.
pub trait IdentityProvider: Send + Sync {
    /// `None` refuses the connection
    fn identify(&self, headers: &HeaderMap) -> Option<Identity>;
}

/// Takes the identity from headers set by a trusted authenticating proxy
#[derive(Debug, Clone)]
pub struct TrustedHeaders {
    user_header: String,
    name_header: String,
}

impl TrustedHeaders {
    pub fn new(user_header: impl Into<String>, name_header: impl Into<String>) -> Self {
        Self {
            user_header: user_header.into(),
            name_header: name_header.into(),
        }
    }
}

impl Default for TrustedHeaders {
    fn default() -> Self {
        Self::new("x-user-id", "x-display-name")
    }
}

impl IdentityProvider for TrustedHeaders {
    fn identify(&self, headers: &HeaderMap) -> Option<Identity> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let user_id = header(&self.user_header)?;
        let display_name = header(&self.name_header).unwrap_or(user_id);
        Some(Identity::new(user_id, display_name))
    }
}

/// Axum state wrapper for the hub
#[derive(Clone)]
pub struct HubState {
    hub: HubHandle,
    identities: Arc<dyn IdentityProvider>,
}

impl HubState {
    /// Create a new hub state
    pub fn new(hub: HubHandle, identities: Arc<dyn IdentityProvider>) -> Self {
        Self { hub, identities }
    }

    /// Get the hub handle
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Get the identity provider
    pub fn identities(&self) -> &Arc<dyn IdentityProvider> {
        &self.identities
    }
}

/// Create a router with the hub's WebSocket endpoint at `/ws`
pub fn router_with_hub(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

/// WebSocket handler endpoint
async fn websocket_handler(
    State(state): State<HubState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(identity) = state.identities.identify(&headers) else {
        warn!("Refusing WebSocket upgrade without an identity");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match ws {
        Ok(ws) => {
            ws.on_upgrade(move |socket| WebSocketHandler::new(socket, state, identity).handle())
        }
        Err(rejection) => rejection.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[test]
    fn test_trusted_headers_identity() {
        let provider = TrustedHeaders::default();
        let identity = provider
            .identify(&headers(&[("x-user-id", "u1"), ("x-display-name", "Ada")]))
            .unwrap();
        assert_eq!(identity, Identity::new("u1", "Ada"));
    }

    #[test]
    fn test_display_name_falls_back_to_user_id() {
        let provider = TrustedHeaders::default();
        let identity = provider.identify(&headers(&[("x-user-id", "u1")])).unwrap();
        assert_eq!(identity.display_name, "u1");
    }

    #[test]
    fn test_missing_or_blank_user_is_refused() {
        let provider = TrustedHeaders::default();
        assert!(provider.identify(&HeaderMap::new()).is_none());
        assert!(provider.identify(&headers(&[("x-user-id", "  ")])).is_none());
    }

    #[test]
    fn test_custom_header_names() {
        let provider = TrustedHeaders::new("x-forwarded-user", "x-forwarded-name");
        assert!(provider.identify(&headers(&[("x-user-id", "u1")])).is_none());

        let identity = provider
            .identify(&headers(&[("x-forwarded-user", "u2")]))
            .unwrap();
        assert_eq!(identity.user_id, "u2");
    }
}
