use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use roomcast::{
    DocumentSnapshot, Hub, HubConfig, HubHandle, HubState, HubStats, MemoryHistory,
    TrustedHeaders,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// REST API handlers
async fn get_stats(State(hub): State<HubHandle>) -> Result<Json<HubStats>, StatusCode> {
    let stats = hub
        .stats()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(stats))
}

async fn get_document(
    State(hub): State<HubHandle>,
    Path(room_id): Path<String>,
) -> Result<Json<DocumentSnapshot>, StatusCode> {
    let snapshot = hub
        .document(&room_id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(snapshot))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,chat_server=debug,info".into()),
        )
        .init();

    info!("Starting chat server...");

    let config = HubConfig::from_env().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        HubConfig::default()
    });

    let history = Arc::new(MemoryHistory::new(500));
    let (hub, hub_task) = Hub::spawn(config, Some(history));

    let state = HubState::new(hub.clone(), Arc::new(TrustedHeaders::default()));

    let app = Router::new()
        .route("/stats", get(get_stats))
        .route("/documents/{room_id}", get(get_document))
        .with_state(hub.clone())
        .merge(roomcast::router_with_hub(state));

    let listener = TcpListener::bind("127.0.0.1:3001").await?;
    info!("Server running on http://127.0.0.1:3001");
    info!("WebSocket endpoint available at ws://127.0.0.1:3001/ws");
    info!("  Identity is read from the x-user-id and x-display-name headers");
    info!("API endpoints:");
    info!("  GET    /stats               - Hub statistics");
    info!("  GET    /documents/:room_id  - Current document snapshot");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    hub.shutdown().await?;
    hub_task.await?;

    Ok(())
}
