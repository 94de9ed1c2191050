mod config;
mod error;
mod player;
mod problem;
mod registry;
mod room;
mod scoring;
mod session;
mod types;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::registry::{normalize_code, Registry};
use crate::session::Session;
use crate::types::{ClientMsg, ServerMsg};

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
}

// ─── Routes ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": state.registry.room_count(),
    }))
}

async fn room_snapshot(Path(code): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    let handle = normalize_code(&code).and_then(|code| state.registry.get(&code));
    let Some(handle) = handle else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match handle.snapshot().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut inbox) = mpsc::channel::<ServerMsg>(session::OUTBOX_CAPACITY);

    let mut session = Session::new(state.registry.clone(), outbox);
    let connection_id = session.connection_id().to_string();
    tracing::info!(connection = %connection_id, "WebSocket connected");

    // Drain this connection's outbox into the socket
    let writer = tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode message");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
    });

    // Process incoming messages
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientMsg>(&text) {
            Ok(client_msg) => session.handle(client_msg),
            Err(e) => tracing::warn!(connection = %connection_id, error = %e, "invalid message"),
        }
    }

    // Socket disconnected
    session.disconnect();
    drop(session);
    writer.abort();
}

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config_dir = config::config_dir();
    config::init(&config_dir)?;
    let game_config = config::load_game_config(&config_dir)?;
    let source = game_config.problem_source()?;

    tracing::info!(
        round_seconds = game_config.round_seconds(),
        countdown_seconds = game_config.countdown_seconds,
        source = ?game_config.problem_source,
        "game config loaded"
    );

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .map_err(|e| error::ConfigError::Invalid(format!("PORT: {e}")))?;
    let static_dir = std::env::var("STATIC_DIR").unwrap_or_else(|_| "static".to_string());

    let registry = Registry::new(game_config.room_settings(source));
    let state = AppState {
        registry: registry.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/rooms/{code}", get(room_snapshot))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    tracing::info!("MathRush server running on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    registry.clear();
    tracing::info!("server stopped");
    Ok(())
}
