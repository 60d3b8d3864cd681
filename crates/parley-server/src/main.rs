mod upload;

use std::net::SocketAddr;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_relay::connection;
use parley_relay::directory::PresenceDirectory;

use crate::upload::Uploader;

#[derive(Clone)]
pub(crate) struct AppState {
    pub directory: PresenceDirectory,
    pub uploader: Uploader,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "5000".into())
        .parse()?;
    let upload_url = std::env::var("PARLEY_UPLOAD_URL").unwrap_or_default();
    let upload_preset = std::env::var("PARLEY_UPLOAD_PRESET").ok();
    if upload_url.is_empty() {
        warn!("PARLEY_UPLOAD_URL is unset; /upload will report storage failures");
    }

    // The directory lives for the whole process and starts empty on
    // every restart; presence is never persisted.
    let directory = PresenceDirectory::new();
    let uploader = Uploader::new(upload_url, upload_preset);

    let state = AppState {
        directory,
        uploader,
    };

    let app = Router::new()
        .route("/", get(health))
        .route("/gateway", get(ws_upgrade))
        .route("/upload", post(upload::upload))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn health() -> &'static str {
    "Server is running"
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.directory))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
