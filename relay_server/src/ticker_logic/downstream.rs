use crate::ticker_logic::config::Config;
use crate::ticker_logic::state::RelayState;
use anyhow::Context;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::services::ServeDir;

#[derive(Clone)]
struct HttpState {
    relay: RelayState,
    static_files: ServeDir,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// `/health` plus a fallback that upgrades WebSocket requests on any path and
/// serves everything else from `static_dir`.
pub fn router(relay: RelayState, static_dir: impl Into<PathBuf>) -> Router {
    let state = HttpState {
        relay,
        static_files: ServeDir::new(static_dir.into()),
    };

    Router::new()
        .route("/health", get(health_handler))
        .fallback(relay_or_static)
        .with_state(state)
}

pub async fn run(
    config: Config,
    relay: RelayState,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    serve(listener, relay, config.static_dir, shutdown).await
}

pub async fn serve(
    listener: TcpListener,
    relay: RelayState,
    static_dir: PathBuf,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    log::info!(
        "Server listening on {} (static files from {})",
        listener.local_addr()?,
        static_dir.display()
    );

    axum::serve(listener, router(relay, static_dir))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await
        .context("downstream server failed")
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn relay_or_static(
    State(state): State<HttpState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    request: Request,
) -> Response {
    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, state.relay))
            .into_response(),
        Err(_) => match state.static_files.oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        },
    }
}

async fn handle_socket(socket: WebSocket, relay: RelayState) {
    let (client_id, mut frames) = relay.add_client();
    log::info!(
        "Browser client {} connected ({} connected)",
        client_id,
        relay.client_count()
    );

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            // Browsers have nothing to say; only watch for the connection ending.
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            // `stream` is not polled while a send is pending; the bounded queue
            // in `RelayState` caps what a stalled browser can pile up meanwhile.
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break; // client disconnected
                    }
                }
                None => break,
            },
        }
    }

    relay.remove_client(client_id);
    log::info!(
        "Browser client {} disconnected ({} connected)",
        client_id,
        relay.client_count()
    );
}
