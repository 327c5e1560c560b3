use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use bulbsync_proto::color::Rgb;
use bulbsync_proto::protocol::{Broadcast, ColorSource, Command, SyncState};
use bulbsync_proto::state::StateManager;
use futures_util::stream::{self, Stream};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<Broadcast>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<Broadcast>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        let app = router(HttpState {
            state_manager,
            event_tx,
            broadcast_tx,
        });
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(app_state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/events", get(events))
        .route("/api/command", post(command))
        .route("/api/color/:hex", post(set_color))
        .route("/api/brightness/:value", post(set_brightness))
        .route("/api/power/:on", post(power))
        .route("/api/source/:source", post(set_source))
        .route("/api/next", get(next_track).post(next_track))
        .route("/api/prev", get(prev_track).post(prev_track))
        .route("/api/toggle", get(toggle_play).post(toggle_play))
        .route("/api/devices/refresh", post(refresh_devices))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("HTTP API: sync core is gone, dropping command");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

async fn get_state(State(state): State<HttpState>) -> Json<SyncState> {
    Json(state.state_manager.get_state().await)
}

/// Server-sent events: one `data:` frame per broadcast.
async fn events(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    info!("HTTP API: event stream opened");
    let rx = state.broadcast_tx.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(msg) => return Some((Event::default().json_data(&msg), rx)),
                Err(RecvError::Lagged(n)) => {
                    warn!("HTTP API: event stream lagged, {} messages skipped", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn command(State(state): State<HttpState>, Json(cmd): Json<Command>) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    forward(&state, cmd).await
}

async fn set_color(State(state): State<HttpState>, Path(hex): Path<String>) -> StatusCode {
    info!("HTTP API: Set colour {}", hex);
    if Rgb::from_hex(&hex).is_none() {
        return StatusCode::BAD_REQUEST;
    }
    forward(&state, Command::SetColor { hex }).await
}

async fn set_brightness(State(state): State<HttpState>, Path(value): Path<u8>) -> StatusCode {
    info!("HTTP API: Set brightness {}", value);
    forward(&state, Command::SetBrightness { value }).await
}

async fn power(State(state): State<HttpState>, Path(on): Path<String>) -> StatusCode {
    let on = match on.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => true,
        "off" | "false" | "0" => false,
        _ => return StatusCode::BAD_REQUEST,
    };
    info!("HTTP API: Power {}", if on { "on" } else { "off" });
    forward(&state, Command::Power { on }).await
}

async fn set_source(State(state): State<HttpState>, Path(source): Path<String>) -> StatusCode {
    let Some(source) = ColorSource::parse(&source) else {
        return StatusCode::BAD_REQUEST;
    };
    info!("HTTP API: Source {:?}", source);
    forward(&state, Command::SetSource { source }).await
}

async fn next_track(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Next track");
    forward(&state, Command::NextTrack).await
}

async fn prev_track(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Previous track");
    forward(&state, Command::PreviousTrack).await
}

async fn toggle_play(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Toggle play");
    forward(&state, Command::TogglePlay).await
}

async fn refresh_devices(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Refresh devices");
    forward(&state, Command::RefreshDevices).await
}
