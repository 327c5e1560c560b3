mod core;
mod debounce;
mod error;
mod gateway;
mod http;
mod observer;
mod palette;
mod resolver;
mod screen;
mod spotify;
mod switchbot;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use bulbsync_proto::config::Config;
use bulbsync_proto::protocol::Broadcast;
use bulbsync_proto::state::StateManager;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<Broadcast>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<Broadcast>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // Only WARN and ERROR reach clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} [{}] ", now.format("%H:%M:%S"), level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(Broadcast::Log { message });
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can feed it
    let (broadcast_tx, _) = broadcast::channel::<Broadcast>(100);

    let data_dir = bulbsync_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,bulbsync_daemon=debug,hyper=warn,reqwest=warn",
                )
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());
    if config.switchbot.token.is_empty() || config.switchbot.secret.is_empty() {
        warn!("SwitchBot token/secret not configured, device calls will fail");
    }

    let state_manager = Arc::new(StateManager::new(config.daemon.state_file.clone()));
    if state_manager.spotify_token().await.is_none() {
        if let Some(token) = config.spotify.access_token.clone() {
            info!("Seeding Spotify token from config");
            state_manager.set_spotify_token(Some(token)).await?;
        }
    }

    let playback = spotify::SpotifyClient::new(&config.spotify)?;
    let devices = switchbot::SwitchBotClient::new(&config.switchbot)?;
    let images = palette::HttpImageLoader::new()?;

    // Event channel: all external inputs funnel into SyncCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(256);

    let sync_core = core::SyncCore::new(
        config.clone(),
        Arc::clone(&state_manager),
        playback,
        devices,
        images,
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            sync_core.state_manager(),
            event_tx.clone(),
            broadcast_tx.clone(),
        );
    }

    info!("Daemon initialised, running event loop");
    sync_core.run(event_rx).await?;

    Ok(())
}
