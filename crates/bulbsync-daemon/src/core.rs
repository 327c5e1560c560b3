//! SyncCore: single-owner event loop for the colour-sync engine.
//!
//! Every input arrives as a `DaemonEvent` on one mpsc channel.  SyncCore owns
//! the observer, the command gateway, the capture stream and all timers
//! exclusively, so no locking is needed around engine state.
//!
//! Timers never touch state themselves: they only send an event tagged with
//! the generation they were started under.  Stopping a timer bumps the
//! generation, so an event already queued when teardown happens is ignored.
//!
//! After each event that mutates state, SyncCore broadcasts a fresh
//! `Broadcast::State` snapshot to all listeners.

use std::sync::Arc;
use std::time::Duration;

use bulbsync_proto::color::Rgb;
use bulbsync_proto::config::{CaptureConfig, Config};
use bulbsync_proto::protocol::{
    default_sampler_positions, Broadcast, ColorSource, Command, Preset, SamplerPosition, SyncState,
    Track,
};
use bulbsync_proto::state::StateManager;
use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::debounce::{DebounceChannel, DebounceSlot};
use crate::error::ApiError;
use crate::gateway::{CommandGateway, DeviceCommand, DispatchReport};
use crate::observer::{PlaybackObserver, PlaybackSnapshot, PollOutcome};
use crate::palette::{dominant_color, extract_palette, ImageLoader, MIN_PALETTE_LEN};
use crate::resolver::{
    apply_energy, cycle_interval, cycling_active, modulation_energy, resolve_palette,
    resolve_uniform, PaletteResolve,
};
use crate::screen::ScreenCapture;
use crate::spotify::PlaybackProvider;
use crate::switchbot::DeviceApi;

const BRIGHTNESS_RANGE: (u8, u8) = (1, 100);
const COLOR_TEMPERATURE_RANGE: (u16, u16) = (2700, 6500);
const MAX_SCREEN_SAMPLE_EDGE: u32 = 100;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the SyncCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from the HTTP API.
    ClientCommand(Command),
    PollTick { generation: u64 },
    CycleTick { generation: u64 },
    ScreenTick { generation: u64 },
    /// ffmpeg went away (stop sharing, denied, crashed).
    CaptureEnded { generation: u64 },
    DebounceFired {
        channel: DebounceChannel,
        generation: u64,
    },
}

type CaptureLauncher = fn(
    &CaptureConfig,
    u32,
    mpsc::Sender<DaemonEvent>,
    DaemonEvent,
) -> anyhow::Result<ScreenCapture>;

// ── Ticker ────────────────────────────────────────────────────────────────────

/// Periodic task that only sends `make(generation)` into the loop.
#[derive(Default)]
struct Ticker {
    handle: Option<AbortHandle>,
    generation: u64,
}

impl Ticker {
    fn start(&mut self, period: Duration, tx: &mpsc::Sender<DaemonEvent>, make: fn(u64) -> DaemonEvent) {
        self.stop();
        let generation = self.generation;
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if tx.send(make(generation)).await.is_err() {
                    break;
                }
            }
        });
        self.handle = Some(task.abort_handle());
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.handle.is_some() && generation == self.generation
    }
}

/// Colour currently shown in single-colour mode.
#[derive(Debug, Clone, Copy)]
struct SingleColor {
    color: Rgb,
    /// Album-art colours are energy-modulated; manual picks are not.
    from_track: bool,
}

// ── SyncCore ──────────────────────────────────────────────────────────────────

pub struct SyncCore<P, D, L> {
    config: Config,
    state_manager: Arc<StateManager>,
    observer: PlaybackObserver<P>,
    gateway: CommandGateway<D>,
    images: L,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<Broadcast>,
    /// No device command leaves before the first genuine user or track intent.
    control_active: bool,
    poll_timer: Ticker,
    cycle_timer: Ticker,
    cycle_period: Option<Duration>,
    cycle_index: u64,
    screen_timer: Ticker,
    capture: Option<ScreenCapture>,
    capture_generation: u64,
    launch_capture: CaptureLauncher,
    brightness: DebounceSlot<u8>,
    color_temperature: DebounceSlot<u16>,
    manual_color: DebounceSlot<Rgb>,
    track: Option<Track>,
    palette: Vec<Rgb>,
    /// Track id the palette was sampled for.
    palette_track: Option<String>,
    single: Option<SingleColor>,
    /// Track id the single colour belongs to.
    single_track: Option<String>,
}

impl<P, D, L> SyncCore<P, D, L>
where
    P: PlaybackProvider,
    D: DeviceApi,
    L: ImageLoader,
{
    pub fn new(
        config: Config,
        state_manager: Arc<StateManager>,
        playback: P,
        devices: D,
        images: L,
        event_tx: mpsc::Sender<DaemonEvent>,
        broadcast_tx: broadcast::Sender<Broadcast>,
    ) -> Self {
        Self {
            config,
            state_manager,
            observer: PlaybackObserver::new(playback),
            gateway: CommandGateway::new(devices),
            images,
            event_tx,
            broadcast_tx,
            control_active: false,
            poll_timer: Ticker::default(),
            cycle_timer: Ticker::default(),
            cycle_period: None,
            cycle_index: 0,
            screen_timer: Ticker::default(),
            capture: None,
            capture_generation: 0,
            launch_capture: ScreenCapture::start::<DaemonEvent>,
            brightness: DebounceSlot::new(),
            color_temperature: DebounceSlot::new(),
            manual_color: DebounceSlot::new(),
            track: None,
            palette: Vec::new(),
            palette_track: None,
            single: None,
            single_track: None,
        }
    }

    /// Borrow the state manager (for use by the HTTP server).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run the core event loop.  Returns once every sender has been dropped.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("SyncCore: starting event loop");
        self.startup().await;

        loop {
            match event_rx.recv().await {
                None => {
                    info!("SyncCore: event channel closed, shutting down");
                    break;
                }
                Some(evt) => self.handle_event(evt).await,
            }
        }

        self.cleanup();
        Ok(())
    }

    /// Load devices and resume polling if a Spotify source was persisted.
    /// Persisted colours and brightness are never echoed to the devices.
    async fn startup(&mut self) {
        self.refresh_devices().await;

        let state = self.state_manager.get_state().await;
        if state.source == ColorSource::ScreenSync {
            // Capture needs a fresh user action to start.
            if let Err(e) = self.state_manager.set_source(ColorSource::Manual).await {
                error!("SyncCore: failed to persist source: {}", e);
            }
        }
        if state.source.is_spotify() {
            self.start_polling().await;
        }
        self.publish().await;
    }

    async fn handle_event(&mut self, evt: DaemonEvent) {
        match evt {
            DaemonEvent::ClientCommand(cmd) => {
                info!("SyncCore: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    self.notice(format!("Command failed: {}", e)).await;
                }
                self.publish().await;
            }

            DaemonEvent::PollTick { generation } => {
                if self.poll_timer.is_current(generation) {
                    self.poll_once().await;
                }
            }

            DaemonEvent::CycleTick { generation } => {
                if self.cycle_timer.is_current(generation) {
                    self.cycle_index += 1;
                    debug!("SyncCore: cycle index {}", self.cycle_index);
                    self.state_manager.set_cycle_index(self.cycle_index).await;
                    self.resync().await;
                    self.publish().await;
                }
            }

            DaemonEvent::ScreenTick { generation } => {
                if self.screen_timer.is_current(generation) {
                    self.sample_screen().await;
                }
            }

            DaemonEvent::CaptureEnded { generation } => {
                if generation == self.capture_generation && self.capture.is_some() {
                    self.on_capture_ended().await;
                }
            }

            DaemonEvent::DebounceFired {
                channel,
                generation,
            } => {
                self.on_debounce_fired(channel, generation).await;
                self.publish().await;
            }
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::RefreshDevices => {
                self.refresh_devices().await;
                self.resync().await;
            }
            Command::RefreshStatus => self.refresh_status().await,
            Command::SelectDevices { ids } => {
                self.state_manager.select_only(&ids).await?;
                self.resync().await;
            }
            Command::SetSelected {
                device_id,
                selected,
            } => {
                self.state_manager.set_selected(&device_id, selected).await?;
                self.resync().await;
            }
            Command::SaveGroup { name, device_ids } => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    anyhow::bail!("group name is empty");
                }
                self.state_manager.save_group(name, device_ids).await?;
            }
            Command::DeleteGroup { name } => self.state_manager.delete_group(&name).await?,
            Command::ApplyGroup { name } => {
                let members = self
                    .state_manager
                    .group(&name)
                    .await
                    .ok_or_else(|| anyhow::anyhow!("unknown group {:?}", name))?;
                let state = self.state_manager.get_state().await;
                let ids: Vec<String> = members
                    .into_iter()
                    .filter(|id| state.devices.iter().any(|d| &d.id == id))
                    .collect();
                self.state_manager.select_only(&ids).await?;
                self.resync().await;
            }
            Command::SetColor { hex } => {
                let color = parse_hex(&hex)?;
                self.pick_color(color).await?;
            }
            Command::SavePreset {
                name,
                hex,
                brightness,
            } => {
                let preset = Preset {
                    name: name.trim().to_string(),
                    color: parse_hex(&hex)?,
                    brightness: brightness.map(|b| b.clamp(BRIGHTNESS_RANGE.0, BRIGHTNESS_RANGE.1)),
                };
                if preset.name.is_empty() {
                    anyhow::bail!("preset name is empty");
                }
                self.state_manager.save_preset(preset).await?;
            }
            Command::DeletePreset { name } => self.state_manager.delete_preset(&name).await?,
            Command::ApplyPreset { name } => {
                let preset = self
                    .state_manager
                    .preset(&name)
                    .await
                    .ok_or_else(|| anyhow::anyhow!("unknown preset {:?}", name))?;
                self.pick_color(preset.color).await?;
                if let Some(b) = preset.brightness {
                    self.set_brightness(b).await?;
                }
            }
            Command::SetBrightness { value } => self.set_brightness(value).await?,
            Command::SetColorTemperature { kelvin } => {
                self.control_active = true;
                let kelvin = kelvin.clamp(COLOR_TEMPERATURE_RANGE.0, COLOR_TEMPERATURE_RANGE.1);
                self.state_manager.set_color_temperature(kelvin).await?;
                let delay = self.debounce_delay();
                self.color_temperature.schedule(
                    kelvin,
                    delay,
                    &self.event_tx,
                    |generation| DaemonEvent::DebounceFired {
                        channel: DebounceChannel::ColorTemperature,
                        generation,
                    },
                );
            }
            Command::Power { on } => {
                self.control_active = true;
                let command = if on {
                    DeviceCommand::TurnOn
                } else {
                    DeviceCommand::TurnOff
                };
                self.dispatch_all(command).await;
            }
            Command::SetSource { source } => {
                self.control_active = true;
                self.switch_source(source).await?;
            }
            Command::SetEnergySync { enabled } => {
                self.state_manager.set_energy_sync(enabled).await?;
                self.resync().await;
            }
            Command::SetRhythmicCycle { enabled } => {
                self.state_manager.set_rhythmic_cycle(enabled).await?;
                self.update_cycle_timer().await;
                self.resync().await;
            }
            Command::SetRouting { device_id, slot } => {
                self.state_manager.set_routing(&device_id, slot).await?;
                self.resync().await;
            }
            Command::SetSamplerPositions { positions } => {
                self.state_manager
                    .set_sampler_positions(normalize_positions(positions))
                    .await?;
                self.palette_track = None;
                self.ensure_track_colors().await;
                self.resync().await;
            }
            Command::SetSpotifyToken { token } => {
                let token = token.trim().to_string();
                if token.is_empty() {
                    anyhow::bail!("empty Spotify token");
                }
                self.state_manager.set_spotify_token(Some(token)).await?;
                self.observer.reset();
                info!("SyncCore: Spotify token updated");
                if self.state_manager.get_state().await.source.is_spotify() {
                    self.start_polling().await;
                }
            }
            Command::ClearSpotifyToken => {
                self.state_manager.set_spotify_token(None).await?;
                self.stop_polling();
                self.forget_track().await;
            }
            Command::NextTrack => self.playback_control(PlaybackControl::Next).await,
            Command::PreviousTrack => self.playback_control(PlaybackControl::Previous).await,
            Command::TogglePlay => self.playback_control(PlaybackControl::TogglePlay).await,
            Command::SyncNow => {
                self.poll_once().await;
                self.ensure_track_colors().await;
                self.resync().await;
            }
            Command::GetState => {}
        }
        Ok(())
    }

    /// Manual picker / preset colour.  Leaves multi-colour mode and screen
    /// sync; the colour itself goes out after the debounce window.
    async fn pick_color(&mut self, color: Rgb) -> anyhow::Result<()> {
        self.control_active = true;
        match self.state_manager.get_state().await.source {
            ColorSource::SpotifyMulti => {
                info!("SyncCore: manual colour leaves multi-colour mode");
                self.state_manager.set_source(ColorSource::SpotifySingle).await?;
                // The pick replaces the album colour until the next track.
                self.single_track = self.track.as_ref().map(|t| t.id.clone());
                self.update_cycle_timer().await;
            }
            ColorSource::ScreenSync => {
                info!("SyncCore: manual colour stops screen sync");
                self.stop_screen_sync();
                self.state_manager.set_source(ColorSource::Manual).await?;
            }
            ColorSource::SpotifySingle => {
                self.single_track = self.track.as_ref().map(|t| t.id.clone());
            }
            ColorSource::Manual => {}
        }
        self.state_manager.set_manual_color(color).await?;
        let delay = self.debounce_delay();
        self.manual_color.schedule(
            color,
            delay,
            &self.event_tx,
            |generation| DaemonEvent::DebounceFired {
                channel: DebounceChannel::ManualColor,
                generation,
            },
        );
        Ok(())
    }

    async fn set_brightness(&mut self, value: u8) -> anyhow::Result<()> {
        self.control_active = true;
        let value = value.clamp(BRIGHTNESS_RANGE.0, BRIGHTNESS_RANGE.1);
        self.state_manager.set_brightness(value).await?;
        let delay = self.debounce_delay();
        self.brightness.schedule(
            value,
            delay,
            &self.event_tx,
            |generation| DaemonEvent::DebounceFired {
                channel: DebounceChannel::Brightness,
                generation,
            },
        );
        Ok(())
    }

    async fn on_debounce_fired(&mut self, channel: DebounceChannel, generation: u64) {
        match channel {
            DebounceChannel::Brightness => {
                if let Some(value) = self.brightness.fire(generation) {
                    self.dispatch_all(DeviceCommand::SetBrightness(value)).await;
                }
            }
            DebounceChannel::ColorTemperature => {
                if let Some(kelvin) = self.color_temperature.fire(generation) {
                    self.dispatch_all(DeviceCommand::SetColorTemperature(kelvin))
                        .await;
                }
            }
            DebounceChannel::ManualColor => {
                if let Some(color) = self.manual_color.fire(generation) {
                    self.apply_manual_color(color).await;
                }
            }
        }
    }

    async fn apply_manual_color(&mut self, color: Rgb) {
        let state = self.state_manager.get_state().await;
        match state.source {
            ColorSource::Manual => {}
            ColorSource::SpotifySingle => {
                self.single = Some(SingleColor {
                    color,
                    from_track: false,
                });
            }
            ColorSource::SpotifyMulti | ColorSource::ScreenSync => {
                debug!("SyncCore: dropping manual colour, source is {:?}", state.source);
                return;
            }
        }
        let targets = resolve_uniform(&active_ids(&state), color, None);
        self.dispatch_colors(targets, Some(color)).await;
    }

    // ── colour source ─────────────────────────────────────────────────────────

    /// Structural mutual exclusion: leaving a source tears down everything it
    /// owns before the new one starts.
    async fn switch_source(&mut self, source: ColorSource) -> anyhow::Result<()> {
        let previous = self.state_manager.get_state().await.source;
        info!("SyncCore: source {:?} -> {:?}", previous, source);

        if previous == ColorSource::ScreenSync && source != ColorSource::ScreenSync {
            self.stop_screen_sync();
        }
        if source != ColorSource::Manual {
            // Last action wins over a pick still in its debounce window.
            self.manual_color.cancel();
        }
        self.state_manager.set_source(source).await?;

        if source.is_spotify() {
            if !self.poll_timer.is_running() {
                self.start_polling().await;
            }
        } else {
            self.stop_polling();
        }

        if source == ColorSource::ScreenSync
            && previous != ColorSource::ScreenSync
            && !self.start_screen_sync().await
        {
            self.state_manager.set_source(ColorSource::Manual).await?;
        }

        self.ensure_track_colors().await;
        self.update_cycle_timer().await;
        self.resync().await;
        Ok(())
    }

    // ── playback observation ──────────────────────────────────────────────────

    async fn start_polling(&mut self) {
        if self.state_manager.spotify_token().await.is_none() {
            info!("SyncCore: no Spotify token, auto-sync waits for authorization");
            return;
        }
        let period = Duration::from_secs(self.config.spotify.poll_interval_secs.max(1));
        info!("SyncCore: polling playback every {:?}", period);
        self.poll_timer
            .start(period, &self.event_tx, |generation| DaemonEvent::PollTick {
                generation,
            });
        self.poll_once().await;
    }

    fn stop_polling(&mut self) {
        if self.poll_timer.is_running() {
            info!("SyncCore: playback polling stopped");
        }
        self.poll_timer.stop();
    }

    async fn poll_once(&mut self) {
        let Some(token) = self.state_manager.spotify_token().await else {
            return;
        };
        match self.observer.poll(&token).await {
            Ok(PollOutcome::TrackChanged(snapshot)) => self.on_track_changed(snapshot).await,
            Ok(PollOutcome::PlayStateChanged { track, is_playing }) => {
                self.track = Some(track.clone());
                let features = self.observer.features().copied();
                self.state_manager
                    .set_playback(Some(track), is_playing, features)
                    .await;
                self.update_cycle_timer().await;
                self.publish().await;
            }
            Ok(PollOutcome::NoChange) => {}
            Ok(PollOutcome::Idle) => {
                info!("SyncCore: nothing playing");
                self.forget_track().await;
                self.publish().await;
            }
            Ok(PollOutcome::TokenExpired) => self.token_expired().await,
            Err(e) => warn!("SyncCore: playback poll failed: {}", e),
        }
    }

    async fn on_track_changed(&mut self, snapshot: PlaybackSnapshot) {
        self.track = Some(snapshot.track.clone());
        self.palette.clear();
        self.palette_track = None;
        self.single = None;
        self.single_track = None;

        self.state_manager
            .set_playback(Some(snapshot.track), snapshot.is_playing, snapshot.features)
            .await;
        self.state_manager.set_palette(Vec::new()).await;

        self.ensure_track_colors().await;
        self.update_cycle_timer().await;
        self.resync().await;
        self.publish().await;
    }

    async fn forget_track(&mut self) {
        self.observer.reset();
        self.track = None;
        self.palette.clear();
        self.palette_track = None;
        self.single = None;
        self.single_track = None;
        self.state_manager.set_playback(None, false, None).await;
        self.state_manager.set_palette(Vec::new()).await;
        self.update_cycle_timer().await;
    }

    /// Sample album art for whatever the current Spotify mode needs, unless
    /// it is already computed for this track.
    async fn ensure_track_colors(&mut self) {
        let Some(track) = self.track.clone() else {
            return;
        };
        let Some(url) = track.album_image_url.as_deref() else {
            debug!("SyncCore: {} has no album art, no colour action", track.id);
            return;
        };
        let state = self.state_manager.get_state().await;
        match state.source {
            ColorSource::SpotifyMulti if self.palette_track.as_deref() != Some(track.id.as_str()) => {
                let palette = extract_palette(&self.images, url, &state.sampler_positions).await;
                debug!("SyncCore: palette for {}: {:?}", track.id, palette);
                self.palette = palette.clone();
                self.palette_track = Some(track.id.clone());
                self.state_manager.set_palette(palette).await;
                self.control_active = true;
            }
            ColorSource::SpotifySingle if self.single_track.as_deref() != Some(track.id.as_str()) => {
                let color = dominant_color(&self.images, url).await;
                debug!("SyncCore: dominant colour for {}: {}", track.id, color);
                self.single = Some(SingleColor {
                    color,
                    from_track: true,
                });
                self.single_track = Some(track.id.clone());
                self.control_active = true;
            }
            _ => {}
        }
    }

    async fn token_expired(&mut self) {
        if let Err(e) = self.state_manager.set_spotify_token(None).await {
            error!("SyncCore: failed to clear token: {}", e);
        }
        self.stop_polling();
        self.update_cycle_timer().await;
        self.notice("Spotify session expired. Reconnect to resume sync.".to_string())
            .await;
    }

    async fn playback_control(&mut self, control: PlaybackControl) {
        let Some(token) = self.state_manager.spotify_token().await else {
            self.notice("Connect Spotify to control playback.".to_string())
                .await;
            return;
        };
        let provider = self.observer.provider();
        let result = match control {
            PlaybackControl::Next => provider.next(&token).await,
            PlaybackControl::Previous => provider.previous(&token).await,
            PlaybackControl::TogglePlay => {
                provider
                    .toggle_play(&token, self.observer.is_playing())
                    .await
            }
        };
        match result {
            Ok(()) => self.poll_once().await,
            Err(ApiError::Unauthorized) => {
                self.observer.reset();
                self.token_expired().await;
            }
            Err(e) => {
                self.notice(format!("Playback control failed: {}", e)).await;
            }
        }
    }

    // ── rhythmic cycling ──────────────────────────────────────────────────────

    async fn update_cycle_timer(&mut self) {
        let state = self.state_manager.get_state().await;
        let features = self.observer.features().copied();
        let period = if self.poll_timer.is_running()
            && cycling_active(
                state.source,
                state.rhythmic_cycle,
                self.observer.is_playing(),
                features.as_ref(),
            ) {
            features.as_ref().and_then(cycle_interval)
        } else {
            None
        };

        match period {
            Some(p) if self.cycle_timer.is_running() && self.cycle_period == Some(p) => {}
            Some(p) => {
                info!("SyncCore: rhythmic cycle every {:?}", p);
                self.cycle_timer
                    .start(p, &self.event_tx, |generation| DaemonEvent::CycleTick {
                        generation,
                    });
                self.cycle_period = Some(p);
            }
            None => {
                if self.cycle_timer.is_running() {
                    info!("SyncCore: rhythmic cycle stopped");
                }
                self.cycle_timer.stop();
                self.cycle_period = None;
            }
        }
    }

    // ── screen sync ───────────────────────────────────────────────────────────

    async fn start_screen_sync(&mut self) -> bool {
        self.capture_generation += 1;
        let generation = self.capture_generation;
        let size = self
            .config
            .sync
            .screen_sample_size
            .clamp(1, MAX_SCREEN_SAMPLE_EDGE);

        match (self.launch_capture)(
            &self.config.capture,
            size,
            self.event_tx.clone(),
            DaemonEvent::CaptureEnded { generation },
        ) {
            Ok(capture) => {
                self.capture = Some(capture);
                let period = Duration::from_secs(self.config.sync.screen_sample_secs.max(1));
                self.screen_timer
                    .start(period, &self.event_tx, |generation| DaemonEvent::ScreenTick {
                        generation,
                    });
                info!("SyncCore: screen sync started");
                true
            }
            Err(e) => {
                self.notice(format!("Screen capture unavailable: {}", e)).await;
                false
            }
        }
    }

    fn stop_screen_sync(&mut self) {
        self.screen_timer.stop();
        self.capture_generation += 1;
        if self.capture.take().is_some() {
            info!("SyncCore: screen sync stopped");
        }
    }

    async fn on_capture_ended(&mut self) {
        let had_frames = self
            .capture
            .as_ref()
            .map_or(false, ScreenCapture::has_frame);
        self.stop_screen_sync();
        if let Err(e) = self.state_manager.set_source(ColorSource::Manual).await {
            error!("SyncCore: failed to persist source: {}", e);
        }
        let message = if had_frames {
            "Screen sharing ended."
        } else {
            "Screen capture failed. Check capture permissions and settings."
        };
        self.notice(message.to_string()).await;
        self.publish().await;
    }

    async fn sample_screen(&mut self) {
        let Some(color) = self.capture.as_ref().and_then(ScreenCapture::sample) else {
            return;
        };
        let state = self.state_manager.get_state().await;
        let targets = resolve_uniform(&active_ids(&state), color, None);
        self.dispatch_colors(targets, Some(color)).await;
        self.publish().await;
    }

    // ── resolution & dispatch ─────────────────────────────────────────────────

    /// Recompute per-device colours for the Spotify sources and dispatch.
    /// Manual and screen colours are pushed by their own channels.
    async fn resync(&mut self) {
        let state = self.state_manager.get_state().await;
        let ids = active_ids(&state);
        if ids.is_empty() {
            return;
        }
        let energy = modulation_energy(state.source, state.energy_sync, self.observer.features());

        let (targets, uniform) = match state.source {
            ColorSource::SpotifyMulti => {
                let cycling = cycling_active(
                    state.source,
                    state.rhythmic_cycle,
                    self.observer.is_playing(),
                    self.observer.features(),
                ) && self.cycle_timer.is_running();
                let targets = resolve_palette(&PaletteResolve {
                    device_ids: &ids,
                    palette: &self.palette,
                    routing: &state.routing,
                    cycle_index: cycling.then_some(self.cycle_index),
                    energy,
                });
                (targets, None)
            }
            ColorSource::SpotifySingle => {
                let Some(single) = self.single else {
                    return;
                };
                let energy = if single.from_track { energy } else { None };
                let color = apply_energy(single.color, energy);
                (resolve_uniform(&ids, single.color, energy), Some(color))
            }
            ColorSource::Manual | ColorSource::ScreenSync => return,
        };

        if !targets.is_empty() {
            self.dispatch_colors(targets, uniform).await;
        }
    }

    async fn dispatch_colors(&mut self, targets: Vec<(String, Rgb)>, uniform: Option<Rgb>) {
        let batch = targets
            .iter()
            .map(|(id, color)| (id.clone(), DeviceCommand::SetColor(*color)))
            .collect();
        let Some(report) = self.dispatch(batch).await else {
            return;
        };
        let delivered: Vec<(String, Rgb)> = targets
            .into_iter()
            .filter(|(id, _)| !report.failed.iter().any(|(failed, _)| failed == id))
            .collect();
        self.state_manager
            .record_device_colors(&delivered, uniform)
            .await;
    }

    async fn dispatch_all(&mut self, command: DeviceCommand) {
        let state = self.state_manager.get_state().await;
        let batch = active_ids(&state)
            .into_iter()
            .map(|id| (id, command))
            .collect();
        self.dispatch(batch).await;
    }

    /// Single gate for every outbound device command.
    async fn dispatch(&mut self, batch: Vec<(String, DeviceCommand)>) -> Option<DispatchReport> {
        if !self.control_active {
            debug!("SyncCore: control not active yet, holding {} commands", batch.len());
            return None;
        }
        if batch.is_empty() {
            return None;
        }
        let report = self.gateway.dispatch(batch).await;
        debug!(
            "SyncCore: dispatch sent={} skipped={} failed={}",
            report.sent.len(),
            report.skipped,
            report.failed.len()
        );
        if report.rate_limited() {
            self.notice("SwitchBot rate limit reached. Commands resume on the next update.".to_string())
                .await;
        }
        Some(report)
    }

    // ── devices ───────────────────────────────────────────────────────────────

    async fn refresh_devices(&mut self) {
        match self.gateway.api().list_devices().await {
            Ok(devices) => {
                info!("SyncCore: {} devices", devices.len());
                self.state_manager.set_devices(devices).await;
            }
            Err(e) => self.api_failure("device list", e).await,
        }
    }

    async fn refresh_status(&mut self) {
        let state = self.state_manager.get_state().await;
        let ids = active_ids(&state);
        let api = self.gateway.api();
        let results = join_all(ids.iter().map(|id| api.get_status(id))).await;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(status) => self.state_manager.set_device_status(id, status).await,
                Err(e) => self.api_failure(&format!("status of {}", id), e).await,
            }
        }
    }

    async fn api_failure(&self, what: &str, e: ApiError) {
        match e {
            ApiError::RateLimited => {
                self.notice("SwitchBot rate limit reached. Try again shortly.".to_string())
                    .await
            }
            e => warn!("SyncCore: {} failed: {}", what, e),
        }
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.config.sync.debounce_ms)
    }

    async fn notice(&self, message: String) {
        warn!("SyncCore: {}", message);
        self.state_manager.set_notice(message.clone()).await;
        let _ = self.broadcast_tx.send(Broadcast::Notice { message });
    }

    async fn publish(&self) {
        let data = self.state_manager.get_state().await;
        let _ = self.broadcast_tx.send(Broadcast::State { data });
    }

    fn cleanup(&mut self) {
        info!("SyncCore: cleanup, stopping timers and capture");
        self.poll_timer.stop();
        self.cycle_timer.stop();
        self.stop_screen_sync();
        self.brightness.cancel();
        self.color_temperature.cancel();
        self.manual_color.cancel();
    }
}

#[derive(Debug, Clone, Copy)]
enum PlaybackControl {
    Next,
    Previous,
    TogglePlay,
}

fn active_ids(state: &SyncState) -> Vec<String> {
    state
        .active_devices()
        .into_iter()
        .map(|d| d.id.clone())
        .collect()
}

fn parse_hex(hex: &str) -> anyhow::Result<Rgb> {
    Rgb::from_hex(hex).ok_or_else(|| anyhow::anyhow!("invalid colour {:?}", hex))
}

/// Clamp into the image and keep at least the minimum palette arity.
fn normalize_positions(positions: Vec<SamplerPosition>) -> Vec<SamplerPosition> {
    let mut out: Vec<SamplerPosition> = positions
        .into_iter()
        .map(|p| SamplerPosition::new(p.x, p.y))
        .collect();
    let defaults = default_sampler_positions();
    while out.len() < MIN_PALETTE_LEN {
        out.push(defaults[out.len() % defaults.len()]);
    }
    out
}
