use crate::color::Rgb;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which input currently drives the bulbs.  Exactly one is active at any
/// instant, so Spotify auto-sync and screen sync can never run together.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColorSource {
    /// Colours come only from the picker and presets.
    #[default]
    Manual,
    /// One dominant album-art colour applied to every active device.
    SpotifySingle,
    /// Album-art palette routed per device.
    SpotifyMulti,
    /// Average colour of the captured screen.
    ScreenSync,
}

impl ColorSource {
    pub fn is_spotify(&self) -> bool {
        matches!(self, ColorSource::SpotifySingle | ColorSource::SpotifyMulti)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "manual" => Some(Self::Manual),
            "spotify" | "spotify_single" | "single" => Some(Self::SpotifySingle),
            "spotify_multi" | "multi" => Some(Self::SpotifyMulti),
            "screen" | "screen_sync" => Some(Self::ScreenSync),
            _ => None,
        }
    }
}

/// Messages sent from clients (HTTP API) to the sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    RefreshDevices,
    RefreshStatus,
    SelectDevices { ids: Vec<String> },
    SetSelected { device_id: String, selected: bool },
    SaveGroup { name: String, device_ids: Vec<String> },
    DeleteGroup { name: String },
    ApplyGroup { name: String },
    /// Manual colour picker.
    SetColor { hex: String },
    SavePreset {
        name: String,
        hex: String,
        #[serde(default)]
        brightness: Option<u8>,
    },
    DeletePreset { name: String },
    ApplyPreset { name: String },
    SetBrightness { value: u8 },
    SetColorTemperature { kelvin: u16 },
    Power { on: bool },
    SetSource { source: ColorSource },
    SetEnergySync { enabled: bool },
    SetRhythmicCycle { enabled: bool },
    /// `slot: None` returns the device to automatic assignment.
    SetRouting {
        device_id: String,
        #[serde(default)]
        slot: Option<usize>,
    },
    SetSamplerPositions { positions: Vec<SamplerPosition> },
    SetSpotifyToken { token: String },
    ClearSpotifyToken,
    NextTrack,
    PreviousTrack,
    TogglePlay,
    SyncNow,
    GetState,
}

/// Messages pushed from the sync core to subscribed clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    State { data: SyncState },
    /// User-visible, non-fatal problem (rate limit, expired token, capture failure).
    Notice { message: String },
    Log { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub is_selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Track {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<String>,
    #[serde(default)]
    pub album_image_url: Option<String>,
    #[serde(default)]
    pub is_local: bool,
    /// Taken from recently-played history because nothing is playing.
    #[serde(default)]
    pub is_fallback: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AudioFeatures {
    /// Beats per minute.
    pub tempo: f32,
    /// 0.0..=1.0
    pub energy: f32,
    /// Pitch class 0..=11, -1 when unknown.
    pub key: i8,
    /// 1 = major, 0 = minor.
    pub mode: u8,
}

/// Relative pixel position inside the album art, in percent (0..=100).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SamplerPosition {
    pub x: f32,
    pub y: f32,
}

impl SamplerPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: x.clamp(0.0, 100.0),
            y: y.clamp(0.0, 100.0),
        }
    }
}

pub fn default_sampler_positions() -> Vec<SamplerPosition> {
    vec![SamplerPosition::new(25.0, 25.0), SamplerPosition::new(75.0, 75.0)]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preset {
    pub name: String,
    pub color: Rgb,
    #[serde(default)]
    pub brightness: Option<u8>,
}

/// Last status reported by the device API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceStatus {
    pub power: Option<bool>,
    pub brightness: Option<u8>,
    pub color: Option<Rgb>,
    pub color_temperature: Option<u16>,
}

/// Full observable state of the sync core.  `rev` increments on every change.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncState {
    #[serde(default)]
    pub rev: u64,
    pub devices: Vec<Device>,
    pub source: ColorSource,
    pub energy_sync: bool,
    pub rhythmic_cycle: bool,
    pub track: Option<Track>,
    pub is_playing: bool,
    pub features: Option<AudioFeatures>,
    pub palette: Vec<Rgb>,
    /// Colour most recently sent to each device.
    pub device_colors: BTreeMap<String, Rgb>,
    pub current_color: Option<Rgb>,
    pub brightness: u8,
    pub color_temperature: Option<u16>,
    pub routing: BTreeMap<String, usize>,
    pub sampler_positions: Vec<SamplerPosition>,
    pub groups: BTreeMap<String, Vec<String>>,
    pub presets: Vec<Preset>,
    pub cycle_index: u64,
    pub spotify_authorized: bool,
    pub device_status: BTreeMap<String, DeviceStatus>,
    pub last_notice: Option<String>,
}

impl SyncState {
    /// Selected devices, in device-list order.  The position in this list is
    /// the device ordinal used for palette slot assignment.
    pub fn active_devices(&self) -> Vec<&Device> {
        self.devices.iter().filter(|d| d.is_selected).collect()
    }
}
