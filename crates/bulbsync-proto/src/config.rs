use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub switchbot: SwitchBotConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Spotify Web API access. The access token itself comes from an external
/// PKCE flow; `access_token` only seeds the persisted token on first run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotifyConfig {
    #[serde(default = "default_spotify_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchBotConfig {
    #[serde(default = "default_switchbot_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub secret: String,
}

/// Timing knobs for the colour sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Debounce window for brightness, colour temperature and manual colour.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_screen_sample_secs")]
    pub screen_sample_secs: u64,
    /// Edge length (pixels) frames are downsampled to before averaging.
    #[serde(default = "default_screen_sample_size")]
    pub screen_sample_size: u32,
}

/// ffmpeg grab source used for screen sync.
/// Defaults: `x11grab :0.0` on Linux, `gdigrab desktop` on Windows,
/// `avfoundation 1` on macOS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_format")]
    pub input_format: String,
    #[serde(default = "default_capture_input")]
    pub input: String,
    #[serde(default = "default_capture_framerate")]
    pub framerate: u32,
    /// Explicit ffmpeg binary; searched for when unset or missing.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            api_base: default_spotify_api_base(),
            access_token: None,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for SwitchBotConfig {
    fn default() -> Self {
        Self {
            api_base: default_switchbot_api_base(),
            token: String::new(),
            secret: String::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            screen_sample_secs: default_screen_sample_secs(),
            screen_sample_size: default_screen_sample_size(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            input_format: default_capture_format(),
            input: default_capture_input(),
            framerate: default_capture_framerate(),
            ffmpeg_path: None,
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_spotify_api_base() -> String {
    "https://api.spotify.com/v1".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_switchbot_api_base() -> String {
    "https://api.switch-bot.com/v1.1".to_string()
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_screen_sample_secs() -> u64 {
    2
}

fn default_screen_sample_size() -> u32 {
    64
}

fn default_capture_format() -> String {
    if cfg!(windows) {
        "gdigrab".to_string()
    } else if cfg!(target_os = "macos") {
        "avfoundation".to_string()
    } else {
        "x11grab".to_string()
    }
}

fn default_capture_input() -> String {
    if cfg!(windows) {
        "desktop".to_string()
    } else if cfg!(target_os = "macos") {
        "1".to_string()
    } else {
        std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".to_string())
    }
}

fn default_capture_framerate() -> u32 {
    2
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
