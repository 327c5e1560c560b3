//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bulbsync_proto::protocol::{AudioFeatures, Device, DeviceStatus, Track};
use image::RgbImage;

use crate::error::{ApiError, ApiResult};
use crate::palette::ImageLoader;
use crate::spotify::{Playback, PlaybackProvider};
use crate::switchbot::DeviceApi;

pub fn track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        name: format!("Track {}", id),
        artists: vec!["Artist".to_string()],
        album_image_url: Some(format!("img:{}", id)),
        is_local: false,
        is_fallback: false,
    }
}

pub fn features(tempo: f32, energy: f32) -> AudioFeatures {
    AudioFeatures {
        tempo,
        energy,
        key: 0,
        mode: 1,
    }
}

pub fn device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Bulb {}", id),
        device_type: "Color Bulb".to_string(),
        is_selected: false,
    }
}

// ── devices ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DevicesInner {
    devices: Vec<Device>,
    statuses: HashMap<String, DeviceStatus>,
    /// Every attempted command, including failed ones.
    commands: Vec<(String, String, String)>,
    failing: HashSet<String>,
    rate_limited: bool,
}

#[derive(Clone, Default)]
pub struct FakeDevices {
    inner: Arc<Mutex<DevicesInner>>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(ids: &[&str]) -> Self {
        let fake = Self::new();
        fake.inner.lock().unwrap().devices = ids.iter().map(|id| device(id)).collect();
        fake
    }

    pub fn set_status(&self, id: &str, status: DeviceStatus) {
        self.inner.lock().unwrap().statuses.insert(id.to_string(), status);
    }

    pub fn commands(&self) -> Vec<(String, String, String)> {
        self.inner.lock().unwrap().commands.clone()
    }

    /// `(command, parameter)` pairs attempted for one device.
    pub fn commands_for(&self, id: &str) -> Vec<(String, String)> {
        self.inner
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(d, _, _)| d == id)
            .map(|(_, c, p)| (c.clone(), p.clone()))
            .collect()
    }

    /// Parameters of `setColor` commands attempted for one device.
    pub fn colors_for(&self, id: &str) -> Vec<String> {
        self.commands_for(id)
            .into_iter()
            .filter(|(c, _)| c == "setColor")
            .map(|(_, p)| p)
            .collect()
    }

    pub fn fail_device(&self, id: &str) {
        self.inner.lock().unwrap().failing.insert(id.to_string());
    }

    pub fn heal_device(&self, id: &str) {
        self.inner.lock().unwrap().failing.remove(id);
    }

    pub fn rate_limit(&self, on: bool) {
        self.inner.lock().unwrap().rate_limited = on;
    }
}

impl DeviceApi for FakeDevices {
    async fn list_devices(&self) -> ApiResult<Vec<Device>> {
        Ok(self.inner.lock().unwrap().devices.clone())
    }

    async fn get_status(&self, device_id: &str) -> ApiResult<DeviceStatus> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.statuses.get(device_id).cloned().unwrap_or_default())
    }

    async fn send_command(&self, device_id: &str, command: &str, parameter: &str) -> ApiResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .commands
            .push((device_id.to_string(), command.to_string(), parameter.to_string()));
        if inner.rate_limited {
            return Err(ApiError::RateLimited);
        }
        if inner.failing.contains(device_id) {
            return Err(ApiError::Status(500));
        }
        Ok(())
    }
}

// ── playback ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PlaybackInner {
    current: Option<Playback>,
    recent: Option<Track>,
    features: HashMap<String, Result<AudioFeatures, u16>>,
    feature_calls: HashMap<String, usize>,
    unauthorized: bool,
    playback_error: Option<u16>,
    controls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakePlayback {
    inner: Arc<Mutex<PlaybackInner>>,
}

impl FakePlayback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_playing(&self, track: Option<Track>, is_playing: bool) {
        self.inner.lock().unwrap().current = track.map(|track| Playback { track, is_playing });
    }

    pub fn set_recent(&self, track: Option<Track>) {
        self.inner.lock().unwrap().recent = track;
    }

    pub fn set_features(&self, id: &str, features: AudioFeatures) {
        self.inner
            .lock()
            .unwrap()
            .features
            .insert(id.to_string(), Ok(features));
    }

    pub fn fail_features(&self, id: &str, status: u16) {
        self.inner
            .lock()
            .unwrap()
            .features
            .insert(id.to_string(), Err(status));
    }

    pub fn feature_calls(&self, id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .feature_calls
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_unauthorized(&self, on: bool) {
        self.inner.lock().unwrap().unauthorized = on;
    }

    pub fn fail_playback(&self, status: u16) {
        self.inner.lock().unwrap().playback_error = Some(status);
    }

    pub fn controls(&self) -> Vec<String> {
        self.inner.lock().unwrap().controls.clone()
    }

    fn check(&self) -> ApiResult<()> {
        let inner = self.inner.lock().unwrap();
        if inner.unauthorized {
            return Err(ApiError::Unauthorized);
        }
        if let Some(status) = inner.playback_error {
            return Err(ApiError::Status(status));
        }
        Ok(())
    }

    fn record(&self, control: &str) -> ApiResult<()> {
        self.check()?;
        self.inner.lock().unwrap().controls.push(control.to_string());
        Ok(())
    }
}

impl PlaybackProvider for FakePlayback {
    async fn current_playback(&self, _token: &str) -> ApiResult<Option<Playback>> {
        self.check()?;
        Ok(self.inner.lock().unwrap().current.clone())
    }

    async fn recently_played(&self, _token: &str) -> ApiResult<Option<Track>> {
        self.check()?;
        Ok(self.inner.lock().unwrap().recent.clone())
    }

    async fn audio_features(&self, _token: &str, track_id: &str) -> ApiResult<AudioFeatures> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        *inner.feature_calls.entry(track_id.to_string()).or_insert(0) += 1;
        match inner.features.get(track_id) {
            Some(Ok(f)) => Ok(*f),
            Some(Err(status)) => Err(ApiError::Status(*status)),
            None => Err(ApiError::Status(404)),
        }
    }

    async fn next(&self, _token: &str) -> ApiResult<()> {
        self.record("next")
    }

    async fn previous(&self, _token: &str) -> ApiResult<()> {
        self.record("previous")
    }

    async fn toggle_play(&self, _token: &str, currently_playing: bool) -> ApiResult<()> {
        self.record(if currently_playing { "pause" } else { "play" })
    }
}

// ── images ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ImagesInner {
    images: HashMap<String, RgbImage>,
    loads: usize,
}

#[derive(Clone, Default)]
pub struct FakeImages {
    inner: Arc<Mutex<ImagesInner>>,
}

impl FakeImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, img: RgbImage) {
        self.inner.lock().unwrap().images.insert(url.to_string(), img);
    }

    /// Solid two-colour art: left half `left`, right half `right`.
    pub fn insert_split(&self, url: &str, left: [u8; 3], right: [u8; 3]) {
        let img = RgbImage::from_fn(40, 40, |x, _| {
            image::Rgb(if x < 20 { left } else { right })
        });
        self.insert(url, img);
    }

    pub fn loads(&self) -> usize {
        self.inner.lock().unwrap().loads
    }
}

impl ImageLoader for FakeImages {
    async fn load(&self, url: &str) -> ApiResult<RgbImage> {
        let mut inner = self.inner.lock().unwrap();
        inner.loads += 1;
        inner
            .images
            .get(url)
            .cloned()
            .ok_or(ApiError::Status(404))
    }
}
