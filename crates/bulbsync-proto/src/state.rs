use crate::color::Rgb;
use crate::protocol::{
    default_sampler_positions, AudioFeatures, ColorSource, Device, DeviceStatus, Preset,
    SamplerPosition, SyncState, Track,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

pub const DEFAULT_BRIGHTNESS: u8 = 100;

/// Everything that survives a restart.  Written on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentState {
    #[serde(default)]
    pub source: ColorSource,
    #[serde(default)]
    pub energy_sync: bool,
    #[serde(default)]
    pub rhythmic_cycle: bool,
    #[serde(default)]
    pub selected_devices: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub routing: BTreeMap<String, usize>,
    #[serde(default = "default_sampler_positions")]
    pub sampler_positions: Vec<SamplerPosition>,
    #[serde(default)]
    pub manual_color: Option<Rgb>,
    #[serde(default = "default_brightness")]
    pub brightness: u8,
    #[serde(default)]
    pub color_temperature: Option<u16>,
    #[serde(default)]
    pub spotify_token: Option<String>,
}

fn default_brightness() -> u8 {
    DEFAULT_BRIGHTNESS
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            source: ColorSource::Manual,
            energy_sync: false,
            rhythmic_cycle: false,
            selected_devices: BTreeSet::new(),
            groups: BTreeMap::new(),
            presets: Vec::new(),
            routing: BTreeMap::new(),
            sampler_positions: default_sampler_positions(),
            manual_color: None,
            brightness: DEFAULT_BRIGHTNESS,
            color_temperature: None,
            spotify_token: None,
        }
    }
}

struct Inner {
    state: SyncState,
    selected: BTreeSet<String>,
    manual_color: Option<Rgb>,
    spotify_token: Option<String>,
}

/// Owner of the observable `SyncState` plus the persisted settings.
/// The sync core is the only writer; the HTTP API only reads.
pub struct StateManager {
    inner: RwLock<Inner>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        let persistent = Self::load_persistent(&state_file);

        let state = SyncState {
            rev: 1,
            source: persistent.source,
            energy_sync: persistent.energy_sync,
            rhythmic_cycle: persistent.rhythmic_cycle,
            current_color: persistent.manual_color,
            brightness: persistent.brightness,
            color_temperature: persistent.color_temperature,
            routing: persistent.routing,
            sampler_positions: persistent.sampler_positions,
            groups: persistent.groups,
            presets: persistent.presets,
            spotify_authorized: persistent.spotify_token.is_some(),
            ..SyncState::default()
        };

        Self {
            inner: RwLock::new(Inner {
                state,
                selected: persistent.selected_devices,
                manual_color: persistent.manual_color,
                spotify_token: persistent.spotify_token,
            }),
            state_file,
        }
    }

    pub async fn get_state(&self) -> SyncState {
        self.inner.read().await.state.clone()
    }

    pub async fn spotify_token(&self) -> Option<String> {
        self.inner.read().await.spotify_token.clone()
    }

    pub async fn group(&self, name: &str) -> Option<Vec<String>> {
        self.inner.read().await.state.groups.get(name).cloned()
    }

    pub async fn preset(&self, name: &str) -> Option<Preset> {
        let inner = self.inner.read().await;
        inner.state.presets.iter().find(|p| p.name == name).cloned()
    }

    // ── persisted settings ────────────────────────────────────────────────────

    pub async fn set_spotify_token(&self, token: Option<String>) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.spotify_authorized = token.is_some();
            inner.spotify_token = token;
            inner.state.rev += 1;
        }
        self.save().await
    }

    /// Replace the device list.  Selection is remembered by id, so devices
    /// that disappear and come back keep their selection.
    pub async fn set_devices(&self, mut devices: Vec<Device>) {
        let mut inner = self.inner.write().await;
        for d in devices.iter_mut() {
            d.is_selected = inner.selected.contains(&d.id);
        }
        inner.state.devices = devices;
        inner.state.rev += 1;
    }

    pub async fn set_selected(&self, device_id: &str, selected: bool) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            if selected {
                inner.selected.insert(device_id.to_string());
            } else {
                inner.selected.remove(device_id);
            }
            Self::apply_selection(&mut inner);
        }
        self.save().await
    }

    /// Select exactly `ids` (unknown ids are remembered for when they appear).
    pub async fn select_only(&self, ids: &[String]) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.selected = ids.iter().cloned().collect();
            Self::apply_selection(&mut inner);
        }
        self.save().await
    }

    fn apply_selection(inner: &mut Inner) {
        let Inner {
            state, selected, ..
        } = inner;
        for d in state.devices.iter_mut() {
            d.is_selected = selected.contains(&d.id);
        }
        state.rev += 1;
    }

    pub async fn save_group(&self, name: String, device_ids: Vec<String>) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.groups.insert(name, device_ids);
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn delete_group(&self, name: &str) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.groups.remove(name);
            inner.state.rev += 1;
        }
        self.save().await
    }

    /// Insert or replace a preset by name.
    pub async fn save_preset(&self, preset: Preset) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            match inner.state.presets.iter_mut().find(|p| p.name == preset.name) {
                Some(existing) => *existing = preset,
                None => inner.state.presets.push(preset),
            }
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn delete_preset(&self, name: &str) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.presets.retain(|p| p.name != name);
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_source(&self, source: ColorSource) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.source = source;
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_energy_sync(&self, enabled: bool) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.energy_sync = enabled;
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_rhythmic_cycle(&self, enabled: bool) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.rhythmic_cycle = enabled;
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_routing(&self, device_id: &str, slot: Option<usize>) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            match slot {
                Some(slot) => {
                    inner.state.routing.insert(device_id.to_string(), slot);
                }
                None => {
                    inner.state.routing.remove(device_id);
                }
            }
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_sampler_positions(
        &self,
        positions: Vec<SamplerPosition>,
    ) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.sampler_positions = positions;
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_manual_color(&self, color: Rgb) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.manual_color = Some(color);
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_brightness(&self, brightness: u8) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.brightness = brightness;
            inner.state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_color_temperature(&self, kelvin: u16) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.state.color_temperature = Some(kelvin);
            inner.state.rev += 1;
        }
        self.save().await
    }

    // ── volatile state ────────────────────────────────────────────────────────

    pub async fn set_playback(
        &self,
        track: Option<Track>,
        is_playing: bool,
        features: Option<AudioFeatures>,
    ) {
        let mut inner = self.inner.write().await;
        inner.state.track = track;
        inner.state.is_playing = is_playing;
        inner.state.features = features;
        inner.state.rev += 1;
    }

    pub async fn set_palette(&self, palette: Vec<Rgb>) {
        let mut inner = self.inner.write().await;
        inner.state.palette = palette;
        inner.state.rev += 1;
    }

    pub async fn set_cycle_index(&self, cycle_index: u64) {
        let mut inner = self.inner.write().await;
        inner.state.cycle_index = cycle_index;
        inner.state.rev += 1;
    }

    /// Record colours that were actually delivered.  A uniform colour
    /// (single-colour sources) also becomes `current_color`.
    pub async fn record_device_colors(&self, colors: &[(String, Rgb)], uniform: Option<Rgb>) {
        let mut inner = self.inner.write().await;
        for (id, color) in colors {
            inner.state.device_colors.insert(id.clone(), *color);
        }
        if uniform.is_some() {
            inner.state.current_color = uniform;
        }
        inner.state.rev += 1;
    }

    pub async fn set_device_status(&self, device_id: &str, status: DeviceStatus) {
        let mut inner = self.inner.write().await;
        inner
            .state
            .device_status
            .insert(device_id.to_string(), status);
        inner.state.rev += 1;
    }

    pub async fn set_notice(&self, message: String) {
        let mut inner = self.inner.write().await;
        inner.state.last_notice = Some(message);
        inner.state.rev += 1;
    }

    // ── persistence ───────────────────────────────────────────────────────────

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = {
            let inner = self.inner.read().await;
            PersistentState {
                source: inner.state.source,
                energy_sync: inner.state.energy_sync,
                rhythmic_cycle: inner.state.rhythmic_cycle,
                selected_devices: inner.selected.clone(),
                groups: inner.state.groups.clone(),
                presets: inner.state.presets.clone(),
                routing: inner.state.routing.clone(),
                sampler_positions: inner.state.sampler_positions.clone(),
                manual_color: inner.manual_color,
                brightness: inner.state.brightness,
                color_temperature: inner.state.color_temperature,
                spotify_token: inner.spotify_token.clone(),
            }
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        let Ok(content) = std::fs::read_to_string(state_file) else {
            return PersistentState::default();
        };
        match serde_json::from_str::<PersistentState>(&content) {
            Ok(persistent) => persistent,
            Err(e) => {
                warn!("Ignoring unreadable state file {}: {}", state_file.display(), e);
                PersistentState::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> Device {
        Device {
            id: id.into(),
            name: format!("Bulb {}", id),
            device_type: "Color Bulb".into(),
            is_selected: false,
        }
    }

    #[tokio::test]
    async fn test_defaults_without_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let sm = StateManager::new(dir.path().join("state.json"));
        let state = sm.get_state().await;
        assert_eq!(state.source, ColorSource::Manual);
        assert_eq!(state.brightness, DEFAULT_BRIGHTNESS);
        assert_eq!(state.sampler_positions.len(), 2);
        assert!(!state.spotify_authorized);
    }

    #[tokio::test]
    async fn test_settings_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let sm = StateManager::new(path.clone());
        sm.set_source(ColorSource::SpotifyMulti).await.unwrap();
        sm.set_energy_sync(true).await.unwrap();
        sm.set_routing("B", Some(1)).await.unwrap();
        sm.select_only(&["B".to_string()]).await.unwrap();
        sm.save_group("den".into(), vec!["A".into(), "B".into()])
            .await
            .unwrap();
        sm.save_preset(Preset {
            name: "sunset".into(),
            color: Rgb::new(255, 100, 0),
            brightness: Some(40),
        })
        .await
        .unwrap();
        sm.set_manual_color(Rgb::new(1, 2, 3)).await.unwrap();
        sm.set_spotify_token(Some("tok".into())).await.unwrap();
        sm.set_palette(vec![Rgb::WHITE]).await;

        let reloaded = StateManager::new(path);
        reloaded.set_devices(vec![device("A"), device("B")]).await;
        let state = reloaded.get_state().await;
        assert_eq!(state.source, ColorSource::SpotifyMulti);
        assert!(state.energy_sync);
        assert_eq!(state.routing.get("B"), Some(&1));
        assert_eq!(state.groups["den"], vec!["A".to_string(), "B".to_string()]);
        assert_eq!(state.presets[0].brightness, Some(40));
        assert_eq!(state.current_color, Some(Rgb::new(1, 2, 3)));
        assert!(state.spotify_authorized);
        assert_eq!(reloaded.spotify_token().await.as_deref(), Some("tok"));
        // Volatile values are not persisted.
        assert!(state.palette.is_empty());
        let selected: Vec<_> = state.active_devices().iter().map(|d| d.id.clone()).collect();
        assert_eq!(selected, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_state_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let sm = StateManager::new(path);
        assert_eq!(sm.get_state().await.source, ColorSource::Manual);
    }

    #[tokio::test]
    async fn test_preset_upsert_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let sm = StateManager::new(dir.path().join("state.json"));
        let p = |b| Preset {
            name: "calm".into(),
            color: Rgb::new(0, 0, 255),
            brightness: b,
        };
        sm.save_preset(p(Some(10))).await.unwrap();
        sm.save_preset(p(Some(20))).await.unwrap();
        assert_eq!(sm.get_state().await.presets.len(), 1);
        assert_eq!(sm.preset("calm").await.unwrap().brightness, Some(20));
        sm.delete_preset("calm").await.unwrap();
        assert!(sm.preset("calm").await.is_none());
    }

    #[tokio::test]
    async fn test_selection_follows_device_ids() {
        let dir = tempfile::tempdir().unwrap();
        let sm = StateManager::new(dir.path().join("state.json"));
        sm.set_devices(vec![device("A"), device("B")]).await;
        sm.set_selected("A", true).await.unwrap();
        sm.set_devices(vec![device("B"), device("A"), device("C")]).await;
        let state = sm.get_state().await;
        let selected: Vec<_> = state.active_devices().iter().map(|d| d.id.clone()).collect();
        assert_eq!(selected, vec!["A".to_string()]);
    }
}
