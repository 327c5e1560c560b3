//! Colour resolution: which colour each active device should show.
//!
//! Everything here is a pure function of its inputs so that identical inputs
//! always resolve to identical per-device colours.

use std::collections::BTreeMap;
use std::time::Duration;

use bulbsync_proto::color::{modulate_energy, Rgb};
use bulbsync_proto::protocol::{AudioFeatures, ColorSource};

/// Energy above which a cycle spans 8 beats instead of 16.
const FAST_CYCLE_ENERGY: f32 = 0.7;
const FAST_CYCLE_BEATS: f64 = 8.0;
const SLOW_CYCLE_BEATS: f64 = 16.0;
/// Tempos outside this range are treated as unknown.
const TEMPO_RANGE_BPM: std::ops::RangeInclusive<f32> = 1.0..=1000.0;

/// Palette slot for the device at `ordinal` among the active devices.
///
/// `cycle_index` is `Some` only while rhythmic cycling is running.  An explicit
/// routing override replaces the computed slot.  Both wrap modulo the palette
/// length, so an override left over from a longer palette still lands on a
/// valid slot.
pub fn slot_for_device(
    ordinal: usize,
    palette_len: usize,
    cycle_index: Option<u64>,
    routing_override: Option<usize>,
) -> usize {
    if palette_len == 0 {
        return 0;
    }
    if let Some(slot) = routing_override {
        return slot % palette_len;
    }
    match cycle_index {
        Some(cycle) => ((ordinal as u64 + cycle) % palette_len as u64) as usize,
        None => ordinal % palette_len,
    }
}

/// Inputs for one multi-colour resolver pass.
pub struct PaletteResolve<'a> {
    /// Active device ids in ordinal order.
    pub device_ids: &'a [String],
    pub palette: &'a [Rgb],
    pub routing: &'a BTreeMap<String, usize>,
    pub cycle_index: Option<u64>,
    /// Track energy when energy sync is on and features are known.
    pub energy: Option<f32>,
}

/// Per-device target colours for palette mode.  Empty when there is no palette.
pub fn resolve_palette(input: &PaletteResolve<'_>) -> Vec<(String, Rgb)> {
    if input.palette.is_empty() {
        return Vec::new();
    }
    input
        .device_ids
        .iter()
        .enumerate()
        .map(|(ordinal, id)| {
            let slot = slot_for_device(
                ordinal,
                input.palette.len(),
                input.cycle_index,
                input.routing.get(id).copied(),
            );
            let color = apply_energy(input.palette[slot], input.energy);
            (id.clone(), color)
        })
        .collect()
}

/// One colour applied to every active device.
pub fn resolve_uniform(device_ids: &[String], color: Rgb, energy: Option<f32>) -> Vec<(String, Rgb)> {
    let color = apply_energy(color, energy);
    device_ids.iter().map(|id| (id.clone(), color)).collect()
}

pub fn apply_energy(color: Rgb, energy: Option<f32>) -> Rgb {
    match energy {
        Some(e) => modulate_energy(color, e),
        None => color,
    }
}

/// Energy to modulate with, if energy sync applies to `source` at all.
pub fn modulation_energy(
    source: ColorSource,
    energy_sync: bool,
    features: Option<&AudioFeatures>,
) -> Option<f32> {
    if !energy_sync || !source.is_spotify() {
        return None;
    }
    features.map(|f| f.energy)
}

/// Rhythmic cycling runs only in palette mode, with the flag on, while
/// playing, with a known tempo.
pub fn cycling_active(
    source: ColorSource,
    rhythmic_cycle: bool,
    is_playing: bool,
    features: Option<&AudioFeatures>,
) -> bool {
    source == ColorSource::SpotifyMulti
        && rhythmic_cycle
        && is_playing
        && features.map_or(false, tempo_known)
}

fn tempo_known(features: &AudioFeatures) -> bool {
    TEMPO_RANGE_BPM.contains(&features.tempo)
}

/// Time between cycle-index advances: `60000 / bpm * beats` ms, with 8 beats
/// for energetic tracks and 16 otherwise.
pub fn cycle_interval(features: &AudioFeatures) -> Option<Duration> {
    if !tempo_known(features) {
        return None;
    }
    let beats = if features.energy > FAST_CYCLE_ENERGY {
        FAST_CYCLE_BEATS
    } else {
        SLOW_CYCLE_BEATS
    };
    let ms = 60_000.0 / features.tempo as f64 * beats;
    Duration::try_from_secs_f64(ms / 1000.0).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(tempo: f32, energy: f32) -> AudioFeatures {
        AudioFeatures {
            tempo,
            energy,
            key: 0,
            mode: 1,
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("dev{}", i)).collect()
    }

    #[test]
    fn test_rhythmic_rotation_first_device() {
        let slots: Vec<usize> = (0..3)
            .map(|cycle| slot_for_device(0, 2, Some(cycle), None))
            .collect();
        assert_eq!(slots, vec![0, 1, 0]);
    }

    #[test]
    fn test_rotation_across_devices() {
        let palette = [Rgb::new(255, 0, 0), Rgb::new(0, 0, 255)];
        let devices = ids(3);
        let routing = BTreeMap::new();
        let colors_at = |cycle| {
            resolve_palette(&PaletteResolve {
                device_ids: &devices,
                palette: &palette,
                routing: &routing,
                cycle_index: Some(cycle),
                energy: None,
            })
            .into_iter()
            .map(|(_, c)| c)
            .collect::<Vec<_>>()
        };
        assert_eq!(colors_at(0), vec![palette[0], palette[1], palette[0]]);
        assert_eq!(colors_at(1), vec![palette[1], palette[0], palette[1]]);
    }

    #[test]
    fn test_default_slots_wrap_without_cycling() {
        assert_eq!(slot_for_device(0, 2, None, None), 0);
        assert_eq!(slot_for_device(1, 2, None, None), 1);
        assert_eq!(slot_for_device(2, 2, None, None), 0);
    }

    #[test]
    fn test_routing_override_wins_and_wraps() {
        assert_eq!(slot_for_device(0, 3, Some(7), Some(2)), 2);
        // Override from an older, longer palette.
        assert_eq!(slot_for_device(0, 2, None, Some(5)), 1);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let palette = [Rgb::new(10, 20, 30), Rgb::new(200, 100, 50), Rgb::new(0, 255, 0)];
        let devices = ids(4);
        let mut routing = BTreeMap::new();
        routing.insert("dev2".to_string(), 0);
        let input = PaletteResolve {
            device_ids: &devices,
            palette: &palette,
            routing: &routing,
            cycle_index: Some(5),
            energy: Some(0.9),
        };
        assert_eq!(resolve_palette(&input), resolve_palette(&input));
        assert_eq!(resolve_palette(&input).len(), 4);
    }

    #[test]
    fn test_empty_palette_resolves_nothing() {
        let devices = ids(2);
        let routing = BTreeMap::new();
        let out = resolve_palette(&PaletteResolve {
            device_ids: &devices,
            palette: &[],
            routing: &routing,
            cycle_index: None,
            energy: None,
        });
        assert!(out.is_empty());
    }

    #[test]
    fn test_modulation_only_for_spotify_sources() {
        let f = features(120.0, 0.9);
        assert_eq!(modulation_energy(ColorSource::SpotifyMulti, true, Some(&f)), Some(0.9));
        assert_eq!(modulation_energy(ColorSource::SpotifySingle, true, Some(&f)), Some(0.9));
        assert_eq!(modulation_energy(ColorSource::Manual, true, Some(&f)), None);
        assert_eq!(modulation_energy(ColorSource::ScreenSync, true, Some(&f)), None);
        assert_eq!(modulation_energy(ColorSource::SpotifyMulti, false, Some(&f)), None);
        assert_eq!(modulation_energy(ColorSource::SpotifyMulti, true, None), None);
    }

    #[test]
    fn test_cycle_interval() {
        // 120 bpm: 500 ms per beat.
        assert_eq!(cycle_interval(&features(120.0, 0.5)), Some(Duration::from_secs(8)));
        assert_eq!(cycle_interval(&features(120.0, 0.8)), Some(Duration::from_secs(4)));
        // 0.7 is not "above 0.7".
        assert_eq!(cycle_interval(&features(120.0, 0.7)), Some(Duration::from_secs(8)));
        assert_eq!(cycle_interval(&features(0.0, 0.8)), None);
    }

    #[test]
    fn test_implausible_tempo_is_unknown() {
        for tempo in [1e-20, 0.5, -120.0, 5000.0, f32::NAN, f32::INFINITY] {
            let f = features(tempo, 0.5);
            assert_eq!(cycle_interval(&f), None, "tempo {}", tempo);
            assert!(!cycling_active(ColorSource::SpotifyMulti, true, true, Some(&f)));
        }
        // Edges of the accepted range still cycle.
        assert_eq!(cycle_interval(&features(1.0, 0.5)), Some(Duration::from_secs(960)));
        assert!(cycle_interval(&features(1000.0, 0.5)).is_some());
    }

    #[test]
    fn test_cycling_requires_every_condition() {
        let f = features(100.0, 0.5);
        assert!(cycling_active(ColorSource::SpotifyMulti, true, true, Some(&f)));
        assert!(!cycling_active(ColorSource::SpotifySingle, true, true, Some(&f)));
        assert!(!cycling_active(ColorSource::SpotifyMulti, false, true, Some(&f)));
        assert!(!cycling_active(ColorSource::SpotifyMulti, true, false, Some(&f)));
        assert!(!cycling_active(ColorSource::SpotifyMulti, true, true, None));
        let no_tempo = features(0.0, 0.5);
        assert!(!cycling_active(ColorSource::SpotifyMulti, true, true, Some(&no_tempo)));
    }
}
