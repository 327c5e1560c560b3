//! Colour values and the energy-driven saturation curve.
//!
//! `Rgb` travels as a `#rrggbb` string on the wire and in the settings file.

use palette::{FromColor, Hsl, Srgb};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Energy above this raises saturation.
pub const ENERGY_HIGH: f32 = 0.6;
/// Energy below this lowers saturation.
pub const ENERGY_LOW: f32 = 0.3;
const ENERGY_GAIN: f32 = 0.75;
const LOW_ENERGY_DESATURATION: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#rrggbb`, `rrggbb` or the short `#rgb` form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let hex = s.trim().trim_start_matches('#');
        // from_str_radix alone would also take a sign.
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(hex.get(range)?, 16).ok();
        match hex.len() {
            6 => Some(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?)),
            3 => {
                let r = channel(0..1)?;
                let g = channel(1..2)?;
                let b = channel(2..3)?;
                Some(Self::new(r * 17, g * 17, b * 17))
            }
            _ => None,
        }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    /// Parameter string for the `setColor` device command.
    pub fn command_param(&self) -> String {
        format!("{}:{}:{}", self.r, self.g, self.b)
    }

    /// Parse a `R:G:B` status string as reported by the device API.
    pub fn from_command_param(s: &str) -> Option<Self> {
        let mut parts = s.split(':').map(|p| p.trim().parse::<u8>().ok());
        let r = parts.next()??;
        let g = parts.next()??;
        let b = parts.next()??;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(r, g, b))
    }

    pub fn saturation(&self) -> f32 {
        let hsl: Hsl = Hsl::from_color(self.to_srgb());
        hsl.saturation
    }

    fn to_srgb(self) -> Srgb {
        Srgb::new(self.r, self.g, self.b).into_format::<f32>()
    }

    fn from_srgb(srgb: Srgb) -> Self {
        let out: Srgb<u8> = srgb.into_format();
        Self::new(out.red, out.green, out.blue)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Rgb {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Rgb::from_hex(&value).ok_or_else(|| format!("invalid hex colour: {}", value))
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_hex()
    }
}

/// Saturation after energy modulation.  Both thresholds are exclusive:
/// energy exactly 0.6 or 0.3 leaves saturation untouched.
pub fn energy_saturation(saturation: f32, energy: f32) -> f32 {
    if energy > ENERGY_HIGH {
        (saturation + (energy - ENERGY_HIGH) * ENERGY_GAIN).min(1.0)
    } else if energy < ENERGY_LOW {
        (saturation - LOW_ENERGY_DESATURATION).max(0.0)
    } else {
        saturation
    }
}

/// Round-trip `color` through HSL with its saturation modulated by `energy`.
/// Hue and lightness are preserved; brightness is a separate channel.
pub fn modulate_energy(color: Rgb, energy: f32) -> Rgb {
    if (ENERGY_LOW..=ENERGY_HIGH).contains(&energy) {
        return color;
    }
    let mut hsl: Hsl = Hsl::from_color(color.to_srgb());
    hsl.saturation = energy_saturation(hsl.saturation, energy);
    Rgb::from_srgb(Srgb::from_color(hsl))
}
