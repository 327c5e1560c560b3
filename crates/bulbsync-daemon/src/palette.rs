//! Album-art colour extraction: palette sampling for multi-colour mode and a
//! dominant colour for single-colour mode.  Image failures resolve to white.

use std::collections::BTreeMap;
use std::time::Duration;

use bulbsync_proto::color::Rgb;
use bulbsync_proto::protocol::SamplerPosition;
use image::RgbImage;
use tracing::warn;

use crate::error::{ApiError, ApiResult};

/// Smallest palette the resolver ever sees.
pub const MIN_PALETTE_LEN: usize = 2;
const DOMINANT_SAMPLE_EDGE: u32 = 64;
/// Bits dropped per channel when bucketing colours.
const QUANT_SHIFT: u8 = 3;

#[allow(async_fn_in_trait)]
pub trait ImageLoader {
    async fn load(&self, url: &str) -> ApiResult<RgbImage>;
}

pub struct HttpImageLoader {
    http: reqwest::Client,
}

impl HttpImageLoader {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { http })
    }
}

impl ImageLoader for HttpImageLoader {
    async fn load(&self, url: &str) -> ApiResult<RgbImage> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        Ok(image::load_from_memory(&bytes)?.to_rgb8())
    }
}

/// Load `url` once and read one pixel per position.  Always returns at
/// least [`MIN_PALETTE_LEN`] colours.
pub async fn extract_palette<L: ImageLoader>(
    loader: &L,
    url: &str,
    positions: &[SamplerPosition],
) -> Vec<Rgb> {
    let samples = match loader.load(url).await {
        Ok(img) => sample_positions(&img, positions),
        Err(e) => {
            warn!("Palette: failed to load {}: {}", url, e);
            vec![Rgb::WHITE; positions.len()]
        }
    };
    pad_palette(samples)
}

pub fn sample_positions(img: &RgbImage, positions: &[SamplerPosition]) -> Vec<Rgb> {
    positions.iter().filter_map(|p| sample_pixel(img, p)).collect()
}

fn sample_pixel(img: &RgbImage, pos: &SamplerPosition) -> Option<Rgb> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let x = ((pos.x / 100.0 * w as f32) as u32).min(w - 1);
    let y = ((pos.y / 100.0 * h as f32) as u32).min(h - 1);
    let [r, g, b] = img.get_pixel(x, y).0;
    Some(Rgb::new(r, g, b))
}

/// Duplicate the first colour (white if there is none) up to the minimum arity.
pub fn pad_palette(mut palette: Vec<Rgb>) -> Vec<Rgb> {
    let filler = palette.first().copied().unwrap_or(Rgb::WHITE);
    while palette.len() < MIN_PALETTE_LEN {
        palette.push(filler);
    }
    palette
}

pub async fn dominant_color<L: ImageLoader>(loader: &L, url: &str) -> Rgb {
    match loader.load(url).await {
        Ok(img) => dominant_of(&img),
        Err(e) => {
            warn!("Palette: failed to load {}: {}", url, e);
            Rgb::WHITE
        }
    }
}

/// Mean colour of the most populated 5-bit-per-channel bucket of a
/// thumbnail of `img`.
pub fn dominant_of(img: &RgbImage) -> Rgb {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Rgb::WHITE;
    }

    let scale = (DOMINANT_SAMPLE_EDGE as f32 / w.max(h) as f32).min(1.0);
    let tw = ((w as f32 * scale).round() as u32).max(1);
    let th = ((h as f32 * scale).round() as u32).max(1);
    let thumb = image::imageops::thumbnail(img, tw, th);

    // bucket -> (count, sum r, sum g, sum b)
    let mut buckets: BTreeMap<(u8, u8, u8), (u64, u64, u64, u64)> = BTreeMap::new();
    for px in thumb.pixels() {
        let [r, g, b] = px.0;
        let key = (r >> QUANT_SHIFT, g >> QUANT_SHIFT, b >> QUANT_SHIFT);
        let entry = buckets.entry(key).or_default();
        entry.0 += 1;
        entry.1 += r as u64;
        entry.2 += g as u64;
        entry.3 += b as u64;
    }

    // Ties go to the lowest bucket key.
    let best = buckets
        .values()
        .fold(None::<&(u64, u64, u64, u64)>, |best, b| match best {
            Some(cur) if cur.0 >= b.0 => Some(cur),
            _ => Some(b),
        });

    match best {
        Some(&(n, r, g, b)) if n > 0 => Rgb::new((r / n) as u8, (g / n) as u8, (b / n) as u8),
        _ => Rgb::WHITE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeImages;

    /// Left half red, right half blue.
    fn split_image() -> RgbImage {
        RgbImage::from_fn(100, 50, |x, _| {
            if x < 50 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        })
    }

    #[tokio::test]
    async fn test_palette_samples_positions_from_one_load() {
        let images = FakeImages::new();
        images.insert("art", split_image());
        let positions = vec![SamplerPosition::new(25.0, 50.0), SamplerPosition::new(75.0, 50.0)];

        let palette = extract_palette(&images, "art", &positions).await;
        assert_eq!(palette, vec![Rgb::new(255, 0, 0), Rgb::new(0, 0, 255)]);
        assert_eq!(images.loads(), 1);
    }

    #[test]
    fn test_edge_positions_clamp_into_image() {
        let img = split_image();
        let px = sample_positions(&img, &[SamplerPosition::new(100.0, 100.0)]);
        assert_eq!(px, vec![Rgb::new(0, 0, 255)]);
    }

    #[tokio::test]
    async fn test_load_failure_gives_white_slots() {
        let images = FakeImages::new();
        let positions = vec![
            SamplerPosition::new(10.0, 10.0),
            SamplerPosition::new(50.0, 50.0),
            SamplerPosition::new(90.0, 90.0),
        ];
        let palette = extract_palette(&images, "missing", &positions).await;
        assert_eq!(palette, vec![Rgb::WHITE; 3]);
    }

    #[tokio::test]
    async fn test_palette_minimum_arity() {
        let images = FakeImages::new();
        images.insert("art", split_image());

        let one = extract_palette(&images, "art", &[SamplerPosition::new(0.0, 0.0)]).await;
        assert_eq!(one, vec![Rgb::new(255, 0, 0); 2]);

        let none = extract_palette(&images, "art", &[]).await;
        assert_eq!(none, vec![Rgb::WHITE; 2]);
    }

    #[test]
    fn test_dominant_picks_largest_bucket() {
        // 70% green, 30% red.
        let img = RgbImage::from_fn(100, 100, |x, _| {
            if x < 70 {
                image::Rgb([10, 200, 12])
            } else {
                image::Rgb([220, 5, 5])
            }
        });
        let c = dominant_of(&img);
        assert!(c.g > 150 && c.r < 60, "got {}", c);
    }

    #[tokio::test]
    async fn test_dominant_failure_is_white() {
        let images = FakeImages::new();
        assert_eq!(dominant_color(&images, "nope").await, Rgb::WHITE);
    }
}
