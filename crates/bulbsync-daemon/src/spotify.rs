//! Spotify Web API client: now-playing, history fallback, audio features and
//! playback control.  The bearer token comes from an external PKCE flow.

use std::time::Duration;

use bulbsync_proto::config::SpotifyConfig;
use bulbsync_proto::protocol::{AudioFeatures, Track};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};

/// Live playback as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Playback {
    pub track: Track,
    pub is_playing: bool,
}

#[allow(async_fn_in_trait)]
pub trait PlaybackProvider {
    /// `None` when nothing (or a non-track item) is loaded.
    async fn current_playback(&self, token: &str) -> ApiResult<Option<Playback>>;
    /// Most recently played track, marked `is_fallback`.
    async fn recently_played(&self, token: &str) -> ApiResult<Option<Track>>;
    async fn audio_features(&self, token: &str, track_id: &str) -> ApiResult<AudioFeatures>;
    async fn next(&self, token: &str) -> ApiResult<()>;
    async fn previous(&self, token: &str) -> ApiResult<()>;
    async fn toggle_play(&self, token: &str, currently_playing: bool) -> ApiResult<()>;
}

pub struct SpotifyClient {
    http: reqwest::Client,
    api_base: String,
}

impl SpotifyClient {
    pub fn new(config: &SpotifyConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Send and return the body, or `None` for 204 No Content.
    async fn fetch(&self, req: RequestBuilder, token: &str) -> ApiResult<Option<String>> {
        let response = req.bearer_auth(token).send().await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16()));
        }
        Ok(Some(response.text().await?))
    }

    async fn control(&self, req: RequestBuilder, token: &str) -> ApiResult<()> {
        self.fetch(req.header("Content-Length", "0"), token).await?;
        Ok(())
    }
}

impl PlaybackProvider for SpotifyClient {
    async fn current_playback(&self, token: &str) -> ApiResult<Option<Playback>> {
        let req = self.http.get(self.url("/me/player/currently-playing"));
        match self.fetch(req, token).await? {
            Some(body) if !body.trim().is_empty() => parse_currently_playing(&body),
            _ => Ok(None),
        }
    }

    async fn recently_played(&self, token: &str) -> ApiResult<Option<Track>> {
        let req = self
            .http
            .get(self.url("/me/player/recently-played"))
            .query(&[("limit", "1")]);
        match self.fetch(req, token).await? {
            Some(body) => parse_recently_played(&body),
            None => Ok(None),
        }
    }

    async fn audio_features(&self, token: &str, track_id: &str) -> ApiResult<AudioFeatures> {
        let req = self.http.get(self.url(&format!("/audio-features/{}", track_id)));
        match self.fetch(req, token).await? {
            Some(body) => parse_audio_features(&body),
            None => Err(ApiError::Status(StatusCode::NO_CONTENT.as_u16())),
        }
    }

    async fn next(&self, token: &str) -> ApiResult<()> {
        self.control(self.http.post(self.url("/me/player/next")), token)
            .await
    }

    async fn previous(&self, token: &str) -> ApiResult<()> {
        self.control(self.http.post(self.url("/me/player/previous")), token)
            .await
    }

    async fn toggle_play(&self, token: &str, currently_playing: bool) -> ApiResult<()> {
        let path = if currently_playing {
            "/me/player/pause"
        } else {
            "/me/player/play"
        };
        self.control(self.http.put(self.url(path)), token).await
    }
}

// ── wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CurrentlyPlaying {
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    currently_playing_type: Option<String>,
    item: Option<TrackObject>,
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayed {
    #[serde(default)]
    items: Vec<PlayHistory>,
}

#[derive(Debug, Deserialize)]
struct PlayHistory {
    track: TrackObject,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    id: Option<String>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    artists: Vec<ArtistObject>,
    album: Option<AlbumObject>,
    #[serde(default)]
    is_local: bool,
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AlbumObject {
    #[serde(default)]
    images: Vec<ImageObject>,
}

#[derive(Debug, Deserialize)]
struct ImageObject {
    url: String,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FeaturesObject {
    tempo: f32,
    energy: f32,
    #[serde(default = "unknown_key")]
    key: i8,
    #[serde(default)]
    mode: u8,
}

fn unknown_key() -> i8 {
    -1
}

impl TrackObject {
    /// Local files have no catalogue id; their URI still identifies them.
    fn into_track(self, is_fallback: bool) -> Option<Track> {
        let id = self.id.or(self.uri)?;
        let album_image_url = self.album.and_then(|a| {
            a.images
                .into_iter()
                .max_by_key(|i| i.width.unwrap_or(0) as u64 * i.height.unwrap_or(0) as u64)
                .map(|i| i.url)
        });
        Some(Track {
            id,
            name: self.name,
            artists: self.artists.into_iter().map(|a| a.name).collect(),
            album_image_url,
            is_local: self.is_local,
            is_fallback,
        })
    }
}

fn parse_currently_playing(body: &str) -> ApiResult<Option<Playback>> {
    let cp: CurrentlyPlaying = serde_json::from_str(body)?;
    if cp.currently_playing_type.as_deref().map_or(false, |t| t != "track") {
        return Ok(None);
    }
    Ok(cp
        .item
        .and_then(|item| item.into_track(false))
        .map(|track| Playback {
            track,
            is_playing: cp.is_playing,
        }))
}

fn parse_recently_played(body: &str) -> ApiResult<Option<Track>> {
    let rp: RecentlyPlayed = serde_json::from_str(body)?;
    Ok(rp
        .items
        .into_iter()
        .next()
        .and_then(|h| h.track.into_track(true)))
}

fn parse_audio_features(body: &str) -> ApiResult<AudioFeatures> {
    let f: FeaturesObject = serde_json::from_str(body)?;
    Ok(AudioFeatures {
        tempo: f.tempo,
        energy: f.energy,
        key: f.key,
        mode: f.mode,
    })
}
