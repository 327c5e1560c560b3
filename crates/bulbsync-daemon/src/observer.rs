//! Track/Playback Observer.
//!
//! Owns the "current track id" and the negative cache of track ids whose
//! audio features are unavailable.  Both live here rather than in the
//! published state so every poll reads them fresh.

use std::collections::HashSet;

use bulbsync_proto::protocol::{AudioFeatures, Track};
use tracing::{debug, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::spotify::PlaybackProvider;

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub track: Track,
    pub is_playing: bool,
    pub features: Option<AudioFeatures>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A different track than last poll; features already fetched (or not).
    TrackChanged(PlaybackSnapshot),
    /// Same track, play/pause flipped or it moved between live playback and
    /// history.  Carries the fresh track.
    PlayStateChanged { track: Track, is_playing: bool },
    NoChange,
    /// Nothing playing and no history to fall back on.
    Idle,
    /// The provider rejected the token.  Not retried.
    TokenExpired,
}

pub struct PlaybackObserver<P> {
    provider: P,
    current_track_id: Option<String>,
    /// Whether the current track came from history rather than live playback.
    current_is_fallback: bool,
    is_playing: bool,
    features: Option<AudioFeatures>,
    unavailable_features: HashSet<String>,
}

impl<P: PlaybackProvider> PlaybackObserver<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            current_track_id: None,
            current_is_fallback: false,
            is_playing: false,
            features: None,
            unavailable_features: HashSet::new(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn features(&self) -> Option<&AudioFeatures> {
        self.features.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    #[cfg(test)]
    pub fn current_track_id(&self) -> Option<&str> {
        self.current_track_id.as_deref()
    }

    #[cfg(test)]
    pub fn is_feature_unavailable(&self, track_id: &str) -> bool {
        self.unavailable_features.contains(track_id)
    }

    /// Forget the current track so the next successful poll reports a change.
    /// The negative cache is kept for the whole session.
    pub fn reset(&mut self) {
        self.current_track_id = None;
        self.current_is_fallback = false;
        self.is_playing = false;
        self.features = None;
    }

    pub async fn poll(&mut self, token: &str) -> ApiResult<PollOutcome> {
        match self.poll_inner(token).await {
            Err(ApiError::Unauthorized) => {
                warn!("Observer: access token rejected");
                self.reset();
                Ok(PollOutcome::TokenExpired)
            }
            other => other,
        }
    }

    async fn poll_inner(&mut self, token: &str) -> ApiResult<PollOutcome> {
        let (track, is_playing) = match self.provider.current_playback(token).await? {
            Some(playback) => (playback.track, playback.is_playing),
            None => match self.provider.recently_played(token).await? {
                Some(track) => (track, false),
                None => {
                    if self.current_track_id.is_none() {
                        return Ok(PollOutcome::NoChange);
                    }
                    self.reset();
                    return Ok(PollOutcome::Idle);
                }
            },
        };

        if self.current_track_id.as_deref() == Some(track.id.as_str()) {
            if self.is_playing != is_playing || self.current_is_fallback != track.is_fallback {
                self.is_playing = is_playing;
                self.current_is_fallback = track.is_fallback;
                debug!(
                    "Observer: is_playing -> {}, fallback -> {}",
                    is_playing, track.is_fallback
                );
                return Ok(PollOutcome::PlayStateChanged { track, is_playing });
            }
            return Ok(PollOutcome::NoChange);
        }

        info!(
            "Observer: track changed to {} ({}){}",
            track.name,
            track.id,
            if track.is_fallback { " [recently played]" } else { "" }
        );
        self.current_track_id = Some(track.id.clone());
        self.current_is_fallback = track.is_fallback;
        self.is_playing = is_playing;
        self.features = self.fetch_features(token, &track).await?;

        Ok(PollOutcome::TrackChanged(PlaybackSnapshot {
            track,
            is_playing,
            features: self.features,
        }))
    }

    /// Fetch once per track.  Local files and ids that failed before are
    /// skipped; a new failure is remembered for the rest of the session.
    async fn fetch_features(
        &mut self,
        token: &str,
        track: &Track,
    ) -> ApiResult<Option<AudioFeatures>> {
        if track.is_local || self.unavailable_features.contains(&track.id) {
            return Ok(None);
        }
        match self.provider.audio_features(token, &track.id).await {
            Ok(features) => Ok(Some(features)),
            Err(ApiError::Unauthorized) => Err(ApiError::Unauthorized),
            Err(e) => {
                warn!("Observer: audio features unavailable for {}: {}", track.id, e);
                self.unavailable_features.insert(track.id.clone());
                Ok(None)
            }
        }
    }
}
