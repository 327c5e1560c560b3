use thiserror::Error;

/// Failure talking to one of the external services (Spotify, SwitchBot, image host).
/// The sync core branches on the kind; everything else travels as `anyhow`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized (token expired)")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("HTTP {0}")]
    Status(u16),
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("network: {0}")]
    Network(#[from] reqwest::Error),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

impl ApiError {
    /// Map a non-success HTTP status onto the error kinds the core cares about.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ApiError::Unauthorized,
            429 => ApiError::RateLimited,
            other => ApiError::Status(other),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(ApiError::from_status(401), ApiError::Unauthorized));
        assert!(matches!(ApiError::from_status(429), ApiError::RateLimited));
        assert!(matches!(ApiError::from_status(403), ApiError::Status(403)));
    }
}
