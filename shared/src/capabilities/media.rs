use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{AppError, ErrorKind};

pub const MAX_URL_LENGTH: usize = 2048;
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https", "file", "content", "ph", "asset"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailOptions {
    /// Frame position in the video, in milliseconds.
    pub time_ms: u64,
    pub quality: f32,
}

/// Platform video frame extractor.
#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    async fn generate(
        &self,
        source_uri: &str,
        options: ThumbnailOptions,
    ) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum GenerationError {
    #[error("invalid media url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("source could not be decoded: {message}")]
    Decode { message: String },

    #[error("generator unavailable: {message}")]
    Unavailable { message: String },
}

impl GenerationError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl From<GenerationError> for AppError {
    fn from(e: GenerationError) -> Self {
        let kind = match &e {
            GenerationError::InvalidUrl { .. } => ErrorKind::Validation,
            _ => ErrorKind::Generation,
        };
        AppError::new(kind, e.to_string())
    }
}

/// A source URL the generator is allowed to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaUrl(String);

impl MediaUrl {
    pub fn parse(raw: &str) -> Result<Self, GenerationError> {
        if raw.is_empty() || raw.len() > MAX_URL_LENGTH {
            return Err(GenerationError::InvalidUrl {
                url: raw.chars().take(50).collect(),
                reason: format!("length must be 1..={MAX_URL_LENGTH}"),
            });
        }
        let parsed = Url::parse(raw).map_err(|e| GenerationError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
            return Err(GenerationError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
