use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::EntityId;
use crate::{AppError, ErrorKind};

pub const MAX_PAGE_SIZE: u32 = 100;

/// Backend REST surface consumed by the cache. Wire format is the host's
/// concern; items arrive as JSON values and are decoded by the list that
/// requested them.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_page(
        &self,
        resource: &str,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<serde_json::Value>, ApiError>;

    async fn confirm_like(&self, post_id: &EntityId, liked: bool) -> Result<Ack, ApiError>;

    async fn confirm_follow(&self, user_id: &EntityId, following: bool) -> Result<Ack, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse<T> {
    pub items: Vec<T>,
    /// Absent when the endpoint does not report it.
    #[serde(default)]
    pub has_more: Option<bool>,
}

impl<T> PageResponse<T> {
    pub fn new(items: Vec<T>, has_more: Option<bool>) -> Self {
        Self { items, has_more }
    }

    /// Explicit server flag wins; otherwise a full page implies more.
    #[must_use]
    pub fn resolve_has_more(&self, page_size: u32) -> bool {
        self.has_more
            .unwrap_or_else(|| self.items.len() >= page_size as usize)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Server-side like count after the mutation, when the endpoint returns it.
    #[serde(default)]
    pub like_count: Option<u64>,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("network unavailable: {message}")]
    TransientNetwork { message: String },

    #[error("authentication expired")]
    AuthExpired,

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("server rejected the mutation; current value is {server_value}")]
    Conflict { server_value: bool },

    #[error("client error {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl ApiError {
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::AuthExpired,
            408 | 429 => Self::TransientNetwork { message },
            500..=599 => Self::Server { status, message },
            _ => Self::Rejected { status, message },
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. } | Self::Server { .. })
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Self::AuthExpired => ErrorKind::AuthExpired,
            Self::Server { .. } => ErrorKind::Server,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Rejected { .. } => ErrorKind::Validation,
            Self::InvalidResponse { .. } => ErrorKind::Serialization,
        }
    }
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        let mut error = AppError::new(e.kind(), e.to_string());
        if let ApiError::Server { status, .. } | ApiError::Rejected { status, .. } = &e {
            error = error.with_context("http_status", status.to_string());
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_from_status() {
        assert_eq!(ApiError::from_status(401, ""), ApiError::AuthExpired);
        assert!(ApiError::from_status(503, "down").is_retryable());
        assert!(ApiError::from_status(429, "slow down").is_retryable());
        assert!(!ApiError::from_status(404, "gone").is_retryable());
    }

    #[test]
    fn test_api_error_into_app_error() {
        let app: AppError = ApiError::from_status(502, "bad gateway").into();
        assert_eq!(app.kind, ErrorKind::Server);
        assert!(app.is_retryable());
        assert_eq!(app.context.get("http_status").map(String::as_str), Some("502"));

        let app: AppError = ApiError::AuthExpired.into();
        assert!(app.escalates());

        let app: AppError = ApiError::Conflict { server_value: false }.into();
        assert_eq!(app.kind, ErrorKind::Conflict);
    }

    #[test]
    fn test_has_more_resolution() {
        let explicit = PageResponse::new(vec![1, 2], Some(true));
        assert!(explicit.resolve_has_more(20));

        let full_page = PageResponse::new((0..20).collect::<Vec<_>>(), None);
        assert!(full_page.resolve_has_more(20));

        let short_page = PageResponse::new(vec![1], None);
        assert!(!short_page.resolve_has_more(20));

        let explicit_false = PageResponse::new((0..20).collect::<Vec<_>>(), Some(false));
        assert!(!explicit_false.resolve_has_more(20));
    }

    #[test]
    fn test_page_response_deserializes_without_has_more() {
        let page: PageResponse<serde_json::Value> =
            serde_json::from_str(r#"{"items":[{"id":"1"}]}"#).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.has_more, None);
    }
}
