use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::RealtimeEvent;
use crate::model::UserId;
use crate::{AppError, ErrorKind};

/// Bearer token handed to the realtime transport. Redacted in `Debug`.
#[derive(Clone)]
pub struct AuthToken(Arc<SecretString>);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::new(token.into())))
    }

    /// Only transports should call this.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

/// Live push connection factory.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, user_id: &UserId, token: &AuthToken)
        -> Result<ChannelHandle, TransportError>;
}

/// An open connection. Control calls are fire-and-forget from the cache's
/// point of view; failures surface as frames.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<(), TransportError>;
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError>;
    /// Stop delivering events without tearing the connection down.
    async fn pause(&self) -> Result<(), TransportError>;
    async fn resume(&self) -> Result<(), TransportError>;
    async fn close(&self);
}

/// What a transport delivers on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    Event(RealtimeEvent),
    Closed { reason: String },
    Error(TransportError),
}

pub struct ChannelHandle {
    pub channel: Arc<dyn Channel>,
    pub frames: mpsc::UnboundedReceiver<TransportFrame>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("authentication rejected by realtime service")]
    AuthExpired,

    #[error("subscription to {topic} failed: {message}")]
    SubscriptionFailed { topic: String, message: String },

    #[error("channel closed")]
    Closed,

    #[error("malformed frame: {message}")]
    Malformed { message: String },
}

impl TransportError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::SubscriptionFailed { .. } | Self::Closed
        )
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }
}

impl From<TransportError> for AppError {
    fn from(e: TransportError) -> Self {
        let kind = match &e {
            TransportError::AuthExpired => ErrorKind::AuthExpired,
            TransportError::Malformed { .. } => ErrorKind::Serialization,
            _ => ErrorKind::TransientNetwork,
        };
        AppError::new(kind, e.to_string())
    }
}
