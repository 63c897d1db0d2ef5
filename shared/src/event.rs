use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{EntityId, Notification, UserId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Transport paused while the app is backgrounded; not torn down.
    Suspended,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Suspended => "suspended",
        }
    }

    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RealtimeEvent {
    NewNotification(Notification),
    FollowChanged {
        user_id: EntityId,
        is_following: bool,
    },
    LikeChanged {
        post_id: EntityId,
        count: u64,
    },
    ConnectionStateChanged(ConnectionState),
}

impl RealtimeEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NewNotification(_) => "new_notification",
            Self::FollowChanged { .. } => "follow_changed",
            Self::LikeChanged { .. } => "like_changed",
            Self::ConnectionStateChanged(_) => "connection_state_changed",
        }
    }

    /// Entity whose state the event assigns, if any.
    #[must_use]
    pub fn entity(&self) -> Option<&EntityId> {
        match self {
            Self::FollowChanged { user_id, .. } => Some(user_id),
            Self::LikeChanged { post_id, .. } => Some(post_id),
            Self::NewNotification(_) | Self::ConnectionStateChanged(_) => None,
        }
    }
}

/// Push topics, always scoped to the authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Notifications,
    Follows,
    Likes,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Notifications, Topic::Follows, Topic::Likes];

    #[must_use]
    pub fn scoped_to(self, user_id: &UserId) -> String {
        let suffix = match self {
            Self::Notifications => "notifications",
            Self::Follows => "follows",
            Self::Likes => "likes",
        };
        format!("user:{user_id}:{suffix}")
    }

    #[must_use]
    pub fn topic_set(user_id: &UserId) -> Vec<String> {
        Self::ALL.iter().map(|t| t.scoped_to(user_id)).collect()
    }
}
