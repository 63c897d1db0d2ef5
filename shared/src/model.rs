use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

// Posts and target users share the entity id space of the mutation store.
typed_id!(EntityId);
// The authenticated account.
typed_id!(UserId);
typed_id!(ListKey);

impl ListKey {
    #[must_use]
    pub fn feed() -> Self {
        Self::new("feed")
    }

    #[must_use]
    pub fn notifications() -> Self {
        Self::new("notifications")
    }

    #[must_use]
    pub fn comments(post_id: &EntityId) -> Self {
        Self(format!("comments/{post_id}"))
    }
}

/// Unix timestamp in milliseconds
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
        )
    }

    #[must_use]
    pub const fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub const fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub const fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }
}

// --- Optimistic mutation state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Like,
    Follow,
}

impl MutationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Follow => "follow",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationKey {
    pub entity_id: EntityId,
    pub kind: MutationKind,
}

impl MutationKey {
    pub fn new(entity_id: impl Into<EntityId>, kind: MutationKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
        }
    }

    #[must_use]
    pub fn like(post_id: &EntityId) -> Self {
        Self::new(post_id.clone(), MutationKind::Like)
    }

    #[must_use]
    pub fn follow(user_id: &EntityId) -> Self {
        Self::new(user_id.clone(), MutationKind::Follow)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for MutationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub entity_id: EntityId,
    pub kind: MutationKind,
    pub local_value: bool,
    pub intent_seq: u64,
    pub server_confirmed: bool,
    pub last_attempt_at: UnixTimeMs,
}

impl MutationRecord {
    #[must_use]
    pub fn key(&self) -> MutationKey {
        MutationKey::new(self.entity_id.clone(), self.kind)
    }

    /// A local intent the server has not acknowledged yet.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        !self.server_confirmed && self.intent_seq > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeCounter {
    pub post_id: EntityId,
    pub count: u64,
    pub last_updated_at: UnixTimeMs,
}

impl LikeCounter {
    #[must_use]
    pub const fn new(post_id: EntityId, count: u64, now: UnixTimeMs) -> Self {
        Self {
            post_id,
            count,
            last_updated_at: now,
        }
    }

    /// Applies a signed delta, clamping at zero. Returns the new count.
    pub fn apply_delta(&mut self, delta: i64, now: UnixTimeMs) -> u64 {
        self.count = if delta.is_negative() {
            self.count.saturating_sub(delta.unsigned_abs())
        } else {
            self.count.saturating_add(delta.unsigned_abs())
        };
        self.last_updated_at = now;
        self.count
    }
}

// --- Paginated windows ---

/// Items held in a [`PageWindow`] are deduplicated by this id.
pub trait Identifiable {
    type Id: Eq + Hash + Clone + fmt::Debug + Send + Sync;

    fn id(&self) -> Self::Id;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageWindow<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub has_more: bool,
}

impl<T> Default for PageWindow<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            page: 0,
            has_more: true,
        }
    }
}

impl<T> PageWindow<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// --- Thumbnails ---

/// Immutable once created; replaced only by regeneration after invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailEntry {
    source_url: String,
    thumbnail_uri: String,
    created_at: UnixTimeMs,
    expires_at: UnixTimeMs,
}

impl ThumbnailEntry {
    pub fn new(
        source_url: impl Into<String>,
        thumbnail_uri: impl Into<String>,
        created_at: UnixTimeMs,
        ttl_ms: u64,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            thumbnail_uri: thumbnail_uri.into(),
            created_at,
            expires_at: created_at.add_millis(ttl_ms),
        }
    }

    #[must_use]
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    #[must_use]
    pub fn thumbnail_uri(&self) -> &str {
        &self.thumbnail_uri
    }

    #[must_use]
    pub const fn created_at(&self) -> UnixTimeMs {
        self.created_at
    }

    #[must_use]
    pub const fn expires_at(&self) -> UnixTimeMs {
        self.expires_at
    }

    #[must_use]
    pub const fn is_expired(&self, now: UnixTimeMs) -> bool {
        now.0 >= self.expires_at.0
    }
}

// --- Content ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub actor_id: Option<EntityId>,
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Identifiable for Notification {
    type Id = String;

    fn id(&self) -> String {
        self.id.clone()
    }
}
