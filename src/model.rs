//! Core data types shared across the store, cache, dispatcher and handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! snowflake_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub const MIN: $name = $name(0);
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(s.parse()?))
            }
        }
    };
}

snowflake_id!(GuildId);
snowflake_id!(ChannelId);
snowflake_id!(MessageId);
snowflake_id!(UserId);

/// A single forum-post message.
///
/// `extra` is the opaque serialized blob of every field besides `content`
/// that the renderer needs (embeds, attachments, flags), kept separate from
/// `content` so text search and display never need to deserialize it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    /// Absent until the message has been edited; NULL-safe readers treat
    /// absence as "created_at", never as "never edited".
    pub edited_at: Option<DateTime<Utc>>,
    pub extra: MessageExtra,
}

impl Message {
    /// `edited_at`, treating absence as "never edited" rather than "unknown".
    /// The creation time itself is not tracked separately from the id (ids
    /// are time-ordered snowflakes), so callers that need a concrete
    /// timestamp for comparison purposes use this directly when present
    /// and fall back to `DateTime::<Utc>::MIN_UTC` (oldest possible) only
    /// when neither value is available — which cannot happen for a
    /// message that has actually been observed from the upstream.
    pub fn edited_at_or_min(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Everything about a message besides its text content and identity —
/// embeds, attachments, flags. Stored as an opaque JSON blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageExtra {
    #[serde(default)]
    pub embeds: Vec<Embed>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub flags: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    pub kind: Option<String>,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub video_url: Option<String>,
    pub image_proxy_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
    pub height: Option<u32>,
}

/// One row per thread that has ever been backfilled.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ChannelMeta {
    pub channel_id: ChannelId,
    pub updated_at: DateTime<Utc>,
}

/// Result of a paginated message-range read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Window {
    pub messages: Vec<Message>,
    pub has_before: bool,
    pub has_after: bool,
}

/// A guild member as the in-memory cabinet knows it. Used to resolve a
/// message's `author_id` to a display name for rendering; falls back to the
/// bare id when the member isn't in cache and hydration didn't find them
/// either.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub user_id: UserId,
    pub display_name: String,
}
