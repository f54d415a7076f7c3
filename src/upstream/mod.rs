//! The upstream chat-platform client.
//!
//! Split into two traits so the Thread Cache and Sitemap Builder only
//! depend on the capability they actually need, and so tests can supply a
//! fake without pulling in `serenity`.

pub mod serenity_client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::model::{ChannelId, GuildId, MemberInfo, Message, UserId};

pub use serenity_client::{to_core_message, SerenityUpstream};

/// A paged batch returned by `fetch_messages_after`. `messages` is whatever
/// order the upstream returned; callers must not assume ascending order
/// (Discord returns pages newest-first).
pub type Page = Vec<Message>;

/// One archived-thread summary, as returned by `list_public_archived_threads`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedThread {
    pub id: ChannelId,
    pub parent_id: ChannelId,
    /// When the thread was archived.
    pub archive_timestamp: DateTime<Utc>,
}

/// Events the dispatcher (`crate::dispatcher`) routes into the Thread Cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MessageCreate(Message),
    MessageUpdate(Message),
    MessageDelete { channel_id: ChannelId, id: crate::model::MessageId },
    /// A thread transitioned to archived. `archive_timestamp` is the
    /// upstream's own record of when that happened.
    ThreadArchived {
        channel_id: ChannelId,
        archive_timestamp: DateTime<Utc>,
    },
}

/// History fetch + event stream capability — everything the Thread Cache
/// and Event Dispatcher need from the upstream.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch up to `limit` messages with id greater than `cursor`, ascending
    /// or descending (implementation-defined; the Thread Cache's backfill
    /// loop normalizes to ascending itself).
    async fn fetch_messages_after(
        &self,
        channel: ChannelId,
        cursor: crate::model::MessageId,
        limit: u16,
    ) -> CoreResult<Page>;

    /// Whether `channel` is currently an archived thread, and since when —
    /// used by the Thread Cache's up-to-date derivation.
    async fn archive_status(&self, channel: ChannelId) -> CoreResult<Option<DateTime<Utc>>>;
}

/// Cabinet: the upstream client's in-memory view of guilds/channels/members.
/// Backed by `serenity`'s gateway cache in production.
#[async_trait]
pub trait Cabinet: Send + Sync {
    fn guilds(&self) -> Vec<GuildId>;

    fn guild_name(&self, guild: GuildId) -> Option<String>;

    /// Forum channels in `guild` that the bot principal can both view and
    /// read history in.
    fn visible_forums(&self, guild: GuildId) -> Vec<ChannelId>;

    fn channel_name(&self, channel: ChannelId) -> Option<String>;

    /// `true` if the channel is flagged NSFW.
    fn is_nsfw(&self, channel: ChannelId) -> bool;

    /// Public (non-private) threads whose parent is `forum`, regardless of
    /// archive state — the sitemap walk filters further on its own.
    async fn public_threads(&self, forum: ChannelId) -> CoreResult<Vec<ArchivedThread>>;

    /// Cached lookup only. Returns `None` when the member hasn't been
    /// observed yet; callers needing a display name for an author missing
    /// from cache go through [`MemberHydrator`] first.
    fn member(&self, guild: GuildId, user: UserId) -> Option<MemberInfo>;
}

/// Member-chunk hydration: fetching a batch of missing authors sends a
/// gateway chunk request and waits for the matching `(chunk_index,
/// chunk_count)` completion; completion is `chunk_index == chunk_count - 1`.
#[async_trait]
pub trait MemberHydrator: Send + Sync {
    /// Request and wait for `guild`'s member cache to include `user_ids`
    /// that are missing, up to `timeout`. Best-effort: a timeout or
    /// transport error leaves already-cached members usable and uncached
    /// ones falling back to their bare id — it never fails the caller's
    /// page render.
    async fn hydrate(&self, guild: GuildId, user_ids: Vec<UserId>, timeout: std::time::Duration);
}
