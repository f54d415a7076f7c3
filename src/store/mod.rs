//! The Message Store: a durable, per-thread message store with incremental
//! reconciliation, behind a trait so the Thread Cache's coalescing logic can
//! be unit-tested against an in-memory fake.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::model::{ChannelId, Message, MessageId};

pub use postgres::PgMessageStore;

/// Durable per-thread message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message; a duplicate id is a no-op.
    async fn insert(&self, msg: &Message) -> CoreResult<()>;

    /// Overwrite content/edited_at/extra unless the stored `edited_at` is
    /// already at least as new as the incoming one (edit-monotonicity).
    async fn update(&self, msg: &Message) -> CoreResult<()>;

    async fn delete(&self, channel: ChannelId, id: MessageId) -> CoreResult<()>;

    async fn set_updated_at(&self, channel: ChannelId, at: DateTime<Utc>) -> CoreResult<()>;

    async fn updated_at(&self, channel: ChannelId) -> CoreResult<Option<DateTime<Utc>>>;

    /// Up to `limit` messages with id > cursor, ascending by id, plus
    /// whether any message with id <= cursor exists in the store.
    async fn range_after(
        &self,
        channel: ChannelId,
        cursor: MessageId,
        limit: i64,
    ) -> CoreResult<(Vec<Message>, bool)>;

    /// Up to `limit` messages with id < cursor, ascending by id in the
    /// returned slice, plus whether any message with id >= cursor exists.
    async fn range_before(
        &self,
        channel: ChannelId,
        cursor: MessageId,
        limit: i64,
    ) -> CoreResult<(Vec<Message>, bool)>;

    /// Atomic reconciliation of a freshly fetched full history against
    /// whatever is currently stored for `channel`. Bumps `updated_at`
    /// regardless of whether any rows changed.
    async fn update_messages(&self, channel: ChannelId, fresh: &[Message]) -> CoreResult<()>;
}

/// Reader-API-facing helper shared by both the store-authoritative path
/// (`cache::messages_after` when a thread is `Fresh`) and the store
/// implementation's own tests: given up to `limit + 1` rows already
/// returned by `range_after`/`range_before`, trim to `limit` and compute
/// `has_after`/`has_before`.
pub fn trim_after(mut msgs: Vec<Message>, limit: usize) -> (Vec<Message>, bool) {
    if msgs.len() > limit {
        msgs.truncate(limit);
        (msgs, true)
    } else {
        (msgs, false)
    }
}

pub fn trim_before(mut msgs: Vec<Message>, limit: usize) -> (Vec<Message>, bool) {
    if msgs.len() > limit {
        // `msgs` is ascending; the overflow row is the oldest one, furthest
        // from the cursor, so it is the one to drop.
        msgs.remove(0);
        (msgs, true)
    } else {
        (msgs, false)
    }
}
