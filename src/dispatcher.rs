//! Event Dispatcher: routes upstream events into the Thread Cache's store,
//! gated by thread freshness so a cold thread's store is never partially
//! populated ahead of its own backfill.

use std::sync::Arc;

use crate::cache::{Freshness, ThreadCacheRegistry};
use crate::error::CoreResult;
use crate::model::ChannelId;
use crate::store::MessageStore;
use crate::upstream::Event;

pub struct EventDispatcher {
    cache: Arc<ThreadCacheRegistry>,
    store: Arc<dyn MessageStore>,
}

impl EventDispatcher {
    pub fn new(cache: Arc<ThreadCacheRegistry>, store: Arc<dyn MessageStore>) -> Self {
        Self { cache, store }
    }

    /// Dispatch one upstream event. Serialized per upstream connection by
    /// the caller (the gateway event loop processes events one at a time),
    /// preserving per-thread order.
    pub async fn dispatch(&self, event: Event) -> CoreResult<()> {
        match event {
            Event::MessageCreate(msg) => {
                if self.cache.freshness_gate(msg.channel_id).await? {
                    self.store.insert(&msg).await?;
                } else {
                    tracing::debug!(channel = msg.channel_id.0, id = msg.id.0, "dropping create on cold thread");
                }
            }
            Event::MessageUpdate(msg) => {
                if self.cache.freshness_gate(msg.channel_id).await? {
                    self.store.update(&msg).await?;
                } else {
                    tracing::debug!(channel = msg.channel_id.0, id = msg.id.0, "dropping update on cold thread");
                }
            }
            Event::MessageDelete { channel_id, id } => {
                if self.cache.freshness_gate(channel_id).await? {
                    self.store.delete(channel_id, id).await?;
                } else {
                    tracing::debug!(channel = channel_id.0, id = id.0, "dropping delete on cold thread");
                }
            }
            Event::ThreadArchived {
                channel_id,
                archive_timestamp,
            } => {
                self.on_thread_archived(channel_id, archive_timestamp).await?;
            }
        }
        Ok(())
    }

    async fn on_thread_archived(
        &self,
        channel_id: ChannelId,
        archive_timestamp: chrono::DateTime<chrono::Utc>,
    ) -> CoreResult<()> {
        if self.cache.current_freshness(channel_id).await == Some(Freshness::Fresh) {
            self.store.set_updated_at(channel_id, archive_timestamp).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, MessageId, UserId};
    use crate::upstream::UpstreamClient;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex as StdMutex;

    fn msg(id: i64, channel: i64) -> Message {
        Message {
            id: MessageId(id),
            channel_id: ChannelId(channel),
            author_id: UserId(1),
            content: "hi".into(),
            edited_at: None,
            extra: Default::default(),
        }
    }

    struct FakeStore {
        inserted: StdMutex<Vec<Message>>,
        updated_at: StdMutex<Option<DateTime<Utc>>>,
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn insert(&self, msg: &Message) -> CoreResult<()> {
            self.inserted.lock().unwrap().push(msg.clone());
            Ok(())
        }
        async fn update(&self, _msg: &Message) -> CoreResult<()> {
            Ok(())
        }
        async fn delete(&self, _channel: ChannelId, _id: MessageId) -> CoreResult<()> {
            Ok(())
        }
        async fn set_updated_at(&self, _channel: ChannelId, at: DateTime<Utc>) -> CoreResult<()> {
            *self.updated_at.lock().unwrap() = Some(at);
            Ok(())
        }
        async fn updated_at(&self, _channel: ChannelId) -> CoreResult<Option<DateTime<Utc>>> {
            Ok(*self.updated_at.lock().unwrap())
        }
        async fn range_after(
            &self,
            _channel: ChannelId,
            _cursor: MessageId,
            _limit: i64,
        ) -> CoreResult<(Vec<Message>, bool)> {
            Ok((Vec::new(), false))
        }
        async fn range_before(
            &self,
            _channel: ChannelId,
            _cursor: MessageId,
            _limit: i64,
        ) -> CoreResult<(Vec<Message>, bool)> {
            Ok((Vec::new(), false))
        }
        async fn update_messages(&self, _channel: ChannelId, _fresh: &[Message]) -> CoreResult<()> {
            Ok(())
        }
    }

    struct NeverFetchUpstream;

    #[async_trait]
    impl UpstreamClient for NeverFetchUpstream {
        async fn fetch_messages_after(
            &self,
            _channel: ChannelId,
            _cursor: MessageId,
            _limit: u16,
        ) -> CoreResult<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn archive_status(&self, _channel: ChannelId) -> CoreResult<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    // S5: message-create on a cold (never backfilled) thread is dropped.
    #[tokio::test]
    async fn message_create_on_cold_thread_is_dropped() {
        let store = Arc::new(FakeStore {
            inserted: StdMutex::new(Vec::new()),
            updated_at: StdMutex::new(None),
        });
        let cache = Arc::new(ThreadCacheRegistry::new(store.clone(), Arc::new(NeverFetchUpstream)));
        let dispatcher = EventDispatcher::new(cache, store.clone());

        dispatcher
            .dispatch(Event::MessageCreate(msg(1, 7)))
            .await
            .unwrap();

        assert!(store.inserted.lock().unwrap().is_empty());
    }
}
