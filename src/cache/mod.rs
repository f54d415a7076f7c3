//! THE CORE: the Thread Cache — coalesced progressive backfill, spec §4.1.
//!
//! One [`ThreadEntry`] per thread id, created lazily and never evicted
//! (spec §9 "per-thread state map"). At most one backfill task runs per
//! thread at a time; readers that arrive while a backfill is running attach
//! a subscriber to it and return as soon as their own window is
//! satisfiable, without waiting for the full history to land.

use std::collections::HashMap;
use std::sync::Arc;

use strum::Display;
use tokio::sync::{watch, Mutex, RwLock};

use crate::error::{CoreError, CoreResult};
use crate::model::{ChannelId, Message, MessageId, Window};
use crate::store::{trim_after, trim_before, MessageStore};
use crate::upstream::UpstreamClient;

/// Fixed page size for backfill pages — spec §4.1/§5.
const PAGE_SIZE: u16 = 100;

/// Tri-state freshness — spec §9: "the 'not yet evaluated' state must be
/// distinct from 'false' because the derivation itself needs upstream
/// calls."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Freshness {
    Unknown,
    Stale,
    Fresh,
}

/// What a backfill task publishes on its watch channel after each page —
/// the accumulating, strictly-ascending-by-id slice, whether the fetch is
/// complete, and an error if the fetch failed terminally.
#[derive(Debug, Clone)]
struct FetchProgress {
    messages: Arc<Vec<Message>>,
    full: bool,
    err: Option<CoreError>,
}

/// A running backfill — spec §3 "in-flight fetch handle".
struct FetchHandle {
    progress: watch::Receiver<FetchProgress>,
}

/// Per-thread cache entry — spec §3 "Thread-Cache Entry".
#[derive(Default)]
struct ThreadEntry {
    freshness: Option<Freshness>,
    fetch: Option<FetchHandle>,
}

/// Registry of per-thread cache entries plus the Reader API —
/// spec §2 "Thread Cache" + "Reader API".
pub struct ThreadCacheRegistry {
    entries: RwLock<HashMap<ChannelId, Arc<Mutex<ThreadEntry>>>>,
    store: Arc<dyn MessageStore>,
    upstream: Arc<dyn UpstreamClient>,
}

impl ThreadCacheRegistry {
    pub fn new(store: Arc<dyn MessageStore>, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
            upstream,
        }
    }

    async fn entry_for(&self, channel: ChannelId) -> Arc<Mutex<ThreadEntry>> {
        if let Some(e) = self.entries.read().await.get(&channel) {
            return e.clone();
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(channel)
            .or_insert_with(|| Arc::new(Mutex::new(ThreadEntry::default())))
            .clone()
    }

    /// Derive `freshness` if not yet evaluated — spec §3 "Up-to-date
    /// derivation". Must be called with the entry's mutex held.
    async fn refresh_freshness(&self, channel: ChannelId, entry: &mut ThreadEntry) -> CoreResult<()> {
        if entry.freshness.is_some() {
            return Ok(());
        }

        let updated_at = self.store.updated_at(channel).await?;
        let Some(updated_at) = updated_at else {
            entry.freshness = Some(Freshness::Stale);
            return Ok(());
        };

        let archived_at = self.upstream.archive_status(channel).await?;
        entry.freshness = Some(match archived_at {
            Some(archived_at) if archived_at <= updated_at => Freshness::Fresh,
            _ => Freshness::Stale,
        });
        tracing::debug!(channel = channel.0, freshness = %entry.freshness.unwrap(), "freshness derived");
        Ok(())
    }

    /// Gate for the Event Dispatcher's message-create/update/delete
    /// handling — spec §4.3. Returns `true` when the caller should apply
    /// its store mutation now: the thread is already fresh, or a backfill
    /// just finished while we were waiting for it (in which case the
    /// mutation still applies on top of the reconciled state). Returns
    /// `false` when the thread is cold with no fetch running — the event
    /// is dropped, since the next reader's backfill will pick it up anyway.
    pub async fn freshness_gate(&self, channel: ChannelId) -> CoreResult<bool> {
        let entry_arc = self.entry_for(channel).await;
        let wait_for = {
            let mut entry = entry_arc.lock().await;
            self.refresh_freshness(channel, &mut entry).await?;

            if entry.freshness == Some(Freshness::Fresh) {
                return Ok(true);
            }
            entry.fetch.as_ref().map(|f| f.progress.clone())
        };

        let Some(mut rx) = wait_for else {
            return Ok(false);
        };

        loop {
            let progress = rx.borrow_and_update().clone();
            if progress.full {
                return progress.err.map(Err).unwrap_or(Ok(true));
            }
            if rx.changed().await.is_err() {
                return Ok(false);
            }
        }
    }

    /// Peek at a thread's freshness without triggering a backfill — used
    /// by the `thread-archived` event handler, which only acts when the
    /// thread is already fresh (spec §4.3).
    pub async fn current_freshness(&self, channel: ChannelId) -> Option<Freshness> {
        let entry_arc = self.entry_for(channel).await;
        let entry = entry_arc.lock().await;
        entry.freshness
    }

    /// Reader operation `messages_after(thread, cursor, limit)` — spec §4.1.
    pub async fn messages_after(
        &self,
        channel: ChannelId,
        cursor: MessageId,
        limit: i64,
    ) -> CoreResult<Window> {
        let entry_arc = self.entry_for(channel).await;
        let subscribe_to_fetch = {
            let mut entry = entry_arc.lock().await;
            self.refresh_freshness(channel, &mut entry).await?;

            if entry.freshness == Some(Freshness::Fresh) {
                None
            } else {
                Some(self.attach_or_start_fetch(channel, &entry_arc, &mut entry).await)
            }
        };

        match subscribe_to_fetch {
            None => self.messages_after_from_store(channel, cursor, limit).await,
            Some(mut rx) => {
                loop {
                    let progress = rx.borrow_and_update().clone();
                    if let Some(err) = progress.err {
                        return Err(err);
                    }
                    if let Some(window) = resolve_after(&progress.messages, cursor, limit, progress.full) {
                        return Ok(window);
                    }
                    if rx.changed().await.is_err() {
                        // Sender dropped without a final `full=true` publish
                        // (backfill task panicked) — surface as cancelled.
                        return Err(CoreError::Cancelled);
                    }
                }
            }
        }
    }

    /// Reader operation `messages_before(thread, cursor, limit)` — spec
    /// §4.1, the mirror of `messages_after`.
    pub async fn messages_before(
        &self,
        channel: ChannelId,
        cursor: MessageId,
        limit: i64,
    ) -> CoreResult<Window> {
        let entry_arc = self.entry_for(channel).await;
        let subscribe_to_fetch = {
            let mut entry = entry_arc.lock().await;
            self.refresh_freshness(channel, &mut entry).await?;

            if entry.freshness == Some(Freshness::Fresh) {
                None
            } else {
                Some(self.attach_or_start_fetch(channel, &entry_arc, &mut entry).await)
            }
        };

        match subscribe_to_fetch {
            None => self.messages_before_from_store(channel, cursor, limit).await,
            Some(mut rx) => loop {
                let progress = rx.borrow_and_update().clone();
                if let Some(err) = progress.err {
                    return Err(err);
                }
                if let Some(window) = resolve_before(&progress.messages, cursor, limit, progress.full) {
                    return Ok(window);
                }
                if rx.changed().await.is_err() {
                    return Err(CoreError::Cancelled);
                }
            },
        }
    }

    async fn messages_after_from_store(
        &self,
        channel: ChannelId,
        cursor: MessageId,
        limit: i64,
    ) -> CoreResult<Window> {
        let (msgs, has_before) = self.store.range_after(channel, cursor, limit + 1).await?;
        let (messages, has_after) = trim_after(msgs, limit as usize);
        Ok(Window {
            messages,
            has_before,
            has_after,
        })
    }

    async fn messages_before_from_store(
        &self,
        channel: ChannelId,
        cursor: MessageId,
        limit: i64,
    ) -> CoreResult<Window> {
        let (msgs, has_after) = self.store.range_before(channel, cursor, limit + 1).await?;
        let (messages, has_before) = trim_before(msgs, limit as usize);
        Ok(Window {
            messages,
            has_before,
            has_after,
        })
    }

    /// If a backfill is already running for this thread, return a receiver
    /// subscribed to it. Otherwise spawn one. Must be called with the
    /// entry's mutex held — spec §4.1's "coalescing protocol" step 1/2.
    async fn attach_or_start_fetch(
        &self,
        channel: ChannelId,
        entry_arc: &Arc<Mutex<ThreadEntry>>,
        entry: &mut ThreadEntry,
    ) -> watch::Receiver<FetchProgress> {
        if let Some(fetch) = &entry.fetch {
            return fetch.progress.clone();
        }

        let (tx, rx) = watch::channel(FetchProgress {
            messages: Arc::new(Vec::new()),
            full: false,
            err: None,
        });
        entry.fetch = Some(FetchHandle {
            progress: rx.clone(),
        });

        let store = self.store.clone();
        let upstream = self.upstream.clone();
        let entry_arc = entry_arc.clone();
        tokio::spawn(async move {
            run_backfill(channel, store, upstream, tx, entry_arc).await;
        });

        rx
    }
}

/// The backfill task body — spec §4.1 "Backfill loop". Fetches pages of
/// `PAGE_SIZE` ascending by id until a short page signals the end,
/// publishing the accumulated slice after every page, then reconciles into
/// the store and marks the thread fresh.
async fn run_backfill(
    channel: ChannelId,
    store: Arc<dyn MessageStore>,
    upstream: Arc<dyn UpstreamClient>,
    tx: watch::Sender<FetchProgress>,
    entry_arc: Arc<Mutex<ThreadEntry>>,
) {
    let mut acc: Vec<Message> = Vec::new();
    let mut after = MessageId::MIN;
    let mut final_err: Option<CoreError> = None;

    tracing::debug!(channel = channel.0, "backfill started");

    loop {
        let page = upstream.fetch_messages_after(channel, after, PAGE_SIZE).await;
        let mut page = match page {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(channel = channel.0, error = ?e, "backfill page fetch failed");
                final_err = Some(e);
                break;
            }
        };

        // Discord's REST history endpoint returns newest-first; normalize
        // to strictly ascending so the accumulated slice supports binary
        // search — spec §4.1 "Reverse the page if ... descending".
        if page.windows(2).any(|w| w[0].id > w[1].id) {
            page.reverse();
        }
        let page_len = page.len();
        acc.extend(page);

        let done = page_len < PAGE_SIZE as usize;
        let _ = tx.send(FetchProgress {
            messages: Arc::new(acc.clone()),
            full: done,
            err: None,
        });

        if done {
            break;
        }
        after = acc.last().map(|m| m.id).unwrap_or(MessageId::MIN);
    }

    if final_err.is_none() {
        if let Err(e) = store.update_messages(channel, &acc).await {
            tracing::warn!(channel = channel.0, error = ?e, "backfill reconciliation failed");
            final_err = Some(e);
        }
    }

    tracing::debug!(
        channel = channel.0,
        messages = acc.len(),
        ok = final_err.is_none(),
        "backfill finished"
    );

    let mut entry = entry_arc.lock().await;
    entry.freshness = Some(if final_err.is_none() {
        Freshness::Fresh
    } else {
        Freshness::Stale
    });
    entry.fetch = None;
    drop(entry);

    let _ = tx.send(FetchProgress {
        messages: Arc::new(acc),
        full: true,
        err: final_err,
    });
}

/// Binary-search `messages` for the answer to `messages_after(cursor,
/// limit)`, returning `None` when the window isn't decidable yet from what
/// has arrived so far — spec §4.1 steps 4.
fn resolve_after(messages: &[Message], cursor: MessageId, limit: i64, full: bool) -> Option<Window> {
    let mut i = messages.partition_point(|m| m.id < cursor);
    if i < messages.len() && messages[i].id == cursor {
        i += 1;
    }

    if i >= messages.len() {
        // Nothing past cursor yet. If the fetch is complete we are
        // genuinely at the end; otherwise keep waiting for more batches.
        return if full {
            Some(Window {
                messages: Vec::new(),
                has_before: i > 0,
                has_after: false,
            })
        } else {
            None
        };
    }

    let has_before = i > 0;
    let remaining = messages.len() - i;
    let limit = limit as usize;

    if remaining > limit {
        return Some(Window {
            messages: messages[i..i + limit].to_vec(),
            has_before,
            has_after: true,
        });
    }

    if full {
        Some(Window {
            messages: messages[i..].to_vec(),
            has_before,
            has_after: false,
        })
    } else {
        None
    }
}

/// Symmetric to [`resolve_after`] for `messages_before` — spec §4.1's
/// mirror operation.
fn resolve_before(messages: &[Message], cursor: MessageId, limit: i64, full: bool) -> Option<Window> {
    let i = messages.partition_point(|m| m.id < cursor);

    if i == 0 {
        return Some(Window {
            messages: Vec::new(),
            has_before: false,
            has_after: !messages.is_empty(),
        });
    }

    if i >= messages.len() && !full {
        // The cursor itself hasn't arrived yet; we cannot yet tell whether
        // there is anything at or after it.
        return None;
    }

    let has_after = i < messages.len();
    let limit = limit as usize;
    let start = i.saturating_sub(limit);
    let has_before = start > 0;

    Some(Window {
        messages: messages[start..i].to_vec(),
        has_before,
        has_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn msg(id: i64) -> Message {
        Message {
            id: MessageId(id),
            channel_id: ChannelId(1),
            author_id: crate::model::UserId(1),
            content: format!("msg {id}"),
            edited_at: None,
            extra: Default::default(),
        }
    }

    struct FakeStore {
        messages: StdMutex<Vec<Message>>,
        updated_at: StdMutex<Option<DateTime<Utc>>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                messages: StdMutex::new(Vec::new()),
                updated_at: StdMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn insert(&self, msg: &Message) -> CoreResult<()> {
            self.messages.lock().unwrap().push(msg.clone());
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
            cursor: MessageId,
            limit: i64,
        ) -> CoreResult<(Vec<Message>, bool)> {
            let all = self.messages.lock().unwrap().clone();
            let has_before = all.iter().any(|m| m.id <= cursor);
            let rest: Vec<Message> = all.into_iter().filter(|m| m.id > cursor).take(limit as usize).collect();
            Ok((rest, has_before))
        }
        async fn range_before(
            &self,
            _channel: ChannelId,
            cursor: MessageId,
            limit: i64,
        ) -> CoreResult<(Vec<Message>, bool)> {
            let all = self.messages.lock().unwrap().clone();
            let has_after = all.iter().any(|m| m.id >= cursor);
            let mut before: Vec<Message> = all.into_iter().filter(|m| m.id < cursor).collect();
            if before.len() > limit as usize {
                before = before.split_off(before.len() - limit as usize);
            }
            Ok((before, has_after))
        }
        async fn update_messages(&self, channel: ChannelId, fresh: &[Message]) -> CoreResult<()> {
            *self.messages.lock().unwrap() = fresh.to_vec();
            self.set_updated_at(channel, Utc::now()).await
        }
    }

    struct FakeUpstream {
        total: i64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn fetch_messages_after(
            &self,
            _channel: ChannelId,
            cursor: MessageId,
            limit: u16,
        ) -> CoreResult<Vec<Message>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = cursor.0 + 1;
            let end = (start + limit as i64 - 1).min(self.total);
            if start > end {
                return Ok(Vec::new());
            }
            Ok((start..=end).map(msg).collect())
        }

        async fn archive_status(&self, _channel: ChannelId) -> CoreResult<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    fn channel() -> ChannelId {
        ChannelId(42)
    }

    // S1: cold read.
    #[tokio::test]
    async fn cold_read_returns_first_window_and_backfills_rest() {
        let store = Arc::new(FakeStore::new());
        let upstream = Arc::new(FakeUpstream {
            total: 250,
            calls: AtomicUsize::new(0),
        });
        let registry = ThreadCacheRegistry::new(store.clone(), upstream.clone());

        let window = registry
            .messages_after(channel(), MessageId(0), 25)
            .await
            .unwrap();

        assert_eq!(window.messages.len(), 25);
        assert_eq!(window.messages[0].id, MessageId(1));
        assert_eq!(window.messages[24].id, MessageId(25));
        assert!(!window.has_before);
        assert!(window.has_after);

        // Give the backfill a moment to finish reconciling in the background.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.messages.lock().unwrap().len(), 250);
    }

    // S4: reverse window against an already-fresh store.
    #[tokio::test]
    async fn messages_before_reverse_window_from_fresh_store() {
        let store = Arc::new(FakeStore::new());
        let fresh: Vec<Message> = (1..=1000).map(msg).collect();
        store.update_messages(channel(), &fresh).await.unwrap();
        // Mark archived-and-fresh by giving the upstream an archive time in
        // the past relative to `updated_at`.
        let upstream = Arc::new(ArchivedFakeUpstream);
        let registry = ThreadCacheRegistry::new(store, upstream);

        let window = registry
            .messages_before(channel(), MessageId(500), 10)
            .await
            .unwrap();

        let ids: Vec<i64> = window.messages.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, (490..500).collect::<Vec<_>>());
        assert!(window.has_before);
        assert!(window.has_after);
    }

    struct ArchivedFakeUpstream;

    #[async_trait]
    impl UpstreamClient for ArchivedFakeUpstream {
        async fn fetch_messages_after(
            &self,
            _channel: ChannelId,
            _cursor: MessageId,
            _limit: u16,
        ) -> CoreResult<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn archive_status(&self, _channel: ChannelId) -> CoreResult<Option<DateTime<Utc>>> {
            Ok(Some(DateTime::<Utc>::MIN_UTC))
        }
    }

    // S3: concurrent coalescing — N readers issue at most ceil(total/page) calls.
    #[tokio::test]
    async fn concurrent_readers_coalesce_into_one_backfill() {
        let store = Arc::new(FakeStore::new());
        let upstream = Arc::new(FakeUpstream {
            total: 400,
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ThreadCacheRegistry::new(store, upstream.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .messages_after(channel(), MessageId(0), 25)
                    .await
                    .unwrap()
            }));
        }

        for h in handles {
            let window = h.await.unwrap();
            assert_eq!(window.messages.len(), 25);
            assert_eq!(window.messages[0].id, MessageId(1));
        }

        // 400 messages at 100/page = 4 full pages plus one terminal fetch
        // that comes back short (empty) to signal the end of history — 5
        // calls total, regardless of N concurrent readers.
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn resolve_after_waits_when_cursor_not_yet_reached() {
        let acc = vec![msg(1), msg(2)];
        assert!(resolve_after(&acc, MessageId(5), 10, false).is_none());
    }

    #[test]
    fn resolve_after_returns_empty_done_at_end_of_fetch() {
        let acc = vec![msg(1), msg(2)];
        let window = resolve_after(&acc, MessageId(5), 10, true).unwrap();
        assert!(window.messages.is_empty());
        assert!(!window.has_after);
    }

    #[test]
    fn resolve_before_empty_at_cursor_zero_position() {
        let acc = vec![msg(5), msg(6)];
        let window = resolve_before(&acc, MessageId(5), 10, false).unwrap();
        assert!(window.messages.is_empty());
        assert!(!window.has_before);
    }
}
