//! `serenity`-backed implementation of [`UpstreamClient`] and [`Cabinet`],
//! over `serenity::http::Http` for REST calls and `serenity::cache::Cache`
//! for the in-memory guild/channel view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    ChannelId as SerenityChannelId, ChannelType, ChunkGuildFilter, GetMessages, Http, Permissions,
    ShardMessenger,
};
use serenity::cache::Cache;
use tokio::sync::{watch, OnceCell};

use crate::error::{CoreError, CoreResult};
use crate::model::{
    Attachment, ChannelId, Embed, GuildId, MemberInfo, Message, MessageExtra, MessageId, UserId,
};

use super::{ArchivedThread, Cabinet, MemberHydrator, Page, UpstreamClient};

/// Upstream client wrapping a `serenity` REST handle and gateway cache.
/// Both are cheap `Arc` clones, populated once the gateway connection has
/// logged in and warmed (see `src/main.rs`).
pub struct SerenityUpstream {
    http: Arc<Http>,
    cache: Arc<Cache>,
    /// Set once the gateway has logged in (`main.rs`'s `ready` handler) —
    /// sending a chunk request needs a live shard connection, which doesn't
    /// exist at construction time. Mirrors `GatewayHandler`'s `dispatcher`
    /// `OnceCell` wiring in `main.rs`.
    shard: OnceCell<ShardMessenger>,
    /// In-flight member-chunk requests keyed by guild id, so readers piling
    /// up on the same guild subscribe to the same request instead of each
    /// sending their own and flooding the gateway.
    pending_chunks: StdMutex<HashMap<i64, Arc<watch::Sender<bool>>>>,
}

impl SerenityUpstream {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>) -> Self {
        Self {
            http,
            cache,
            shard: OnceCell::new(),
            pending_chunks: StdMutex::new(HashMap::new()),
        }
    }

    /// Wire in the live shard connection once the gateway is ready — see
    /// `main.rs`'s `GatewayHandler::ready`.
    pub fn set_shard(&self, shard: ShardMessenger) {
        let _ = self.shard.set(shard);
    }

    /// Forward a `GUILD_MEMBERS_CHUNK` gateway event into whichever
    /// [`MemberHydrator::hydrate`] call is waiting on it. Completion is
    /// `chunk_index == chunk_count - 1`.
    pub fn on_guild_members_chunk(&self, guild: GuildId, chunk_index: u32, chunk_count: u32) {
        if chunk_index + 1 != chunk_count {
            return;
        }
        if let Some(tx) = self.pending_chunks.lock().unwrap().get(&guild.0).cloned() {
            let _ = tx.send(true);
        }
    }
}

/// Convert a `serenity` gateway/REST message into our own [`Message`] —
/// shared by [`UpstreamClient::fetch_messages_after`] and by `main.rs`'s
/// gateway event handler, so both paths produce identical rows.
pub fn to_core_message(channel: ChannelId, m: &serenity::model::channel::Message) -> Message {
    let embeds = m
        .embeds
        .iter()
        .map(|e| Embed {
            kind: e.kind.clone(),
            url: e.url.clone(),
            thumbnail_url: e.thumbnail.as_ref().map(|t| t.url.clone()),
            video_url: e.video.as_ref().map(|v| v.url.clone().unwrap_or_default()),
            image_proxy_url: e.image.as_ref().map(|i| i.proxy_url.clone().unwrap_or_default()),
        })
        .collect();

    let attachments = m
        .attachments
        .iter()
        .map(|a| Attachment {
            filename: a.filename.clone(),
            url: a.url.clone(),
            content_type: a.content_type.clone(),
            height: a.height.map(|h| h as u32),
        })
        .collect();

    Message {
        id: MessageId(m.id.get() as i64),
        channel_id: channel,
        author_id: UserId(m.author.id.get() as i64),
        content: m.content.clone(),
        edited_at: m.edited_timestamp.map(|t| t.to_utc()),
        extra: MessageExtra {
            embeds,
            attachments,
            flags: m.flags.map(|f| f.bits()).unwrap_or(0),
        },
    }
}

#[async_trait]
impl UpstreamClient for SerenityUpstream {
    async fn fetch_messages_after(
        &self,
        channel: ChannelId,
        cursor: MessageId,
        limit: u16,
    ) -> CoreResult<Page> {
        let target = SerenityChannelId::new(channel.0 as u64);
        let builder = if cursor.0 == 0 {
            GetMessages::new().limit(limit)
        } else {
            GetMessages::new()
                .after(serenity::all::MessageId::new(cursor.0 as u64))
                .limit(limit)
        };

        let batch = target
            .messages(&self.http, builder)
            .await
            .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;

        Ok(batch.iter().map(|m| to_core_message(channel, m)).collect())
    }

    async fn archive_status(&self, channel: ChannelId) -> CoreResult<Option<DateTime<Utc>>> {
        let target = SerenityChannelId::new(channel.0 as u64);
        let chan = target
            .to_channel(&self.http, None)
            .await
            .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;

        let guild_channel = match chan.guild() {
            Some(gc) => gc,
            None => return Ok(None),
        };

        let metadata = match guild_channel.thread_metadata {
            Some(meta) => meta,
            None => return Ok(None),
        };

        if !metadata.archived {
            return Ok(None);
        }

        Ok(Some(metadata.archive_timestamp.to_utc()))
    }
}

#[async_trait]
impl Cabinet for SerenityUpstream {
    fn guilds(&self) -> Vec<GuildId> {
        self.cache
            .guilds()
            .into_iter()
            .map(|g| GuildId(g.get() as i64))
            .collect()
    }

    fn guild_name(&self, guild: GuildId) -> Option<String> {
        self.cache
            .guild(serenity::all::GuildId::new(guild.0 as u64))
            .map(|g| g.name.clone())
    }

    fn visible_forums(&self, guild: GuildId) -> Vec<ChannelId> {
        let guild_id = serenity::all::GuildId::new(guild.0 as u64);
        let Some(guild) = self.cache.guild(guild_id) else {
            return Vec::new();
        };
        let me = self.cache.current_user().id;
        let Some(member) = guild.members.get(&me) else {
            return Vec::new();
        };

        guild
            .channels
            .iter()
            .filter(|c| c.kind == ChannelType::Forum)
            .filter(|c| {
                let perms = guild.user_permissions_in(c, member);
                perms.contains(Permissions::VIEW_CHANNEL) && perms.contains(Permissions::READ_MESSAGE_HISTORY)
            })
            .map(|c| ChannelId(c.id.get() as i64))
            .collect()
    }

    fn channel_name(&self, channel: ChannelId) -> Option<String> {
        self.cache
            .channel(SerenityChannelId::new(channel.0 as u64))
            .map(|c| c.name.clone())
    }

    fn is_nsfw(&self, channel: ChannelId) -> bool {
        self.cache
            .channel(SerenityChannelId::new(channel.0 as u64))
            .map(|c| c.nsfw)
            .unwrap_or(false)
    }

    async fn public_threads(&self, forum: ChannelId) -> CoreResult<Vec<ArchivedThread>> {
        let target = SerenityChannelId::new(forum.0 as u64);
        let guild_id = self
            .cache
            .channel(target)
            .map(|c| c.guild_id)
            .ok_or_else(|| CoreError::NotFound("forum channel not in cache".into()))?;

        let active = self
            .http
            .get_guild_active_threads(guild_id)
            .await
            .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;

        let mut out: Vec<ArchivedThread> = active
            .threads
            .iter()
            .filter(|t| t.parent_id == Some(target))
            .filter_map(|t| {
                let meta = t.thread_metadata?;
                Some(ArchivedThread {
                    id: ChannelId(t.id.get() as i64),
                    parent_id: forum,
                    archive_timestamp: meta.archive_timestamp.to_utc(),
                })
            })
            .collect();

        let mut before: Option<DateTime<Utc>> = None;
        loop {
            let archived = target
                .get_archived_public_threads(&self.http, before, Some(100))
                .await
                .map_err(|e| CoreError::UpstreamTransport(e.to_string()))?;

            let batch_empty = archived.threads.is_empty();
            for t in &archived.threads {
                if let Some(meta) = t.thread_metadata {
                    out.push(ArchivedThread {
                        id: ChannelId(t.id.get() as i64),
                        parent_id: forum,
                        archive_timestamp: meta.archive_timestamp.to_utc(),
                    });
                }
            }

            if !archived.has_more || batch_empty {
                break;
            }
            before = archived.threads.last().and_then(|t| {
                t.thread_metadata.map(|m| m.archive_timestamp.to_utc())
            });
            if before.is_none() {
                break;
            }
        }

        Ok(out)
    }

    fn member(&self, guild: GuildId, user: UserId) -> Option<MemberInfo> {
        let guild = self.cache.guild(serenity::all::GuildId::new(guild.0 as u64))?;
        let member = guild.members.get(&serenity::all::UserId::new(user.0 as u64))?;
        Some(MemberInfo {
            user_id: user,
            display_name: member.display_name().to_string(),
        })
    }
}

#[async_trait]
impl MemberHydrator for SerenityUpstream {
    /// Send a `GUILD_MEMBERS_CHUNK` request for `user_ids` missing from
    /// `guild`'s cache and wait up to `timeout` for completion. Concurrent
    /// callers for the same guild share one in-flight request rather than
    /// each sending their own, to avoid flooding the gateway.
    async fn hydrate(&self, guild: GuildId, user_ids: Vec<UserId>, timeout: Duration) {
        if user_ids.is_empty() {
            return;
        }
        let Some(shard) = self.shard.get() else {
            return;
        };

        let mut rx = {
            let mut pending = self.pending_chunks.lock().unwrap();
            if let Some(tx) = pending.get(&guild.0) {
                tx.subscribe()
            } else {
                let (tx, rx) = watch::channel(false);
                let tx = Arc::new(tx);
                pending.insert(guild.0, tx.clone());
                drop(pending);

                let filter = ChunkGuildFilter::UserIds(
                    user_ids.iter().map(|u| serenity::all::UserId::new(u.0 as u64)).collect(),
                );
                let guild_id = serenity::all::GuildId::new(guild.0 as u64);
                if let Err(e) = shard.chunk_guild(guild_id, None, false, filter, None) {
                    tracing::warn!(error = ?e, guild = guild.0, "requesting member chunk failed");
                    self.pending_chunks.lock().unwrap().remove(&guild.0);
                    return;
                }
                rx
            }
        };

        let _ = tokio::time::timeout(timeout, async {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        self.pending_chunks.lock().unwrap().remove(&guild.0);
    }
}
