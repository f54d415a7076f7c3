use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::model::{ChannelId, Message, MessageExtra, MessageId};

use super::MessageStore;

/// Schema version this binary understands. Bump alongside `MIGRATIONS` when
/// the schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Migrations to apply, in order, to go from version `i` to `i + 1`.
/// `MIGRATIONS[0]` takes a fresh database (version 0) to version 1.
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE "channel" (
        id BIGINT NOT NULL PRIMARY KEY,
        updated_at TIMESTAMPTZ NOT NULL
    );
    CREATE TABLE "message" (
        id BIGINT NOT NULL PRIMARY KEY,
        channel BIGINT NOT NULL,
        author BIGINT NOT NULL,
        edited_at TIMESTAMPTZ,
        content TEXT NOT NULL,
        blob TEXT NOT NULL
    );
    CREATE INDEX message_channel_id_idx ON "message" (channel, id);
"#];

/// A durable, Postgres-backed `MessageStore`.
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    /// Connect and bring the schema up to date, failing fatally if the
    /// stored version is newer than this binary's `SCHEMA_VERSION`.
    pub async fn connect(database_url: &str) -> CoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| CoreError::StoreIo(format!("connecting to store: {e}")))?;

        let store = Self { pool };
        store.open_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, so callers that need raw access (health checks,
    /// `AppState`) don't have to open a second connection.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub async fn health_check(&self) -> CoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// `CREATE TABLE IF NOT EXISTS` for the config row, read its version,
    /// fail fatally if it is ahead of `SCHEMA_VERSION`, otherwise apply the
    /// remaining migrations and write the new version — all in one
    /// transaction.
    async fn open_schema(&self) -> CoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoreError::StoreIo(e.to_string()))?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS "config" (id SMALLINT PRIMARY KEY, version INT NOT NULL, CHECK (id = 1))"#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::StoreIo(e.to_string()))?;

        let version: Option<i32> = sqlx::query_scalar(r#"SELECT version FROM "config" WHERE id = 1"#)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| CoreError::StoreIo(e.to_string()))?;
        let mut version = version.unwrap_or(0);

        if version > MIGRATIONS.len() as i32 {
            return Err(CoreError::FatalSchemaMismatch {
                found: version,
                supported: MIGRATIONS.len() as i32,
            });
        }

        while (version as usize) < MIGRATIONS.len() {
            sqlx::query(MIGRATIONS[version as usize])
                .execute(&mut *tx)
                .await
                .map_err(|e| CoreError::StoreIo(format!("applying migration {version}: {e}")))?;
            version += 1;
        }

        sqlx::query(
            r#"INSERT INTO "config" (id, version) VALUES (1, $1)
               ON CONFLICT (id) DO UPDATE SET version = $1"#,
        )
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoreError::StoreIo(e.to_string()))?;

        tx.commit().await.map_err(|e| CoreError::StoreIo(e.to_string()))?;
        Ok(())
    }

    fn row_to_message(channel: ChannelId, row: &sqlx::postgres::PgRow) -> CoreResult<Message> {
        let id: i64 = row.try_get("id").map_err(|e| CoreError::StoreIo(e.to_string()))?;
        let author: i64 = row
            .try_get("author")
            .map_err(|e| CoreError::StoreIo(e.to_string()))?;
        let content: String = row
            .try_get("content")
            .map_err(|e| CoreError::StoreIo(e.to_string()))?;
        let edited_at: Option<DateTime<Utc>> = row
            .try_get("edited_at")
            .map_err(|e| CoreError::StoreIo(e.to_string()))?;
        let blob: String = row.try_get("blob").map_err(|e| CoreError::StoreIo(e.to_string()))?;
        let extra: MessageExtra = serde_json::from_str(&blob)
            .map_err(|e| CoreError::StoreIo(format!("decoding message blob: {e}")))?;

        Ok(Message {
            id: MessageId(id),
            channel_id: channel,
            author_id: crate::model::UserId(author),
            content,
            edited_at,
            extra,
        })
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert(&self, msg: &Message) -> CoreResult<()> {
        let blob = serde_json::to_string(&msg.extra)
            .map_err(|e| CoreError::StoreIo(format!("encoding message blob: {e}")))?;
        sqlx::query(
            r#"INSERT INTO "message" (id, channel, author, edited_at, content, blob)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(msg.id.0)
        .bind(msg.channel_id.0)
        .bind(msg.author_id.0)
        .bind(msg.edited_at)
        .bind(&msg.content)
        .bind(&blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, msg: &Message) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        // `fetch_optional` here distinguishes "row does not exist" (outer
        // `None`) from "row exists with a NULL `edited_at`" (`Some(None)`,
        // a never-edited message) — collapsing those with `.flatten()`
        // would silently drop a never-edited message's first edit.
        let row: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar(r#"SELECT edited_at FROM "message" WHERE id = $1"#)
                .bind(msg.id.0)
                .fetch_optional(&mut *tx)
                .await?;

        let stored_edited_at = match row {
            // Row doesn't exist — nothing to update (spec only defines
            // `update` against an existing message).
            None => return Ok(()),
            // NULL-safe: absent `edited_at` means "never edited", not
            // "unknown" — treat it as the oldest possible instant so any
            // incoming edit timestamp is newer (spec §4.2).
            Some(edited_at) => edited_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
        };

        if stored_edited_at >= msg.edited_at_or_min() {
            return Ok(());
        }

        let blob = serde_json::to_string(&msg.extra)
            .map_err(|e| CoreError::StoreIo(format!("encoding message blob: {e}")))?;
        sqlx::query(
            r#"UPDATE "message" SET content = $1, edited_at = $2, blob = $3 WHERE id = $4"#,
        )
        .bind(&msg.content)
        .bind(msg.edited_at)
        .bind(&blob)
        .bind(msg.id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, _channel: ChannelId, id: MessageId) -> CoreResult<()> {
        sqlx::query(r#"DELETE FROM "message" WHERE id = $1"#)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_updated_at(&self, channel: ChannelId, at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query(
            r#"INSERT INTO "channel" (id, updated_at) VALUES ($1, $2)
               ON CONFLICT (id) DO UPDATE SET updated_at = $2"#,
        )
        .bind(channel.0)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn updated_at(&self, channel: ChannelId) -> CoreResult<Option<DateTime<Utc>>> {
        let updated_at: Option<DateTime<Utc>> =
            sqlx::query_scalar(r#"SELECT updated_at FROM "channel" WHERE id = $1"#)
                .bind(channel.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(updated_at)
    }

    async fn range_after(
        &self,
        channel: ChannelId,
        cursor: MessageId,
        limit: i64,
    ) -> CoreResult<(Vec<Message>, bool)> {
        let has_before: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM "message" WHERE channel = $1 AND id <= $2)"#,
        )
        .bind(channel.0)
        .bind(cursor.0)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"SELECT id, author, edited_at, content, blob FROM "message"
               WHERE channel = $1 AND id > $2 ORDER BY id ASC LIMIT $3"#,
        )
        .bind(channel.0)
        .bind(cursor.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .iter()
            .map(|row| Self::row_to_message(channel, row))
            .collect::<CoreResult<Vec<_>>>()?;

        Ok((messages, has_before))
    }

    async fn range_before(
        &self,
        channel: ChannelId,
        cursor: MessageId,
        limit: i64,
    ) -> CoreResult<(Vec<Message>, bool)> {
        let has_after: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM "message" WHERE channel = $1 AND id >= $2)"#,
        )
        .bind(channel.0)
        .bind(cursor.0)
        .fetch_one(&self.pool)
        .await?;

        // Nearest-to-cursor `limit` rows, selected by id DESC, then
        // re-ordered ascending.
        let rows = sqlx::query(
            r#"SELECT id, author, edited_at, content, blob FROM (
                   SELECT id, author, edited_at, content, blob FROM "message"
                   WHERE channel = $1 AND id < $2 ORDER BY id DESC LIMIT $3
               ) AS nearest ORDER BY id ASC"#,
        )
        .bind(channel.0)
        .bind(cursor.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .iter()
            .map(|row| Self::row_to_message(channel, row))
            .collect::<CoreResult<Vec<_>>>()?;

        Ok((messages, has_after))
    }

    async fn update_messages(&self, channel: ChannelId, fresh: &[Message]) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let existed: bool =
            sqlx::query_scalar(r#"SELECT EXISTS (SELECT 1 FROM "channel" WHERE id = $1)"#)
                .bind(channel.0)
                .fetch_one(&mut *tx)
                .await?;

        if existed {
            sqlx::query(r#"UPDATE "channel" SET updated_at = $1 WHERE id = $2"#)
                .bind(now)
                .bind(channel.0)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(r#"INSERT INTO "channel" (id, updated_at) VALUES ($1, $2)"#)
                .bind(channel.0)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        if !existed {
            for msg in fresh {
                insert_in_tx(&mut tx, msg).await?;
            }
            tx.commit().await?;
            return Ok(());
        }

        let stored_rows = sqlx::query(r#"SELECT id, edited_at FROM "message" WHERE channel = $1 ORDER BY id ASC"#)
            .bind(channel.0)
            .fetch_all(&mut *tx)
            .await?;
        let mut stored: Vec<(i64, Option<DateTime<Utc>>)> = Vec::with_capacity(stored_rows.len());
        for row in &stored_rows {
            let id: i64 = row.try_get("id").map_err(|e| CoreError::StoreIo(e.to_string()))?;
            let edited_at: Option<DateTime<Utc>> = row
                .try_get("edited_at")
                .map_err(|e| CoreError::StoreIo(e.to_string()))?;
            stored.push((id, edited_at));
        }

        // Walk `fresh` (ascending) alongside `stored` (ascending) — spec
        // §4.2 `update_messages` reconciliation diff.
        let mut to_delete: Vec<i64> = Vec::new();
        let mut to_update: Vec<&Message> = Vec::new();
        let mut to_insert: Vec<&Message> = Vec::new();
        let mut stored_idx = 0usize;

        for msg in fresh {
            while stored_idx < stored.len() && stored[stored_idx].0 < msg.id.0 {
                to_delete.push(stored[stored_idx].0);
                stored_idx += 1;
            }
            if stored_idx < stored.len() && stored[stored_idx].0 == msg.id.0 {
                let (_, stored_edited_at) = stored[stored_idx];
                let stored_edited_at = stored_edited_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                if stored_edited_at < msg.edited_at_or_min() {
                    to_update.push(msg);
                }
                stored_idx += 1;
            } else {
                to_insert.push(msg);
            }
        }
        while stored_idx < stored.len() {
            to_delete.push(stored[stored_idx].0);
            stored_idx += 1;
        }

        for id in &to_delete {
            sqlx::query(r#"DELETE FROM "message" WHERE id = $1"#)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for msg in &to_update {
            let blob = serde_json::to_string(&msg.extra)
                .map_err(|e| CoreError::StoreIo(format!("encoding message blob: {e}")))?;
            sqlx::query(r#"UPDATE "message" SET content = $1, edited_at = $2, blob = $3 WHERE id = $4"#)
                .bind(&msg.content)
                .bind(msg.edited_at)
                .bind(&blob)
                .bind(msg.id.0)
                .execute(&mut *tx)
                .await?;
        }
        for msg in &to_insert {
            insert_in_tx(&mut tx, msg).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn insert_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    msg: &Message,
) -> CoreResult<()> {
    let blob = serde_json::to_string(&msg.extra)
        .map_err(|e| CoreError::StoreIo(format!("encoding message blob: {e}")))?;
    sqlx::query(
        r#"INSERT INTO "message" (id, channel, author, edited_at, content, blob)
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(msg.id.0)
    .bind(msg.channel_id.0)
    .bind(msg.author_id.0)
    .bind(msg.edited_at)
    .bind(&msg.content)
    .bind(&blob)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
