//! Integration tests for [`PgMessageStore`] against a real Postgres
//! database — exercises the reconciliation diff and range queries that the
//! in-memory `FakeStore` in `cache::tests` can't verify.

mod common;

use chrono::Utc;

use dfmirror::model::{ChannelId, Message, MessageExtra, MessageId, UserId};
use dfmirror::store::postgres::PgMessageStore;
use dfmirror::store::MessageStore;

fn msg(channel: ChannelId, id: i64, content: &str) -> Message {
    Message {
        id: MessageId(id),
        channel_id: channel,
        author_id: UserId(1),
        content: content.to_string(),
        edited_at: None,
        extra: MessageExtra::default(),
    }
}

// Each test picks a channel id that no other test uses, so they can run
// concurrently against the same database without interfering.
fn test_channel(tag: i64) -> ChannelId {
    ChannelId(900_000_000 + tag)
}

#[tokio::test]
async fn insert_is_idempotent_on_duplicate_id() {
    let pool = common::test_pool().await;
    let store = PgMessageStore::from_pool(pool);
    let channel = test_channel(1);

    let m = msg(channel, 1, "hello");
    store.insert(&m).await.unwrap();
    store.insert(&m).await.unwrap();

    let (rows, has_before) = store.range_after(channel, MessageId(0), 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!has_before);
}

#[tokio::test]
async fn update_respects_edit_monotonicity() {
    let pool = common::test_pool().await;
    let store = PgMessageStore::from_pool(pool);
    let channel = test_channel(2);

    let mut m = msg(channel, 1, "original");
    store.insert(&m).await.unwrap();

    let newer = Utc::now();
    m.content = "edited once".to_string();
    m.edited_at = Some(newer);
    store.update(&m).await.unwrap();

    // An older edit timestamp must not clobber the newer content.
    let mut stale = m.clone();
    stale.content = "stale edit".to_string();
    stale.edited_at = Some(newer - chrono::Duration::seconds(60));
    store.update(&stale).await.unwrap();

    let (rows, _) = store.range_after(channel, MessageId(0), 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "edited once");
}

#[tokio::test]
async fn delete_removes_the_row() {
    let pool = common::test_pool().await;
    let store = PgMessageStore::from_pool(pool);
    let channel = test_channel(3);

    store.insert(&msg(channel, 1, "a")).await.unwrap();
    store.insert(&msg(channel, 2, "b")).await.unwrap();
    store.delete(channel, MessageId(1)).await.unwrap();

    let (rows, has_before) = store.range_after(channel, MessageId(0), 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, MessageId(2));
    assert!(!has_before);
}

#[tokio::test]
async fn range_after_and_before_paginate_correctly() {
    let pool = common::test_pool().await;
    let store = PgMessageStore::from_pool(pool);
    let channel = test_channel(4);

    for id in 1..=20 {
        store.insert(&msg(channel, id, "m")).await.unwrap();
    }

    let (after, has_before) = store.range_after(channel, MessageId(5), 5).await.unwrap();
    let after_ids: Vec<i64> = after.iter().map(|m| m.id.0).collect();
    assert_eq!(after_ids, vec![6, 7, 8, 9, 10]);
    assert!(has_before);

    let (before, has_after) = store.range_before(channel, MessageId(16), 5).await.unwrap();
    let before_ids: Vec<i64> = before.iter().map(|m| m.id.0).collect();
    assert_eq!(before_ids, vec![11, 12, 13, 14, 15]);
    assert!(has_after);
}

#[tokio::test]
async fn update_messages_reconciles_adds_edits_and_removals() {
    let pool = common::test_pool().await;
    let store = PgMessageStore::from_pool(pool);
    let channel = test_channel(5);

    let initial = vec![
        msg(channel, 1, "one"),
        msg(channel, 2, "two"),
        msg(channel, 3, "three"),
    ];
    store.update_messages(channel, &initial).await.unwrap();

    // id 2 removed (message deleted upstream while store was stale), id 3
    // edited, id 4 new.
    let mut edited_three = msg(channel, 3, "three (edited)");
    edited_three.edited_at = Some(Utc::now());
    let reconciled = vec![msg(channel, 1, "one"), edited_three, msg(channel, 4, "four")];
    store.update_messages(channel, &reconciled).await.unwrap();

    let (rows, _) = store.range_after(channel, MessageId(0), 10).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|m| m.id.0).collect();
    assert_eq!(ids, vec![1, 3, 4]);
    assert_eq!(rows[1].content, "three (edited)");

    assert!(store.updated_at(channel).await.unwrap().is_some());
}

#[tokio::test]
async fn updated_at_is_none_until_first_set() {
    let pool = common::test_pool().await;
    let store = PgMessageStore::from_pool(pool);
    let channel = test_channel(6);

    assert!(store.updated_at(channel).await.unwrap().is_none());

    let now = Utc::now();
    store.set_updated_at(channel, now).await.unwrap();
    let stored = store.updated_at(channel).await.unwrap().unwrap();
    assert_eq!(stored.timestamp(), now.timestamp());
}

#[tokio::test]
async fn health_check_succeeds_against_live_pool() {
    let pool = common::test_pool().await;
    let store = PgMessageStore::from_pool(pool);
    store.health_check().await.unwrap();
}
