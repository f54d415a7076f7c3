//! End-to-end tests of the page handlers against a real store pool and a
//! fixture `Cabinet`: build a router, drive it with real HTTP requests, and
//! assert on the response.

mod common;

use axum::http::StatusCode;

use common::{build_app_state, build_app_state_with_upstream, get_html, test_router, AlwaysArchivedUpstream, FixtureCabinet};
use dfmirror::model::{ChannelId, GuildId, Message, MessageExtra, MessageId, UserId};
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

#[tokio::test]
async fn index_lists_guilds() {
    let pool = common::test_pool().await;
    let fixture = FixtureCabinet {
        guilds: vec![(GuildId(1), "Test Guild".into())],
        ..Default::default()
    };
    let state = build_app_state(pool, fixture);
    let app = test_router(state);

    let (status, body) = get_html(app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Test Guild"));
}

#[tokio::test]
async fn unknown_guild_is_404() {
    let pool = common::test_pool().await;
    let state = build_app_state(pool, FixtureCabinet::default());
    let app = test_router(state);

    let (status, _) = get_html(app, "/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn nsfw_forum_is_forbidden() {
    let pool = common::test_pool().await;
    let forum = ChannelId(801_000_001);
    let fixture = FixtureCabinet {
        guilds: vec![(GuildId(2), "G".into())],
        forums: vec![(GuildId(2), forum, "nsfw-forum".into())],
        nsfw_forums: vec![forum],
        ..Default::default()
    };
    let state = build_app_state(pool, fixture);
    let app = test_router(state);

    let (status, _) = get_html(app, &format!("/2/{}", forum.0)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn forum_lists_its_posts() {
    let pool = common::test_pool().await;
    let forum = ChannelId(801_000_002);
    let post = ChannelId(801_000_003);
    let fixture = FixtureCabinet {
        guilds: vec![(GuildId(3), "G".into())],
        forums: vec![(GuildId(3), forum, "general".into())],
        threads: vec![(post, forum, "Welcome thread".into())],
        ..Default::default()
    };
    let state = build_app_state(pool, fixture);
    let app = test_router(state);

    let (status, body) = get_html(app, &format!("/3/{}", forum.0)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Welcome thread"));
}

#[tokio::test]
async fn post_page_serves_reconciled_store_contents_without_upstream_calls() {
    let pool = common::test_pool().await;
    let forum = ChannelId(801_000_004);
    let post = ChannelId(801_000_005);
    let fixture = FixtureCabinet {
        guilds: vec![(GuildId(4), "G".into())],
        forums: vec![(GuildId(4), forum, "general".into())],
        threads: vec![(post, forum, "Thread".into())],
        ..Default::default()
    };
    let state = build_app_state_with_upstream(pool, fixture, std::sync::Arc::new(AlwaysArchivedUpstream));

    // Reconcile the store directly (as a completed backfill would) and mark
    // it fresh against an archived upstream — S2's warm-archived scenario,
    // exercised through the HTTP layer this time.
    let messages: Vec<Message> = (1..=5).map(|id| msg(post, id, "hello there")).collect();
    state.store.update_messages(post, &messages).await.unwrap();

    let app = test_router(state);
    let (status, body) = get_html(app, &format!("/4/{}/{}", forum.0, post.0)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("hello there"));
    assert!(body.contains("Thread"));
}

#[tokio::test]
async fn privacy_page_renders() {
    let pool = common::test_pool().await;
    let state = build_app_state(pool, FixtureCabinet::default());
    let app = test_router(state);

    let (status, body) = get_html(app, "/privacy").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("read-only mirror"));
}

#[tokio::test]
async fn health_check_reports_ok_against_live_pool() {
    let pool = common::test_pool().await;
    let state = build_app_state(pool, FixtureCabinet::default());
    let app = test_router(state);

    let (status, body) = get_html(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"ok\""));
}
