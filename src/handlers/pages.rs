//! Guild/forum/post page rendering: thin HTTP handlers kept deliberately
//! simple. Each handler does a visibility check, calls the Reader API or
//! the Cabinet, and hands a small serializable context to a handlebars
//! template.

use axum::{
    extract::{Path, Query, State},
    response::{Html, IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{CoreError, CoreResult};
use crate::model::{ChannelId, GuildId, Message, MessageId};
use crate::render;
use crate::state::AppState;

fn guild_name_or_404(state: &AppState, guild: GuildId) -> CoreResult<String> {
    state
        .cabinet
        .guild_name(guild)
        .ok_or_else(|| CoreError::NotFound("guild not found".into()))
}

/// Check that `forum` is one of `guild`'s visible forum channels and that
/// it is not NSFW. Returns the forum's display name.
fn visible_forum_or_error(state: &AppState, guild: GuildId, forum: ChannelId) -> CoreResult<String> {
    if !state.cabinet.visible_forums(guild).contains(&forum) {
        return Err(CoreError::NotFound("forum not found".into()));
    }
    if state.cabinet.is_nsfw(forum) {
        return Err(CoreError::Forbidden("this forum is not available".into()));
    }
    state
        .cabinet
        .channel_name(forum)
        .ok_or_else(|| CoreError::NotFound("forum not found".into()))
}

fn render_template(state: &AppState, name: &str, ctx: &serde_json::Value) -> CoreResult<Response> {
    let body = state
        .templates
        .render(name, ctx)
        .map_err(|e| CoreError::Validation(format!("template render error: {e}")))?;
    Ok(Html(body).into_response())
}

#[derive(Serialize)]
struct GuildSummary {
    id: i64,
    name: String,
}

/// `GET /` — the index page: every guild the bot is a member of.
pub async fn get_index(State(state): State<AppState>) -> CoreResult<Response> {
    let guilds: Vec<GuildSummary> = state
        .cabinet
        .guilds()
        .into_iter()
        .filter_map(|id| {
            state
                .cabinet
                .guild_name(id)
                .map(|name| GuildSummary { id: id.0, name })
        })
        .collect();

    render_template(
        &state,
        "index",
        &json!({ "guild_count": guilds.len(), "guilds": guilds }),
    )
}

#[derive(Serialize)]
struct ForumSummary {
    id: i64,
    name: String,
}

/// `GET /:guild_id` — a guild's visible forum channels.
pub async fn get_guild(
    State(state): State<AppState>,
    Path(guild_id): Path<GuildId>,
) -> CoreResult<Response> {
    let guild_name = guild_name_or_404(&state, guild_id)?;

    let forums: Vec<ForumSummary> = state
        .cabinet
        .visible_forums(guild_id)
        .into_iter()
        .filter_map(|id| {
            state
                .cabinet
                .channel_name(id)
                .map(|name| ForumSummary { id: id.0, name })
        })
        .collect();

    render_template(
        &state,
        "guild",
        &json!({
            "guild_id": guild_id.0,
            "guild_name": guild_name,
            "forums": forums,
        }),
    )
}

#[derive(Serialize)]
struct PostSummary {
    id: i64,
    name: String,
}

/// `GET /:guild_id/:forum_id` — a forum's public threads (posts).
pub async fn get_forum(
    State(state): State<AppState>,
    Path((guild_id, forum_id)): Path<(GuildId, ChannelId)>,
) -> CoreResult<Response> {
    let guild_name = guild_name_or_404(&state, guild_id)?;
    let forum_name = visible_forum_or_error(&state, guild_id, forum_id)?;

    let threads = state.cabinet.public_threads(forum_id).await?;
    let posts: Vec<PostSummary> = threads
        .into_iter()
        .filter_map(|t| {
            state
                .cabinet
                .channel_name(t.id)
                .map(|name| PostSummary { id: t.id.0, name })
        })
        .collect();

    render_template(
        &state,
        "forum",
        &json!({
            "guild_id": guild_id.0,
            "guild_name": guild_name,
            "forum_id": forum_id.0,
            "forum_name": forum_name,
            "posts": posts,
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct PostQuery {
    pub after: Option<MessageId>,
    pub before: Option<MessageId>,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
struct RenderedAttachment {
    filename: String,
    url: String,
}

#[derive(Serialize)]
struct RenderedMessage {
    id: i64,
    author_id: i64,
    html: String,
    media: Vec<RenderedAttachment>,
    files: Vec<RenderedAttachment>,
}

#[derive(Serialize)]
struct AuthorGroup {
    author_id: i64,
    author_name: String,
    messages: Vec<RenderedMessage>,
}

/// How long a post-page render waits for missing authors' member-chunk
/// hydration before falling back to their bare id; bounded well under
/// typical page-load patience.
const MEMBER_HYDRATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Request member-chunk hydration for any author in
/// `messages` not already in the Cabinet's member cache, bounded by
/// [`MEMBER_HYDRATION_TIMEOUT`] so a slow or absent gateway response never
/// blocks the page past that. Best-effort: callers read whatever the
/// Cabinet knows afterwards and fall back to the bare author id.
async fn hydrate_missing_authors(state: &AppState, guild: GuildId, messages: &[Message]) {
    let mut missing: Vec<_> = messages
        .iter()
        .map(|m| m.author_id)
        .filter(|id| state.cabinet.member(guild, *id).is_none())
        .collect();
    missing.sort_unstable();
    missing.dedup();

    if missing.is_empty() {
        return;
    }
    state
        .member_hydrator
        .hydrate(guild, missing, MEMBER_HYDRATION_TIMEOUT)
        .await;
}

/// `GET /:guild_id/:forum_id/:post_id` — the thread's message history,
/// paged through the Reader API (`messages_after`/`messages_before`, spec
/// §4.1/§6) via `?after=`/`?before=`/`?limit=` query parameters.
pub async fn get_post(
    State(state): State<AppState>,
    Path((guild_id, forum_id, post_id)): Path<(GuildId, ChannelId, ChannelId)>,
    Query(q): Query<PostQuery>,
) -> CoreResult<Response> {
    let guild_name = guild_name_or_404(&state, guild_id)?;
    let forum_name = visible_forum_or_error(&state, guild_id, forum_id)?;
    let post_name = state
        .cabinet
        .channel_name(post_id)
        .ok_or_else(|| CoreError::NotFound("post not found".into()))?;

    if q.after.is_some() && q.before.is_some() {
        return Err(CoreError::Validation(
            "specify only one of `after` or `before`".into(),
        ));
    }
    let limit = q.limit.unwrap_or(50).clamp(1, 100);

    let window = match (q.after, q.before) {
        (Some(cursor), None) => state.cache.messages_after(post_id, cursor, limit).await?,
        (None, Some(cursor)) => state.cache.messages_before(post_id, cursor, limit).await?,
        (None, None) => state.cache.messages_after(post_id, MessageId::MIN, limit).await?,
    };

    let first_id = window.messages.first().map(|m| m.id.0).unwrap_or(0);
    let last_id = window.messages.last().map(|m| m.id.0).unwrap_or(0);

    hydrate_missing_authors(&state, guild_id, &window.messages).await;

    let groups: Vec<AuthorGroup> = render::group_consecutive_by_author(&window.messages)
        .into_iter()
        .map(|run| AuthorGroup {
            author_id: run[0].author_id.0,
            author_name: state
                .cabinet
                .member(guild_id, run[0].author_id)
                .map(|m| m.display_name)
                .unwrap_or_else(|| run[0].author_id.to_string()),
            messages: run
                .into_iter()
                .map(|m| {
                    let (media, plain) = render::partition_attachments(m);
                    RenderedMessage {
                        id: m.id.0,
                        author_id: m.author_id.0,
                        html: render::render_content(m, &state.public_base_url),
                        media: media
                            .into_iter()
                            .map(|a| RenderedAttachment {
                                filename: a.filename.clone(),
                                url: render::proxy_url(&state.public_base_url, &a.url)
                                    .unwrap_or_else(|| a.url.clone()),
                            })
                            .collect(),
                        files: plain
                            .into_iter()
                            .map(|a| RenderedAttachment {
                                filename: a.filename.clone(),
                                url: a.url.clone(),
                            })
                            .collect(),
                    }
                })
                .collect(),
        })
        .collect();

    render_template(
        &state,
        "post",
        &json!({
            "guild_id": guild_id.0,
            "guild_name": guild_name,
            "forum_id": forum_id.0,
            "forum_name": forum_name,
            "post_id": post_id.0,
            "post_name": post_name,
            "groups": groups,
            "has_before": window.has_before,
            "has_after": window.has_after,
            "first_id": first_id,
            "last_id": last_id,
        }),
    )
}

/// `GET /privacy` — static informational page.
pub async fn get_privacy(State(state): State<AppState>) -> CoreResult<Response> {
    render_template(&state, "privacy", &json!({}))
}
