use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use handlebars::Handlebars;
use serenity::all::{
    ChannelId as SerenityChannelId, Client, Context, EventHandler, GatewayIntents,
    GuildChannel, GuildId as SerenityGuildId, GuildMembersChunkEvent, Message as SerenityMessage,
    MessageId as SerenityMessageId, MessageUpdateEvent, Ready,
};
use tokio::sync::OnceCell;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dfmirror::config::Config;
use dfmirror::dispatcher::EventDispatcher;
use dfmirror::cache::ThreadCacheRegistry;
use dfmirror::handlers;
use dfmirror::model::{ChannelId, GuildId, MessageId};
use dfmirror::sitemap::SitemapBuilder;
use dfmirror::state::AppState;
use dfmirror::store::postgres::PgMessageStore;
use dfmirror::store::MessageStore;
use dfmirror::upstream::{to_core_message, Cabinet, Event, MemberHydrator, SerenityUpstream, UpstreamClient};

const TEMPLATES: &[(&str, &str)] = &[
    ("index", include_str!("../templates/index.hbs")),
    ("guild", include_str!("../templates/guild.hbs")),
    ("forum", include_str!("../templates/forum.hbs")),
    ("post", include_str!("../templates/post.hbs")),
    ("privacy", include_str!("../templates/privacy.hbs")),
];

fn build_templates() -> Handlebars<'static> {
    let mut handlebars = Handlebars::new();
    for (name, source) in TEMPLATES.iter().copied() {
        handlebars
            .register_template_string(name, source)
            .unwrap_or_else(|e| panic!("invalid template {name}: {e}"));
    }
    handlebars
}

/// Forwards gateway events into the [`EventDispatcher`].
///
/// The dispatcher itself can only be built once the gateway client (and its
/// `http`/`cache` handles) exist, but the handler has to be registered with
/// the client builder before that. `dispatcher` is therefore wired in with
/// [`GatewayHandler::set_dispatcher`] right after the client is built and
/// before `client.start()` is called — every event the gateway delivers
/// after that point observes it set.
struct GatewayHandler {
    dispatcher: OnceCell<Arc<EventDispatcher>>,
    upstream: OnceCell<Arc<SerenityUpstream>>,
}

impl GatewayHandler {
    fn new() -> Self {
        Self {
            dispatcher: OnceCell::new(),
            upstream: OnceCell::new(),
        }
    }

    fn set_dispatcher(&self, dispatcher: Arc<EventDispatcher>) {
        if self.dispatcher.set(dispatcher).is_err() {
            panic!("GatewayHandler::set_dispatcher called twice");
        }
    }

    fn set_upstream(&self, upstream: Arc<SerenityUpstream>) {
        if self.upstream.set(upstream).is_err() {
            panic!("GatewayHandler::set_upstream called twice");
        }
    }
}

#[serenity::async_trait]
impl EventHandler for GatewayHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, "gateway connected");
        if let Some(upstream) = self.upstream.get() {
            upstream.set_shard(ctx.shard.clone());
        }
    }

    /// Forwards a member-chunk response to whichever `hydrate` call is
    /// waiting on it.
    async fn guild_members_chunk(&self, _ctx: Context, chunk: GuildMembersChunkEvent) {
        let Some(upstream) = self.upstream.get() else {
            return;
        };
        upstream.on_guild_members_chunk(
            GuildId(chunk.guild_id.get() as i64),
            chunk.chunk_index,
            chunk.chunk_count,
        );
    }

    async fn message(&self, _ctx: Context, new_message: SerenityMessage) {
        let Some(dispatcher) = self.dispatcher.get() else {
            return;
        };
        let channel = ChannelId(new_message.channel_id.get() as i64);
        let event = Event::MessageCreate(to_core_message(channel, &new_message));
        if let Err(e) = dispatcher.dispatch(event).await {
            tracing::warn!(error = ?e, "dispatching message create failed");
        }
    }

    async fn message_update(
        &self,
        ctx: Context,
        _old_if_available: Option<SerenityMessage>,
        new: Option<SerenityMessage>,
        event: MessageUpdateEvent,
    ) {
        let Some(dispatcher) = self.dispatcher.get() else {
            return;
        };
        let channel = ChannelId(event.channel_id.get() as i64);
        let message = match new {
            Some(m) => m,
            None => match event.channel_id.message(&ctx.http, event.id).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = ?e, "refetching updated message failed");
                    return;
                }
            },
        };
        let core_event = Event::MessageUpdate(to_core_message(channel, &message));
        if let Err(e) = dispatcher.dispatch(core_event).await {
            tracing::warn!(error = ?e, "dispatching message update failed");
        }
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: SerenityChannelId,
        deleted_message_id: SerenityMessageId,
        _guild_id: Option<SerenityGuildId>,
    ) {
        let Some(dispatcher) = self.dispatcher.get() else {
            return;
        };
        let event = Event::MessageDelete {
            channel_id: ChannelId(channel_id.get() as i64),
            id: MessageId(deleted_message_id.get() as i64),
        };
        if let Err(e) = dispatcher.dispatch(event).await {
            tracing::warn!(error = ?e, "dispatching message delete failed");
        }
    }

    async fn thread_update(&self, _ctx: Context, _old: Option<GuildChannel>, new: GuildChannel) {
        let Some(dispatcher) = self.dispatcher.get() else {
            return;
        };
        let Some(metadata) = new.thread_metadata else {
            return;
        };
        if !metadata.archived {
            return;
        }
        let event = Event::ThreadArchived {
            channel_id: ChannelId(new.id.get() as i64),
            archive_timestamp: metadata.archive_timestamp.to_utc(),
        };
        if let Err(e) = dispatcher.dispatch(event).await {
            tracing::warn!(error = ?e, "dispatching thread archived failed");
        }
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dfmirror=info,tower_http=info,sqlx=warn".parse().unwrap());

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("dfmirror starting");

    let config = Config::load("config.toml").expect("failed to load configuration");
    info!("configuration loaded");

    let store_impl = PgMessageStore::connect(&config.database_url)
        .await
        .expect("failed to connect to store / bring schema up to date");
    let pool = store_impl.pool();
    let store: Arc<dyn MessageStore> = Arc::new(store_impl);
    info!("store connected and schema up to date");

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let handler = Arc::new(GatewayHandler::new());
    let mut client = Client::builder(&config.bot_token, intents)
        .event_handler_arc(handler.clone())
        .await
        .expect("failed to build Discord gateway client");

    let serenity_upstream = Arc::new(SerenityUpstream::new(client.http.clone(), client.cache.clone()));
    let upstream: Arc<dyn UpstreamClient> = serenity_upstream.clone();
    let cabinet: Arc<dyn Cabinet> = serenity_upstream.clone();
    let member_hydrator: Arc<dyn MemberHydrator> = serenity_upstream.clone();
    handler.set_upstream(serenity_upstream);

    let cache_registry = Arc::new(ThreadCacheRegistry::new(store.clone(), upstream.clone()));
    let dispatcher = Arc::new(EventDispatcher::new(cache_registry.clone(), store.clone()));
    handler.set_dispatcher(dispatcher);

    let (sitemap, sitemap_schedule) = SitemapBuilder::new(
        config.sitemap_dir.clone(),
        config.public_base_url.clone(),
        cabinet.clone(),
    );
    tokio::spawn(sitemap_schedule);

    tokio::spawn(async move {
        if let Err(e) = client.start().await {
            tracing::error!(error = ?e, "gateway client terminated");
        }
    });

    let templates = build_templates();
    let app_state = AppState::new(
        pool,
        store,
        upstream,
        cabinet,
        member_hydrator,
        cache_registry,
        sitemap,
        templates,
        &config,
    );

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(40)
            .finish()
            .expect("invalid governor configuration"),
    );

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/", get(handlers::pages::get_index))
        .route("/privacy", get(handlers::pages::get_privacy))
        .route("/sitemap.xml", get(handlers::sitemap::get_sitemap_index))
        .route("/sitemap/:name", get(handlers::sitemap::get_sitemap_file))
        .route("/proxy", get(handlers::proxy::proxy_image))
        .route("/health", get(handlers::health_check))
        .route("/:guild_id", get(handlers::pages::get_guild))
        .route("/:guild_id/:forum_id", get(handlers::pages::get_forum))
        .route("/:guild_id/:forum_id/:post_id", get(handlers::pages::get_post))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .layer(GovernorLayer { config: governor_conf })
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state);

    let addr = config.server_addr();
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server failed to start");
}
