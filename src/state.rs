use std::sync::Arc;

use handlebars::Handlebars;
use sqlx::PgPool;

use crate::cache::ThreadCacheRegistry;
use crate::config::Config;
use crate::sitemap::SitemapBuilder;
use crate::store::MessageStore;
use crate::upstream::{Cabinet, MemberHydrator, UpstreamClient};

/// Shared application state passed to all handlers.
///
/// Cheap to clone per-request: everything inside is already behind an
/// `Arc` (directly, or via `PgPool`'s own internal pooling).
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub store: Arc<dyn MessageStore>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub cabinet: Arc<dyn Cabinet>,
    pub member_hydrator: Arc<dyn MemberHydrator>,
    pub cache: Arc<ThreadCacheRegistry>,
    pub sitemap: Arc<SitemapBuilder>,
    pub templates: Arc<Handlebars<'static>>,
    pub public_base_url: Arc<str>,
    pub http_client: reqwest::Client,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        store: Arc<dyn MessageStore>,
        upstream: Arc<dyn UpstreamClient>,
        cabinet: Arc<dyn Cabinet>,
        member_hydrator: Arc<dyn MemberHydrator>,
        cache: Arc<ThreadCacheRegistry>,
        sitemap: Arc<SitemapBuilder>,
        templates: Handlebars<'static>,
        config: &Config,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self {
            pool,
            store,
            upstream,
            cabinet,
            member_hydrator,
            cache,
            sitemap,
            templates: Arc::new(templates),
            public_base_url: Arc::from(config.public_base_url.as_str()),
            http_client,
        }
    }
}
