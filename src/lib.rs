//! `dfmirror` — a read-only public HTTP gateway mirroring a chat platform's
//! forum-style discussions as browsable, crawlable web pages.
//!
//! The externally visible job (guild/forum/post pages, paginated message
//! history, a sitemap) is straightforward axum plumbing. The interesting
//! part is [`cache`]: the per-thread message cache with coalesced
//! progressive backfill that sits between the upstream chat API and the
//! request handlers.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod model;
pub mod render;
pub mod sitemap;
pub mod state;
pub mod store;
pub mod upstream;
