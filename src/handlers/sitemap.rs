//! Serves the generated sitemap files. Generation itself lives in
//! [`crate::sitemap`]; these handlers are thin reads off whatever is
//! currently on disk, nudging a regeneration if nothing has been written
//! yet.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
};

use crate::error::CoreResult;
use crate::state::AppState;

const XML_CONTENT_TYPE: &str = "application/xml";

pub async fn get_sitemap_index(State(state): State<AppState>) -> CoreResult<Response> {
    let body = state.sitemap.serve_sitemap_index().await?;
    Ok(([(axum::http::header::CONTENT_TYPE, XML_CONTENT_TYPE)], body).into_response())
}

pub async fn get_sitemap_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> CoreResult<Response> {
    let body = state.sitemap.serve_sitemap(&name).await?;
    Ok(([(axum::http::header::CONTENT_TYPE, XML_CONTENT_TYPE)], body).into_response())
}
