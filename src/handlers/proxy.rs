//! Image proxy: streams Discord CDN media through this server so pages
//! never link directly to a third-party host. SSRF-guarded (`is_private_ip`,
//! bounded fetch timeout, explicit user agent) since it fetches an untrusted
//! remote URL on the server's behalf.

use std::net::IpAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::state::AppState;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; dfmirror/1.0; +mirror image proxy)";

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub url: String,
}

/// Returns `true` if `ip` is a private, loopback, or link-local address, so
/// the proxy cannot be used to reach internal services.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            matches!(
                o,
                [127, ..] | [10, ..] | [169, 254, ..] | [192, 168, ..] | [0, ..] | [255, 255, 255, 255]
            ) || (o[0] == 172 && (16..=31).contains(&o[1]))
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00 == 0xfc00)
                || (v6.segments()[0] & 0xffc0 == 0xfe80)
        }
    }
}

fn validate_remote_host(url: &url::Url) -> CoreResult<()> {
    let host = url
        .host_str()
        .ok_or_else(|| CoreError::Validation("proxy url has no host".into()))?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(CoreError::Forbidden("refusing to proxy a private address".into()));
        }
    }
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CoreError::Validation("proxy url must be http(s)".into()));
    }
    Ok(())
}

/// `GET /proxy?url=...` — streams a remote media URL back to the client
/// without the client ever talking to the upstream CDN directly.
pub async fn proxy_image(
    State(state): State<AppState>,
    Query(q): Query<ProxyQuery>,
) -> CoreResult<Response> {
    let parsed = url::Url::parse(&q.url).map_err(|_| CoreError::Validation("invalid proxy url".into()))?;
    validate_remote_host(&parsed)?;

    let resp = state
        .http_client
        .get(parsed)
        .timeout(FETCH_TIMEOUT)
        .header(axum::http::header::USER_AGENT, USER_AGENT)
        .send()
        .await
        .map_err(|e| CoreError::UpstreamTransport(format!("fetching proxied image: {e}")))?;

    if !resp.status().is_success() {
        return Err(CoreError::NotFound("proxied resource not found".into()));
    }

    let content_type = resp
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| axum::http::HeaderValue::from_static("application/octet-stream"));

    let stream = resp.bytes_stream().map_err(std::io::Error::other);
    let body = Body::from_stream(stream);

    let response = Response::builder()
        .header(axum::http::header::CONTENT_TYPE, content_type)
        .body(body)
        .expect("content-type copied from a valid response and a streamed body always build");
    Ok(response.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_loopback() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn rejects_rfc1918_ranges() {
        assert!(is_private_ip("10.0.0.5".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn allows_public_address() {
        assert!(!is_private_ip("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let url = url::Url::parse("ftp://example.com/a.png").unwrap();
        assert!(validate_remote_host(&url).is_err());
    }
}
