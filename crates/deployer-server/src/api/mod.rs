//! HTTP surface
//!
//! Every handler derives the caller's pseudonymous identity from the
//! `ctf_user` cookie (minting one when absent), extracts the source address
//! from the first forwarded header or the socket peer, and maps
//! [`DeployError`] onto the stable status/JSON contract.

pub mod admin;
pub mod user;

use crate::state::AppState;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use deployer_core::DeployError;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub const COOKIE_NAME: &str = "ctf_user";
const COOKIE_MAX_AGE_SECS: u64 = 31_536_000; // one year

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(user::index))
        .route("/get_captcha", get(user::get_captcha))
        .route("/deploy", post(user::deploy))
        .route("/stop", post(user::stop))
        .route("/restart", post(user::restart))
        .route("/extend", post(user::extend))
        .route("/status", get(user::status))
        .route("/health", get(user::health))
        .route("/admin", get(admin::admin_page))
        .route("/admin/status", get(admin::admin_status))
        .route("/logs", get(admin::logs))
        .route("/metrics", get(admin::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error response carrying the mapped status code
pub struct ApiError(pub DeployError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        ApiError(err)
    }
}

/// Caller identity derived from the cookie
pub struct Identity {
    pub user_uuid: String,
    /// True when the uuid was minted for this request and the response must
    /// set the cookie
    pub fresh: bool,
}

pub fn identify(headers: &HeaderMap) -> Identity {
    match cookie_value(headers, COOKIE_NAME) {
        Some(uuid) if !uuid.is_empty() => Identity {
            user_uuid: uuid,
            fresh: false,
        },
        _ => Identity {
            user_uuid: Uuid::new_v4().to_string(),
            fresh: true,
        },
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// `Set-Cookie` header value for a freshly minted identity.
pub fn identity_cookie(user_uuid: &str) -> String {
    format!(
        "{}={}; HttpOnly; Path=/; Max-Age={}; SameSite=Lax",
        COOKIE_NAME, user_uuid, COOKIE_MAX_AGE_SECS
    )
}

/// Attach the identity cookie to a response when it was freshly minted.
pub fn with_identity(identity: &Identity, response: Response) -> Response {
    if !identity.fresh {
        return response;
    }
    let mut response = response;
    if let Ok(value) = identity_cookie(&identity.user_uuid).parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

/// Source address: first forwarded entry, else the socket peer.
pub fn source_ip(headers: &HeaderMap, peer: &ConnectInfo<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| peer.0.ip().to_string())
}

/// Admin access: local peer, or the configured key via query parameter or
/// `x-admin-key` header.
pub fn is_admin(
    state: &AppState,
    peer: &ConnectInfo<SocketAddr>,
    headers: &HeaderMap,
    query_key: Option<&str>,
) -> bool {
    if is_local_peer(peer.0.ip()) {
        return true;
    }

    let configured = state.config.admin.admin_key.as_str();
    if query_key == Some(configured) {
        return true;
    }
    headers
        .get("x-admin-key")
        .and_then(|value| value.to_str().ok())
        == Some(configured)
}

fn is_local_peer(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_identity_from_cookie() {
        let headers = headers_with_cookie("ctf_user=abc-123; other=x");
        let identity = identify(&headers);
        assert_eq!(identity.user_uuid, "abc-123");
        assert!(!identity.fresh);
    }

    #[test]
    fn test_identity_minted_when_absent() {
        let identity = identify(&HeaderMap::new());
        assert!(identity.fresh);
        assert!(Uuid::parse_str(&identity.user_uuid).is_ok());
    }

    #[test]
    fn test_identity_cookie_attributes() {
        let cookie = identity_cookie("u-1");
        assert!(cookie.starts_with("ctf_user=u-1;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Max-Age=31536000"));
    }

    #[test]
    fn test_source_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 172.16.0.1"),
        );
        let peer = ConnectInfo("192.168.1.5:4242".parse().unwrap());
        assert_eq!(source_ip(&headers, &peer), "10.0.0.1");
    }

    #[test]
    fn test_source_ip_falls_back_to_peer() {
        let peer = ConnectInfo("192.168.1.5:4242".parse().unwrap());
        assert_eq!(source_ip(&HeaderMap::new(), &peer), "192.168.1.5");
    }

    #[test]
    fn test_local_peer_detection() {
        assert!(is_local_peer("127.0.0.1".parse().unwrap()));
        assert!(is_local_peer("169.254.10.1".parse().unwrap()));
        assert!(is_local_peer("::1".parse().unwrap()));
        assert!(is_local_peer("fe80::1".parse().unwrap()));
        assert!(!is_local_peer("10.0.0.1".parse().unwrap()));
    }
}
