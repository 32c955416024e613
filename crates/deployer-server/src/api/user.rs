//! User-facing handlers

use super::{identify, source_ip, with_identity, ApiError};
use crate::state::AppState;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Deserialize, Default)]
pub struct DeployRequest {
    #[serde(default)]
    pub captcha_id: String,
    #[serde(default)]
    pub captcha_answer: String,
}

/// Minimal HTML shell; the real page is served by the external frontend.
/// Returning users see their running instance inline.
pub async fn index(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = identify(&headers);

    let instance = if identity.fresh {
        None
    } else {
        state
            .orchestrator
            .get_owned(&identity.user_uuid)
            .await
            .unwrap_or(None)
    };

    let instance_html = match instance {
        Some(view) => format!(
            "<p>Your instance is {} on port {} ({}s left).</p>",
            if view.running { "running" } else { "not running" },
            view.port,
            view.time_left,
        ),
        None => "<p>No instance deployed yet.</p>".to_string(),
    };

    let body = format!(
        "<!DOCTYPE html><html><head><title>{}</title></head>\
         <body><h1>{}</h1><p>{}</p>{}</body></html>",
        state.config.challenge.title,
        state.config.challenge.title,
        state.config.challenge.description,
        instance_html,
    );
    with_identity(&identity, Html(body).into_response())
}

pub async fn get_captcha(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = identify(&headers);
    let (captcha_id, captcha_image) = state.captcha.create();
    state.metrics.captcha_generated();

    with_identity(
        &identity,
        Json(json!({
            "captcha_id": captcha_id,
            "captcha_image": captcha_image,
        }))
        .into_response(),
    )
}

pub async fn deploy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<DeployRequest>>,
) -> Response {
    let identity = identify(&headers);
    let ip = source_ip(&headers, &ConnectInfo(peer));
    let Json(request) = body.unwrap_or_default();

    info!(user_uuid = %identity.user_uuid, ip = %ip, "Deploy request");

    let result = state
        .orchestrator
        .deploy(
            &identity.user_uuid,
            &ip,
            &request.captcha_id,
            &request.captcha_answer,
        )
        .await;

    let response = match result {
        Ok(outcome) => Json(json!({
            "message": "Your challenge instance is ready",
            "port": outcome.port,
            "id": outcome.container_id,
            "expiration_time": outcome.expiration_time,
        }))
        .into_response(),
        Err(e) => ApiError(e).into_response(),
    };
    with_identity(&identity, response)
}

pub async fn stop(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = identify(&headers);

    let response = match state.orchestrator.stop(&identity.user_uuid).await {
        Ok(()) => Json(json!({ "message": "Challenge instance stopped" })).into_response(),
        Err(e) => ApiError(e).into_response(),
    };
    with_identity(&identity, response)
}

pub async fn restart(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = identify(&headers);

    let response = match state.orchestrator.restart(&identity.user_uuid).await {
        Ok(outcome) => Json(json!({
            "message": "Challenge instance restarted",
            "port": outcome.port,
            "expiration_time": outcome.expiration_time,
        }))
        .into_response(),
        Err(e) => ApiError(e).into_response(),
    };
    with_identity(&identity, response)
}

pub async fn extend(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identity = identify(&headers);

    let response = match state.orchestrator.extend(&identity.user_uuid).await {
        Ok(new_expiration_time) => Json(json!({
            "message": "Challenge lifetime extended",
            "new_expiration_time": new_expiration_time,
        }))
        .into_response(),
        Err(e) => ApiError(e).into_response(),
    };
    with_identity(&identity, response)
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "online",
        "challenge": state.config.challenge.title,
    }))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}
