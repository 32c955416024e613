//! Admin handlers
//!
//! Gated on a local peer or the configured admin key (query parameter for
//! compatibility, `x-admin-key` header preferred).

use super::{is_admin, ApiError};
use crate::db;
use crate::db::queries;
use crate::state::AppState;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use deployer_core::{ContainerStatus, DeployError};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

#[derive(Deserialize, Default)]
pub struct AdminQuery {
    pub admin_key: Option<String>,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub admin_key: Option<String>,
    pub container_id: Option<String>,
    #[serde(default = "default_tail")]
    pub tail: usize,
    pub since: Option<i64>,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_tail() -> usize {
    100
}

fn default_format() -> String {
    "text".to_string()
}

fn guard(
    state: &AppState,
    peer: &ConnectInfo<SocketAddr>,
    headers: &HeaderMap,
    key: Option<&str>,
) -> Result<(), ApiError> {
    if is_admin(state, peer, headers, key) {
        Ok(())
    } else {
        warn!(peer = %peer.0, "Admin access denied");
        Err(ApiError(DeployError::AdminForbidden))
    }
}

pub async fn admin_page(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
) -> Response {
    if let Err(e) = guard(&state, &ConnectInfo(peer), &headers, query.admin_key.as_deref()) {
        return e.into_response();
    }

    let body = format!(
        "<!DOCTYPE html><html><head><title>{} — admin</title></head>\
         <body><h1>Deployer admin</h1><p>See <code>/admin/status</code>.</p></body></html>",
        state.config.challenge.title,
    );
    Html(body).into_response()
}

pub async fn admin_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
) -> Response {
    if let Err(e) = guard(&state, &ConnectInfo(peer), &headers, query.admin_key.as_deref()) {
        return e.into_response();
    }

    let containers = match state.orchestrator.list_all().await {
        Ok(views) => views,
        Err(e) => return ApiError(e).into_response(),
    };
    let active = containers
        .iter()
        .filter(|c| c.status == ContainerStatus::Running.as_str())
        .count();

    let total_created = queries::total_container_count(&state.pool)
        .await
        .unwrap_or(0);
    let (total_ports, available_ports) = state.ports.pool_counts().await.unwrap_or((0, 0));
    let port_usage_percent = if total_ports > 0 {
        ((total_ports - available_ports) as f64 / total_ports as f64) * 100.0
    } else {
        0.0
    };

    let pool_stats = db::pool_stats(&state.pool);
    state
        .metrics
        .record_pool_stats(pool_stats.free_connections, pool_stats.max_connections);
    let usage = state.resources.usage();

    Json(json!({
        "status": "online",
        "challenge": state.config.challenge.title,
        "metrics": {
            "active_containers": active,
            "total_containers_created": total_created,
            "available_ports": available_ports,
            "port_usage_percent": port_usage_percent,
        },
        "database": {
            "host": state.config.store.host,
            "name": state.config.store.name,
            "connection_pool": pool_stats,
        },
        "resources": usage,
        "rate_limiting": {
            "max_containers_per_hour": state.config.rate_limit.max_per_window,
            "window_seconds": state.config.rate_limit.window_secs,
        },
        "containers": containers,
    }))
    .into_response()
}

pub async fn logs(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Response {
    if !state.config.admin.enable_logs_endpoint {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Err(e) = guard(&state, &ConnectInfo(peer), &headers, query.admin_key.as_deref()) {
        return e.into_response();
    }

    let targets: Vec<String> = match &query.container_id {
        Some(id) => {
            // 404 for ids the store has never seen.
            match queries::get_container(&state.pool, id).await {
                Ok(Some(_)) => vec![id.clone()],
                Ok(None) => {
                    return (
                        StatusCode::NOT_FOUND,
                        Json(json!({ "error": "unknown container_id" })),
                    )
                        .into_response()
                }
                Err(e) => return ApiError(DeployError::from(e)).into_response(),
            }
        }
        None => match queries::running_container_ids(&state.pool).await {
            Ok(ids) => ids,
            Err(e) => return ApiError(DeployError::from(e)).into_response(),
        },
    };

    let mut sections = Vec::with_capacity(targets.len());
    for id in &targets {
        let text = state
            .driver
            .logs(id, query.tail, query.since)
            .await
            .unwrap_or_else(|e| format!("<logs unavailable: {}>", e));
        sections.push((id.clone(), text));
    }

    if query.format == "json" {
        let entries: Vec<_> = sections
            .into_iter()
            .map(|(id, text)| {
                json!({
                    "container_id": id,
                    "lines": text.lines().collect::<Vec<_>>(),
                })
            })
            .collect();
        Json(json!({ "logs": entries })).into_response()
    } else {
        let mut body = String::new();
        for (id, text) in sections {
            if targets.len() > 1 {
                body.push_str(&format!("==> {} <==\n", id));
            }
            body.push_str(&text);
            if !text.ends_with('\n') {
                body.push('\n');
            }
        }
        ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
    }
}

pub async fn metrics(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<AdminQuery>,
) -> Response {
    if !state.config.admin.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Err(e) = guard(&state, &ConnectInfo(peer), &headers, query.admin_key.as_deref()) {
        return e.into_response();
    }

    let pool_stats = db::pool_stats(&state.pool);
    state
        .metrics
        .record_pool_stats(pool_stats.free_connections, pool_stats.max_connections);

    match state.metrics.encode_text() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
