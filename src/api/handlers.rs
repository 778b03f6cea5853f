use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use super::error::ApiResult;
use super::AppState;
use crate::domain::{
    EntityKind, FRouter, GraphPosition, Node, ProxyConfigPatch, ProxyEdge, SlotNode, VeaError,
};
use crate::frouter::{compile, normalize_default_priorities};
use crate::proxy::{KernelLogSnapshot, ProxyStatus};

const EFFECTS_HEADER: &str = "x-vea-effects";

/// Chain graph body of `PUT /frouters/{id}/graph` and its validate twin
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GraphPayload {
    pub edges: Vec<ProxyEdge>,
    pub positions: BTreeMap<String, GraphPosition>,
    pub slots: Vec<SlotNode>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub since: i64,
}

pub async fn get_snapshot(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(json!({
        "frouters": state.frouters.list()?,
        "nodes": state.nodes.list()?,
        "components": state.components.list()?,
        "proxyConfig": state.settings.get_proxy_config()?,
        "proxyStatus": state.proxy.status(),
        "generatedAt": Utc::now(),
    })))
}

pub async fn list_frouters(State(state): State<AppState>) -> ApiResult<Json<Vec<FRouter>>> {
    Ok(Json(state.frouters.list()?))
}

pub async fn create_frouter(
    State(state): State<AppState>,
    Json(mut frouter): Json<FRouter>,
) -> ApiResult<impl IntoResponse> {
    // An empty chain is stored as-is; start rejects it later.
    if !frouter.chain_proxy.edges.is_empty() {
        normalize_default_priorities(&mut frouter.chain_proxy.edges);
        compile(&frouter, &state.nodes.list()?).map_err(VeaError::from)?;
        frouter.chain_proxy.updated_at = Some(Utc::now());
    }
    let created = state.frouters.create(frouter)?;
    tracing::info!(frouter = %created.id, "frouter created");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_frouter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<FRouter>> {
    Ok(Json(state.frouters.get(&id)?))
}

pub async fn delete_frouter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.frouters.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_graph(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let frouter = state.frouters.get(&id)?;
    Ok(Json(frouter.chain_proxy))
}

pub async fn put_graph(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<GraphPayload>,
) -> ApiResult<Response> {
    let mut frouter = state.frouters.get(&id)?;
    let mut edges = payload.edges;
    normalize_default_priorities(&mut edges);

    frouter.chain_proxy.edges = edges;
    frouter.chain_proxy.positions = payload.positions;
    frouter.chain_proxy.slots = payload.slots;
    compile(&frouter, &state.nodes.list()?).map_err(VeaError::from)?;

    frouter.chain_proxy.updated_at = Some(Utc::now());
    let updated = state.frouters.update(&id, frouter)?;

    let mut response = Json(updated).into_response();
    if state.proxy.schedule_restart() {
        tracing::info!(frouter = %id, "graph saved, proxy restart scheduled");
        response.headers_mut().insert(
            HeaderName::from_static(EFFECTS_HEADER),
            HeaderValue::from_static("proxy_restart_scheduled"),
        );
    }
    Ok(response)
}

pub async fn validate_graph(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<GraphPayload>,
) -> ApiResult<Json<GraphValidation>> {
    let mut frouter = state.frouters.get(&id)?;
    frouter.chain_proxy.edges = payload.edges;
    frouter.chain_proxy.positions = payload.positions;
    frouter.chain_proxy.slots = payload.slots;

    let result = match compile(&frouter, &state.nodes.list()?) {
        Ok(compiled) => GraphValidation {
            valid: true,
            errors: Vec::new(),
            warnings: compiled.warnings,
        },
        Err(err) => GraphValidation {
            valid: false,
            errors: err.problems,
            warnings: Vec::new(),
        },
    };
    Ok(Json(result))
}

pub async fn ping_frouter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.frouters.get(&id)?;
    let queued = state.probes.probe_frouter_latency(&id);
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": queued }))))
}

pub async fn speedtest_frouter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.frouters.get(&id)?;
    let queued = state.probes.probe_frouter_speed(&id);
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": queued }))))
}

pub async fn get_proxy_config(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.settings.get_proxy_config()?))
}

pub async fn put_proxy_config(
    State(state): State<AppState>,
    Json(patch): Json<ProxyConfigPatch>,
) -> ApiResult<impl IntoResponse> {
    let mut config = state.settings.get_proxy_config()?;
    config.apply_patch(patch);
    config.updated_at = Some(Utc::now());
    Ok(Json(state.settings.update_proxy_config(config)?))
}

pub async fn start_proxy(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<ProxyStatus>> {
    let patch = if body.iter().all(u8::is_ascii_whitespace) {
        ProxyConfigPatch::default()
    } else {
        serde_json::from_slice::<ProxyConfigPatch>(&body)
            .map_err(|e| VeaError::invalid(format!("invalid start request: {}", e)))?
    };

    let mut config = state.settings.get_proxy_config()?;
    config.apply_patch(patch);
    Ok(Json(state.proxy.start(config).await?))
}

pub async fn stop_proxy(State(state): State<AppState>) -> ApiResult<Json<ProxyStatus>> {
    Ok(Json(state.proxy.stop().await?))
}

pub async fn proxy_status(State(state): State<AppState>) -> Json<ProxyStatus> {
    Json(state.proxy.status())
}

pub async fn kernel_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<KernelLogSnapshot> {
    Json(state.proxy.kernel_logs(query.since).await)
}

pub async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<Node>>> {
    Ok(Json(state.nodes.list()?))
}

pub async fn create_node(
    State(state): State<AppState>,
    Json(node): Json<Node>,
) -> ApiResult<impl IntoResponse> {
    let created = state.nodes.create(node)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.nodes.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn ping_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    require_node(&state, &id)?;
    let queued = state.probes.probe_node_latency(&id);
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": queued }))))
}

pub async fn speedtest_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    require_node(&state, &id)?;
    let queued = state.probes.probe_node_speed(&id);
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": queued }))))
}

fn require_node(state: &AppState, id: &str) -> Result<(), VeaError> {
    if id.trim().is_empty() {
        return Err(VeaError::not_found(EntityKind::Node, id));
    }
    state.nodes.get(id).map(|_| ())
}
