//! `/requests`: the recorded-flow list and per-flow detail/tag/delete routes.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use super::ApiContext;
use crate::error::ApiError;
use crate::store::{FlowFilter, Paging};
use crate::types::{Flow, FlowId};

pub fn router() -> Router<ApiContext> {
	Router::new()
		.route("/requests", get(list_requests).delete(clear_requests))
		.route("/requests/{id}", get(get_request).delete(delete_request))
		.route("/requests/{id}/tags", axum::routing::post(tag_request))
}

#[derive(Deserialize)]
struct ListQuery {
	method: Option<String>,
	host: Option<String>,
	status_code: Option<u16>,
	search: Option<String>,
	is_websocket: Option<bool>,
	limit: Option<usize>,
	offset: Option<usize>,
}

async fn list_requests(State(ctx): State<ApiContext>, Query(q): Query<ListQuery>) -> Result<Json<Vec<Flow>>, ApiError> {
	let filter = FlowFilter { method: q.method, host: q.host, status_code: q.status_code, search: q.search, is_websocket: q.is_websocket };
	let paging = Paging { limit: q.limit, offset: q.offset.unwrap_or(0) };
	let flows = ctx.flow_store.list_flows(&filter, paging).await?;
	Ok(Json(flows))
}

async fn clear_requests(State(ctx): State<ApiContext>) -> Result<Json<serde_json::Value>, ApiError> {
	ctx.flow_store.clear_flows().await?;
	Ok(Json(serde_json::json!({"status": "cleared"})))
}

fn parse_flow_id(raw: &str) -> Result<FlowId, ApiError> {
	raw.parse::<u128>().map(FlowId).map_err(|_| ApiError::BadRequest(format!("invalid flow id {raw}")))
}

async fn get_request(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<Flow>, ApiError> {
	let id = parse_flow_id(&id)?;
	let flow = ctx.flow_store.get_flow(id).await?.ok_or_else(|| ApiError::NotFound(format!("flow {id} not found")))?;
	Ok(Json(flow))
}

async fn delete_request(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_flow_id(&id)?;
	let deleted = ctx.flow_store.delete_flow(id).await?;
	Ok(Json(serde_json::json!({"deleted": deleted})))
}

#[derive(Deserialize)]
struct TagBody {
	tags: Vec<String>,
}

async fn tag_request(State(ctx): State<ApiContext>, Path(id): Path<String>, Json(body): Json<TagBody>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_flow_id(&id)?;
	let tagged = ctx.flow_store.tag_flow(id, body.tags).await?;
	Ok(Json(serde_json::json!({"tagged": tagged})))
}
