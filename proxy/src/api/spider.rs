//! `/spider`: crawl session configuration, lifecycle control, and discovered-URL retrieval.

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use super::ApiContext;
use crate::error::ApiError;
use crate::types::{SessionId, SpiderLimits, SpiderPoliteness, SpiderScope, SpiderSession, SpiderUrl};

pub fn router() -> Router<ApiContext> {
	Router::new()
		.route("/spider", get(list_sessions).post(create_session))
		.route("/spider/{id}", get(get_session))
		.route("/spider/{id}/urls", get(list_urls))
		.route("/spider/{id}/start", post(start_session))
		.route("/spider/{id}/pause", post(pause_session))
		.route("/spider/{id}/stop", post(stop_session))
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
	raw.parse::<u64>().map(SessionId).map_err(|_| ApiError::BadRequest(format!("invalid session id {raw}")))
}

async fn list_sessions(State(ctx): State<ApiContext>) -> Result<Json<Vec<SpiderSession>>, ApiError> {
	Ok(Json(ctx.spider_store.list_sessions().await?))
}

#[derive(Deserialize)]
struct CreateSessionBody {
	start_urls: Vec<String>,
	#[serde(default)]
	scope: SpiderScope,
	#[serde(default)]
	limits: SpiderLimits,
	#[serde(default)]
	politeness: SpiderPoliteness,
}

async fn create_session(State(ctx): State<ApiContext>, Json(body): Json<CreateSessionBody>) -> Result<Json<SpiderSession>, ApiError> {
	let id = ctx.spider.configure(body.start_urls, body.scope, body.limits, body.politeness).await?;
	let session = ctx.spider_store.get_session(id).await?.ok_or_else(|| ApiError::NotFound(format!("spider session {id} not found")))?;
	Ok(Json(session))
}

async fn get_session(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<SpiderSession>, ApiError> {
	let id = parse_session_id(&id)?;
	let session = ctx.spider_store.get_session(id).await?.ok_or_else(|| ApiError::NotFound(format!("spider session {id} not found")))?;
	Ok(Json(session))
}

async fn list_urls(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<Vec<SpiderUrl>>, ApiError> {
	let id = parse_session_id(&id)?;
	Ok(Json(ctx.spider_store.list_urls(id).await?))
}

async fn start_session(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_session_id(&id)?;
	ctx.spider.start(id).await?;
	Ok(Json(serde_json::json!({"status": "started"})))
}

async fn pause_session(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_session_id(&id)?;
	ctx.spider.pause(id).await;
	Ok(Json(serde_json::json!({"status": "paused"})))
}

async fn stop_session(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_session_id(&id)?;
	ctx.spider.stop(id).await;
	Ok(Json(serde_json::json!({"status": "stopped"})))
}
