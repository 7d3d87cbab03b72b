//! `/intruder`: fuzzing attack configuration, lifecycle control, and result retrieval.

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use super::ApiContext;
use crate::error::ApiError;
use crate::types::{AttackConfig, AttackId, AttackStrategy, AttackTemplate, IntruderAttack, IntruderResult, Position};

pub fn router() -> Router<ApiContext> {
	Router::new()
		.route("/intruder", get(list_attacks).post(create_attack))
		.route("/intruder/{id}", get(get_attack))
		.route("/intruder/{id}/results", get(list_results))
		.route("/intruder/{id}/start", post(start_attack))
		.route("/intruder/{id}/pause", post(pause_attack))
		.route("/intruder/{id}/stop", post(stop_attack))
}

fn parse_attack_id(raw: &str) -> Result<AttackId, ApiError> {
	raw.parse::<u64>().map(AttackId).map_err(|_| ApiError::BadRequest(format!("invalid attack id {raw}")))
}

async fn list_attacks(State(ctx): State<ApiContext>) -> Result<Json<Vec<IntruderAttack>>, ApiError> {
	Ok(Json(ctx.attack_store.list_attacks().await?))
}

#[derive(Deserialize)]
struct CreateAttackBody {
	template: AttackTemplate,
	positions: Vec<Position>,
	payload_sets: Vec<Vec<String>>,
	strategy: AttackStrategy,
	#[serde(default)]
	config: AttackConfig,
}

async fn create_attack(State(ctx): State<ApiContext>, Json(body): Json<CreateAttackBody>) -> Result<Json<IntruderAttack>, ApiError> {
	let id = ctx.intruder.configure(body.template, body.positions, body.payload_sets, body.strategy, body.config).await?;
	let attack = ctx.attack_store.get_attack(id).await?.ok_or_else(|| ApiError::NotFound(format!("attack {id} not found")))?;
	Ok(Json(attack))
}

async fn get_attack(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<IntruderAttack>, ApiError> {
	let id = parse_attack_id(&id)?;
	let attack = ctx.attack_store.get_attack(id).await?.ok_or_else(|| ApiError::NotFound(format!("attack {id} not found")))?;
	Ok(Json(attack))
}

async fn list_results(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<Vec<IntruderResult>>, ApiError> {
	let id = parse_attack_id(&id)?;
	Ok(Json(ctx.attack_store.list_results(id).await?))
}

async fn start_attack(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_attack_id(&id)?;
	ctx.intruder.start(id).await?;
	Ok(Json(serde_json::json!({"status": "started"})))
}

async fn pause_attack(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_attack_id(&id)?;
	ctx.intruder.pause(id).await;
	Ok(Json(serde_json::json!({"status": "paused"})))
}

async fn stop_attack(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_attack_id(&id)?;
	ctx.intruder.stop(id).await;
	Ok(Json(serde_json::json!({"status": "stopped"})))
}
