//! `/rules`: rule engine CRUD plus the `/toggle` convenience route.

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use super::ApiContext;
use crate::error::ApiError;
use crate::store::RulePatch;
use crate::types::{ActionType, ApplyTo, MatchType, Rule, RuleId};

pub fn router() -> Router<ApiContext> {
	Router::new()
		.route("/rules", get(list_rules).post(create_rule))
		.route("/rules/{id}", get(get_rule).patch(patch_rule).delete(delete_rule))
		.route("/rules/{id}/toggle", axum::routing::post(toggle_rule))
}

fn parse_rule_id(raw: &str) -> Result<RuleId, ApiError> {
	raw.parse::<u64>().map(RuleId).map_err(|_| ApiError::BadRequest(format!("invalid rule id {raw}")))
}

async fn list_rules(State(ctx): State<ApiContext>) -> Result<Json<Vec<Rule>>, ApiError> {
	Ok(Json(ctx.rule_store.list_rules().await?))
}

#[derive(Deserialize)]
struct CreateRuleBody {
	name: String,
	#[serde(default = "default_enabled")]
	enabled: bool,
	#[serde(default)]
	priority: i32,
	match_type: MatchType,
	match_pattern: String,
	#[serde(default)]
	match_regex: bool,
	action_type: ActionType,
	#[serde(default)]
	action_target: String,
	#[serde(default)]
	action_value: String,
	apply_to: ApplyTo,
}

fn default_enabled() -> bool {
	true
}

async fn create_rule(State(ctx): State<ApiContext>, Json(body): Json<CreateRuleBody>) -> Result<Json<Rule>, ApiError> {
	let existing = ctx.rule_store.list_rules().await?;
	let rule = Rule {
		id: RuleId(existing.iter().map(|r| r.id.0).max().unwrap_or(0) + 1),
		name: body.name,
		enabled: body.enabled,
		priority: body.priority,
		sequence: existing.len() as u64,
		match_type: body.match_type,
		match_pattern: body.match_pattern,
		match_regex: body.match_regex,
		action_type: body.action_type,
		action_target: body.action_target,
		action_value: body.action_value,
		apply_to: body.apply_to,
	};
	let id = ctx.rule_store.put_rule(rule.clone()).await?;
	ctx.engine.set_rules(ctx.rule_store.list_rules().await?).await;
	Ok(Json(Rule { id, ..rule }))
}

async fn get_rule(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<Rule>, ApiError> {
	let id = parse_rule_id(&id)?;
	let rule = ctx.rule_store.list_rules().await?.into_iter().find(|r| r.id == id).ok_or_else(|| ApiError::NotFound(format!("rule {id} not found")))?;
	Ok(Json(rule))
}

async fn patch_rule(State(ctx): State<ApiContext>, Path(id): Path<String>, Json(patch): Json<RulePatch>) -> Result<Json<Rule>, ApiError> {
	let id = parse_rule_id(&id)?;
	let rule = ctx.rule_store.patch_rule(id, patch).await?.ok_or_else(|| ApiError::NotFound(format!("rule {id} not found")))?;
	ctx.engine.set_rules(ctx.rule_store.list_rules().await?).await;
	Ok(Json(rule))
}

async fn delete_rule(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_rule_id(&id)?;
	let deleted = ctx.rule_store.delete_rule(id).await?;
	ctx.engine.set_rules(ctx.rule_store.list_rules().await?).await;
	Ok(Json(serde_json::json!({"deleted": deleted})))
}

async fn toggle_rule(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_rule_id(&id)?;
	let enabled = ctx.rule_store.toggle_rule(id).await?.ok_or_else(|| ApiError::NotFound(format!("rule {id} not found")))?;
	ctx.engine.set_rules(ctx.rule_store.list_rules().await?).await;
	Ok(Json(serde_json::json!({"enabled": enabled})))
}
