//! `/scan`: on-demand active/passive checks against a recorded flow, and the accumulated issue list.

use axum::Json;
use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use super::ApiContext;
use crate::error::ApiError;
use crate::types::{FlowId, ScanIssue};

pub fn router() -> Router<ApiContext> {
	Router::new().route("/scan", post(scan_flow)).route("/scan/issues", get(list_issues))
}

#[derive(Deserialize)]
struct ScanBody {
	flow_id: String,
	#[serde(default)]
	checks: Vec<String>,
}

async fn scan_flow(State(ctx): State<ApiContext>, Json(body): Json<ScanBody>) -> Result<Json<Vec<ScanIssue>>, ApiError> {
	let flow_id = body.flow_id.parse::<u128>().map(FlowId).map_err(|_| ApiError::BadRequest(format!("invalid flow_id {}", body.flow_id)))?;
	let flow = ctx.flow_store.get_flow(flow_id).await?.ok_or_else(|| ApiError::NotFound(format!("flow {flow_id} not found")))?;
	let issues = ctx.scanner.scan_flow(flow, &body.checks).await?;
	Ok(Json(issues))
}

async fn list_issues(State(ctx): State<ApiContext>) -> Result<Json<Vec<ScanIssue>>, ApiError> {
	Ok(Json(ctx.scan_store.list_issues().await?))
}
