//! `/targets`: the aggregated per-host site map built from recorded flows.

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;

use super::ApiContext;
use crate::error::ApiError;
use crate::types::HostSiteMap;

pub fn router() -> Router<ApiContext> {
	Router::new().route("/targets", get(list_targets)).route("/targets/{host}", get(get_target)).route("/targets/rebuild", post(rebuild_targets))
}

async fn list_targets(State(ctx): State<ApiContext>) -> Result<Json<Vec<HostSiteMap>>, ApiError> {
	Ok(Json(ctx.sitemap.list().await?))
}

async fn get_target(State(ctx): State<ApiContext>, Path(host): Path<String>) -> Result<Json<HostSiteMap>, ApiError> {
	let map = ctx.sitemap.get(&host).await?.ok_or_else(|| ApiError::NotFound(format!("no site map recorded for {host}")))?;
	Ok(Json(map))
}

async fn rebuild_targets(State(ctx): State<ApiContext>) -> Result<Json<serde_json::Value>, ApiError> {
	let count = ctx.sitemap.rebuild().await?;
	Ok(Json(serde_json::json!({"hosts_rebuilt": count})))
}
