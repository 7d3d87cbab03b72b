//! `/collections`: named, operator-curated groups of flows.

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use super::ApiContext;
use crate::error::ApiError;
use crate::types::{Collection, CollectionId, FlowId};

pub fn router() -> Router<ApiContext> {
	Router::new()
		.route("/collections", get(list_collections).post(create_collection))
		.route("/collections/{id}", axum::routing::delete(delete_collection))
		.route("/collections/{id}/items", post(add_item))
		.route("/collections/{id}/items/{flow_id}", axum::routing::delete(remove_item))
}

fn parse_collection_id(raw: &str) -> Result<CollectionId, ApiError> {
	raw.parse::<u64>().map(CollectionId).map_err(|_| ApiError::BadRequest(format!("invalid collection id {raw}")))
}

fn parse_flow_id(raw: &str) -> Result<FlowId, ApiError> {
	raw.parse::<u128>().map(FlowId).map_err(|_| ApiError::BadRequest(format!("invalid flow id {raw}")))
}

async fn list_collections(State(ctx): State<ApiContext>) -> Result<Json<Vec<Collection>>, ApiError> {
	Ok(Json(ctx.collection_store.list_collections().await?))
}

#[derive(Deserialize)]
struct CreateCollectionBody {
	name: String,
	#[serde(default)]
	item_flow_ids: Vec<FlowId>,
}

async fn create_collection(State(ctx): State<ApiContext>, Json(body): Json<CreateCollectionBody>) -> Result<Json<Collection>, ApiError> {
	let id = ctx.collection_store.put_collection(Collection { id: CollectionId(0), name: body.name, item_flow_ids: body.item_flow_ids }).await?;
	let collection = ctx.collection_store.list_collections().await?.into_iter().find(|c| c.id == id).ok_or_else(|| ApiError::NotFound(format!("collection {id} not found")))?;
	Ok(Json(collection))
}

async fn delete_collection(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
	let id = parse_collection_id(&id)?;
	let deleted = ctx.collection_store.delete_collection(id).await?;
	Ok(Json(serde_json::json!({"deleted": deleted})))
}

#[derive(Deserialize)]
struct AddItemBody {
	flow_id: String,
}

async fn add_item(State(ctx): State<ApiContext>, Path(id): Path<String>, Json(body): Json<AddItemBody>) -> Result<Json<Collection>, ApiError> {
	let id = parse_collection_id(&id)?;
	let flow_id = parse_flow_id(&body.flow_id)?;
	let collection = ctx.collection_store.add_item(id, flow_id).await?.ok_or_else(|| ApiError::NotFound(format!("collection {id} not found")))?;
	Ok(Json(collection))
}

async fn remove_item(State(ctx): State<ApiContext>, Path((id, flow_id)): Path<(String, String)>) -> Result<Json<Collection>, ApiError> {
	let id = parse_collection_id(&id)?;
	let flow_id = parse_flow_id(&flow_id)?;
	let collection = ctx.collection_store.remove_item(id, flow_id).await?.ok_or_else(|| ApiError::NotFound(format!("collection {id} not found")))?;
	Ok(Json(collection))
}
