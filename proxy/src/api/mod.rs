//! REST/WebSocket facade: one `axum` `Router` per entity family, merged behind a single shared
//! `ApiContext`, matching the gateway crate's `axum`/`axum-extra`/`tower-http` admin surface
//! rather than the hand-rolled `hyper` services used for single-route management endpoints.

mod analyzers;
mod collections;
mod intruder;
mod proxy;
mod requests;
mod rules;
mod scanner;
mod sitemap;
mod spider;
mod ws;

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};

use proxy_core::readiness::Ready;

use crate::ca::CaStore;
use crate::client::UpstreamClient;
use crate::engine::ProxyEngine;
use crate::error::ApiError;
use crate::eventbus::EventBus;
use crate::intercept::SharedInterceptCoordinator;
use crate::intruder::IntruderEngine;
use crate::scanner::ScannerEngine;
use crate::sitemap::SiteMapBuilder;
use crate::spider::SpiderEngine;
use crate::store::{AttackStore, CollectionStore, FlowStore, RuleStore, ScanStore, SpiderStore};

/// Everything a route handler needs, bundled once and cheaply cloned per request (every field is
/// already an `Arc` or an `Arc`-wrapping newtype).
#[derive(Clone)]
pub struct ApiContext {
	pub engine: ProxyEngine,
	pub ca: Arc<CaStore>,
	pub bus: Arc<EventBus>,
	pub intercept: SharedInterceptCoordinator,
	pub client: UpstreamClient,
	pub flow_store: Arc<dyn FlowStore>,
	pub rule_store: Arc<dyn RuleStore>,
	pub attack_store: Arc<dyn AttackStore>,
	pub spider_store: Arc<dyn SpiderStore>,
	pub scan_store: Arc<dyn ScanStore>,
	pub collection_store: Arc<dyn CollectionStore>,
	pub intruder: IntruderEngine,
	pub spider: SpiderEngine,
	pub scanner: ScannerEngine,
	pub sitemap: SiteMapBuilder,
	pub ready: Ready,
}

/// Builds the full `/api` router plus `/ws`, with CORS applied per `cors_origins`.
pub fn build_router(ctx: ApiContext, cors_origins: &[String]) -> Router {
	let api = Router::new()
		.route("/healthz", get(healthz))
		.merge(requests::router())
		.merge(rules::router())
		.merge(proxy::router())
		.merge(intruder::router())
		.merge(spider::router())
		.merge(scanner::router())
		.merge(analyzers::router())
		.merge(sitemap::router())
		.merge(collections::router())
		.with_state(ctx.clone());

	Router::new()
		.nest("/api", api)
		.route("/ws", get(ws::handler))
		.route("/readyz", get(readyz))
		.layer(cors_layer(cors_origins))
		.with_state(ctx)
}

async fn readyz(axum::extract::State(ctx): axum::extract::State<ApiContext>) -> impl IntoResponse {
	if ctx.ready.is_ready() {
		(StatusCode::OK, "ready".to_string())
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, format!("pending: {:?}", ctx.ready.pending()))
	}
}

fn cors_layer(origins: &[String]) -> CorsLayer {
	if origins.is_empty() {
		return CorsLayer::new();
	}
	let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
	CorsLayer::new().allow_origin(AllowOrigin::list(parsed)).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
}

async fn healthz() -> &'static str {
	"ok"
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		(status, Json(json!({"error": self.to_string()}))).into_response()
	}
}
