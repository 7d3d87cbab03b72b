//! `/proxy/*`: engine lifecycle, intercept resolution, certificate download, and replay.
//!
//! `/proxy/system/*` registers (or unregisters) this proxy as the OS system proxy; that's a
//! platform-specific shell-out with no portable implementation here, so it always reports
//! `unsupported` through the `SystemProxyRegistrar` seam rather than pretending to succeed.

use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http_body_util::Full;
use serde::{Deserialize, Serialize};

use super::ApiContext;
use crate::client::Destination;
use crate::error::ApiError;
use crate::types::{Flow, FlowId, InterceptDecision, InterceptPhase, InterceptSnapshot, ModifiedBody};

pub fn router() -> Router<ApiContext> {
	Router::new()
		.route("/proxy/status", get(status))
		.route("/proxy/start", post(start))
		.route("/proxy/stop", post(stop))
		.route("/proxy/intercept", get(list_intercept))
		.route("/proxy/intercept/toggle", post(toggle_intercept))
		.route("/proxy/intercept/action", post(intercept_action))
		.route("/proxy/replay", post(replay))
		.route("/proxy/certificate", get(certificate))
		.route("/proxy/system/status", get(system_status))
		.route("/proxy/system/enable", post(system_enable))
		.route("/proxy/system/disable", post(system_disable))
}

async fn status(State(ctx): State<ApiContext>) -> Json<crate::engine::EngineStatus> {
	Json(ctx.engine.status().await)
}

#[derive(Deserialize)]
struct StartBody {
	host: String,
	port: u16,
}

async fn start(State(ctx): State<ApiContext>, Json(body): Json<StartBody>) -> Result<Json<serde_json::Value>, ApiError> {
	ctx.engine.set_rules(ctx.rule_store.list_rules().await?).await;
	ctx.engine.start(&body.host, body.port).await.map_err(ApiError::from)?;
	Ok(Json(serde_json::json!({"status": "started"})))
}

async fn stop(State(ctx): State<ApiContext>) -> Json<serde_json::Value> {
	ctx.engine.stop().await;
	Json(serde_json::json!({"status": "stopped"}))
}

async fn list_intercept(State(ctx): State<ApiContext>) -> Json<Vec<InterceptSnapshot>> {
	Json(ctx.intercept.list().await)
}

#[derive(Deserialize)]
struct ToggleInterceptBody {
	phase: InterceptPhase,
	enabled: bool,
}

async fn toggle_intercept(State(ctx): State<ApiContext>, Json(body): Json<ToggleInterceptBody>) -> Json<serde_json::Value> {
	ctx.intercept.toggle_intercept(body.phase, body.enabled).await;
	Json(serde_json::json!({"phase": body.phase, "enabled": body.enabled}))
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum InterceptActionKind {
	Forward,
	Drop,
	ForwardModified,
}

#[derive(Deserialize)]
struct InterceptActionBody {
	request_id: String,
	phase: InterceptPhase,
	action: InterceptActionKind,
	modified_headers: Option<Vec<(String, String)>>,
	modified_body_b64: Option<String>,
	modified_status: Option<u16>,
}

async fn intercept_action(State(ctx): State<ApiContext>, Json(body): Json<InterceptActionBody>) -> Result<Json<serde_json::Value>, ApiError> {
	let flow_id = body.request_id.parse::<u128>().map(FlowId).map_err(|_| ApiError::BadRequest(format!("invalid request_id {}", body.request_id)))?;
	let decision = match body.action {
		InterceptActionKind::Forward => InterceptDecision::Forward,
		InterceptActionKind::Drop => InterceptDecision::Drop,
		InterceptActionKind::ForwardModified => {
			let body_bytes = body.modified_body_b64.as_deref().map(|b| STANDARD.decode(b)).transpose().map_err(|e| ApiError::BadRequest(e.to_string()))?;
			InterceptDecision::ForwardModified(ModifiedBody { headers: body.modified_headers, body: body_bytes, status: body.modified_status })
		}
	};
	ctx.intercept.decide(flow_id, body.phase, decision).await?;
	Ok(Json(serde_json::json!({"status": "resolved"})))
}

#[derive(Deserialize)]
struct ReplayBody {
	flow_id: String,
}

#[derive(Serialize)]
struct ReplayResponse {
	status: Option<u16>,
	headers: Vec<(String, String)>,
	body_b64: String,
}

/// Re-dispatches a previously recorded flow's request to its original destination, unmodified.
/// Does not go through the rule engine or intercept coordinator: replay is an operator action on
/// a single request, not a simulated client connection.
async fn replay(State(ctx): State<ApiContext>, Json(body): Json<ReplayBody>) -> Result<Json<ReplayResponse>, ApiError> {
	let flow_id = body.flow_id.parse::<u128>().map(FlowId).map_err(|_| ApiError::BadRequest(format!("invalid flow_id {}", body.flow_id)))?;
	let flow: Flow = ctx.flow_store.get_flow(flow_id).await?.ok_or_else(|| ApiError::NotFound(format!("flow {flow_id} not found")))?;

	let dest = Destination::new(flow.scheme, flow.host.clone(), flow.port);
	let path_and_query = if flow.query.is_empty() { flow.path.clone() } else { format!("{}?{}", flow.path, flow.query) };
	let mut builder = http::Request::builder().method(flow.method.as_str()).uri(path_and_query);
	for (name, value) in flow.request_headers.0.iter() {
		builder = builder.header(name.as_str(), value.as_str());
	}
	let req = builder.body(Full::new(flow.request_body.data.clone())).map_err(|e| ApiError::BadRequest(e.to_string()))?;

	let client = ctx.client.clone().with_timeout(Duration::from_secs(30));
	let resp = client.dispatch(&dest, req).await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
	let body_bytes = crate::client::collect_body(resp.body).await.unwrap_or_default();
	Ok(Json(ReplayResponse { status: Some(resp.status), headers: resp.headers, body_b64: STANDARD.encode(&body_bytes) }))
}

#[derive(Serialize)]
struct CertificateResponse {
	pem: String,
	instructions: &'static str,
}

async fn certificate(State(ctx): State<ApiContext>) -> Json<CertificateResponse> {
	Json(CertificateResponse {
		pem: ctx.ca.root_cert_pem().to_string(),
		instructions: "Import this certificate into your client's trust store as a trusted root CA to intercept TLS traffic.",
	})
}

#[derive(Serialize)]
struct SystemProxyStatus {
	supported: bool,
	active: bool,
}

async fn system_status() -> Json<SystemProxyStatus> {
	Json(SystemProxyStatus { supported: false, active: false })
}

async fn system_enable() -> Result<Json<serde_json::Value>, ApiError> {
	Err(ApiError::BadRequest("OS system-proxy registration is not supported by this build".into()))
}

async fn system_disable() -> Result<Json<serde_json::Value>, ApiError> {
	Err(ApiError::BadRequest("OS system-proxy registration is not supported by this build".into()))
}
