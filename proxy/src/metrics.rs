//! Prometheus exposition for the proxy's live state. Mirrors the top-level gateway's
//! `App { registry }` + `/metrics` router shape, but since every counted quantity here already
//! lives in a store, gauges are refreshed from the stores at scrape time rather than incremented
//! at every call site.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::engine::ProxyEngine;
use crate::store::{AttackStore, ScanStore, SpiderStore};
use crate::types::{AttackStatus, SessionStatus};

#[derive(Default)]
struct Gauges {
	flows_total: Gauge,
	scan_issues_total: Gauge,
	intruder_attacks_running: Gauge,
	spider_sessions_running: Gauge,
}

#[derive(Clone)]
pub struct App {
	registry: Arc<Registry>,
	gauges: Arc<Gauges>,
	engine: ProxyEngine,
	scan_store: Arc<dyn ScanStore>,
	attack_store: Arc<dyn AttackStore>,
	spider_store: Arc<dyn SpiderStore>,
}

impl App {
	pub fn new(mut registry: Registry, engine: ProxyEngine, scan_store: Arc<dyn ScanStore>, attack_store: Arc<dyn AttackStore>, spider_store: Arc<dyn SpiderStore>) -> Self {
		let gauges = Gauges::default();
		registry.register("proxy_flows", "Total flows currently recorded", gauges.flows_total.clone());
		registry.register("proxy_scan_issues", "Total scan issues currently persisted", gauges.scan_issues_total.clone());
		registry.register("proxy_intruder_attacks_running", "Intruder attacks currently running", gauges.intruder_attacks_running.clone());
		registry.register("proxy_spider_sessions_running", "Spider sessions currently running", gauges.spider_sessions_running.clone());
		App { registry: Arc::new(registry), gauges: Arc::new(gauges), engine, scan_store, attack_store, spider_store }
	}

	pub fn router(&self) -> Router {
		Router::new().route("/metrics", get(metrics_handler)).with_state(self.clone())
	}

	async fn refresh(&self) {
		self.gauges.flows_total.set(self.engine.status().await.flows_total as i64);
		if let Ok(issues) = self.scan_store.list_issues().await {
			self.gauges.scan_issues_total.set(issues.len() as i64);
		}
		if let Ok(attacks) = self.attack_store.list_attacks().await {
			self.gauges.intruder_attacks_running.set(attacks.iter().filter(|a| a.status == AttackStatus::Running).count() as i64);
		}
		if let Ok(sessions) = self.spider_store.list_sessions().await {
			self.gauges.spider_sessions_running.set(sessions.iter().filter(|s| s.status == SessionStatus::Running).count() as i64);
		}
	}
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
	app.refresh().await;
	let mut buffer = String::new();
	encode(&mut buffer, &app.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
	Ok(buffer)
}
