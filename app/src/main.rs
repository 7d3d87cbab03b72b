//! Binary entrypoint: reads configuration from the environment, wires every engine and store
//! together, and runs the API listener, the metrics listener, and the proxy listener concurrently
//! until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;

use proxy_core::readiness::Ready;
use proxy_engine::api::{self, ApiContext};
use proxy_engine::ca::CaStore;
use proxy_engine::client::UpstreamClient;
use proxy_engine::config::ProxyConfig;
use proxy_engine::engine::{EngineConfig, ProxyEngine};
use proxy_engine::eventbus::EventBus;
use proxy_engine::intercept::SharedInterceptCoordinator;
use proxy_engine::intruder::IntruderEngine;
use proxy_engine::metrics;
use proxy_engine::scanner::ScannerEngine;
use proxy_engine::sitemap::SiteMapBuilder;
use proxy_engine::spider::SpiderEngine;
use proxy_engine::store::InMemoryStore;

#[derive(Parser, Debug)]
#[command(name = "proxy-app", about = "Intercepting HTTP/HTTPS proxy")]
struct Args {
    /// Start the proxy listener immediately instead of waiting for `/api/proxy/start`.
    #[arg(long)]
    autostart: bool,
}

fn main() -> anyhow::Result<()> {
    proxy_core::telemetry::init();
    let args = Args::parse();
    let config = ProxyConfig::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(config.worker_threads).enable_all().build()?;
    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: ProxyConfig) -> anyhow::Result<()> {
    let ready = Ready::new();
    let store = InMemoryStore::shared();
    let flow_store = store.clone() as Arc<dyn proxy_engine::store::FlowStore>;
    let rule_store = store.clone() as Arc<dyn proxy_engine::store::RuleStore>;
    let attack_store = store.clone() as Arc<dyn proxy_engine::store::AttackStore>;
    let spider_store = store.clone() as Arc<dyn proxy_engine::store::SpiderStore>;
    let scan_store = store.clone() as Arc<dyn proxy_engine::store::ScanStore>;
    let sitemap_store = store.clone() as Arc<dyn proxy_engine::store::SiteMapStore>;
    let collection_store = store.clone() as Arc<dyn proxy_engine::store::CollectionStore>;

    let ca_ready = ready.register_task("ca");
    let ca = Arc::new(CaStore::load_or_generate(&config.ca_dir, config.leaf_cert_ttl_days)?);
    drop(ca_ready);

    let bus = Arc::new(EventBus::new());
    let intercept = SharedInterceptCoordinator::default();
    let client = UpstreamClient::new().with_timeout(Duration::from_secs(30));

    let engine_config = EngineConfig { body_cap: config.body_size_cap_bytes as usize, upstream_timeout: Duration::from_secs(30) };
    let engine = ProxyEngine::new(engine_config, ca.clone(), bus.clone(), intercept.clone(), client.clone(), flow_store.clone());
    engine.set_rules(rule_store.list_rules().await?).await;

    let intruder = IntruderEngine::new(client.clone(), attack_store.clone(), bus.clone());
    let spider = SpiderEngine::new(client.clone(), spider_store.clone(), bus.clone());
    let scanner = ScannerEngine::new(client.clone(), scan_store.clone(), bus.clone(), config.max_concurrent_scan_checks);
    let sitemap = SiteMapBuilder::new(flow_store.clone(), sitemap_store.clone());

    if args.autostart {
        engine.start(&config.proxy_host.to_string(), config.proxy_port).await?;
    }

    let metrics_app = metrics::App::new(Registry::default(), engine.clone(), scan_store.clone(), attack_store.clone(), spider_store.clone());

    let ctx = ApiContext {
        engine: engine.clone(),
        ca,
        bus,
        intercept,
        client,
        flow_store,
        rule_store,
        attack_store,
        spider_store,
        scan_store,
        collection_store,
        intruder,
        spider,
        scanner,
        sitemap,
        ready,
    };

    let api_router = api::build_router(ctx, &config.cors_origins);

    let api_addr = SocketAddr::new(config.api_host, config.api_port);
    let metrics_addr = SocketAddr::new(config.api_host, config.metrics_port);

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;

    tracing::info!(%api_addr, %metrics_addr, "listening");

    let mut servers = JoinSet::new();
    servers.spawn(async move { axum::serve(api_listener, api_router).await });
    servers.spawn(async move { axum::serve(metrics_listener, metrics_app.router()).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        Some(result) = servers.join_next() => {
            if let Ok(Err(e)) = result {
                tracing::error!(error = %e, "server task exited with error");
            }
        }
    }

    engine.stop().await;
    servers.shutdown().await;
    Ok(())
}
