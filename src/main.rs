//! Cloudlet DNS daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use cloudlet_dns::{
    cache, run_dns_server, CacheAsideResolver, Config, HickoryUpstream, HttpTelemetry,
    LoadBalancer, Registry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting cloudlet-dns with config: {:?}", cfg);

    // Cache store; an unreachable store is fatal
    let store = cache::open(&cfg.cache_store).await?;
    let upstream = Arc::new(HickoryUpstream::new(cfg.upstream_addr()?, cfg.upstream_timeout()));
    let resolver = Arc::new(CacheAsideResolver::new(store, upstream, cfg.cache_ttl_secs));

    // Registry and startup seeding
    let telemetry = Arc::new(HttpTelemetry::new(&cfg.telemetry())?);
    let registry = Registry::new(telemetry);
    if let Some(ref path) = cfg.services_file {
        registry.seed_services_file(path).await?;
    }
    for seed in &cfg.cloudlets {
        if let Err(e) = registry.seed_cloudlet(seed) {
            warn!("Skipping cloudlet {}: {}", seed.name, e);
        }
    }
    info!(
        "There are {} services and {} cloudlets available",
        registry.services_count(),
        registry.cloudlets_count()
    );

    // DNS Server
    let shutdown = shutdown_on_ctrl_c();
    let handler = LoadBalancer::new(registry.clone(), resolver.clone(), cfg.max_cloudlet_workload);
    let dns_result = tokio::spawn(run_dns_server(cfg.dns_bind, handler, shutdown)).await;

    registry.shutdown().await;
    resolver.close().await;

    match dns_result {
        Ok(Ok(())) => {
            info!("Terminating application.");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("DNS server failed: {}", e);
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("DNS server task panicked: {}", e)),
    }
}

/// Token cancelled on the first Ctrl+C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        }
        trigger.cancel();
    });
    token
}
