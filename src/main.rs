use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wallet_aggregator::aggregation::Orchestrator;
use wallet_aggregator::aggregation::handlers::router;
use wallet_aggregator::config::Cli;
use wallet_aggregator::providers::http::HttpProvider;
use wallet_aggregator::providers::{ProviderRegistry, StandardMapper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    tracing::info!("Starting aggregation node on {}", cli.bind);
    tracing::debug!("Configuration: {:?}", config);

    // 1. Provider adapters:
    let providers = ProviderRegistry::new();
    for endpoint in &cli.providers {
        HttpProvider::new(&endpoint.url, config.provider_timeout).register(&providers, &endpoint.name);
        tracing::info!("Registered provider '{}' at {}", endpoint.name, endpoint.url);
    }
    if providers.provider_count() == 0 {
        tracing::warn!("No providers registered, every job will finish empty");
    }

    // 2. Pipeline:
    let orchestrator = Orchestrator::new(config, providers, Arc::new(StandardMapper));
    let _workers = orchestrator.start();

    // 3. HTTP Router:
    let app = router(&orchestrator);

    // 4. Spawn stats reporter:
    let stats_queue = orchestrator.queue.clone();
    let stats_store = orchestrator.store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));

        loop {
            interval.tick().await;
            let stats = stats_queue.stats();
            tracing::info!(
                "Queue stats: {} pending, {} in flight, {} acked, {} dead-lettered; {} live jobs",
                stats.pending,
                stats.in_flight,
                stats.acked,
                stats.dead_lettered,
                stats_store.job_count()
            );
        }
    });

    // 5. Start HTTP server:
    tracing::info!("HTTP server listening on {}", cli.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
