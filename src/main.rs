use anyhow::{Context, Result};
use clap::Parser;
use netlog::capture::LiveSource;
use netlog::cli::Cli;
use netlog::config::Config;
use netlog::engine::AggregationEngine;
use netlog::interfaces::IpLinkDiscovery;
use netlog::metrics::{EngineCollector, PrometheusExporter};
use netlog::pipeline::TrafficPipeline;
use netlog::sink::{EventSink, QueuedSink, RotatingFileSink, DEFAULT_QUEUE_CAPACITY};
use netlog::supervisor::InterfaceSupervisor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting netlog v{}", netlog::VERSION);

    if let Err(e) = run(cli).await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::try_from(cli).context("invalid configuration")?;

    info!(
        "Blocking {} source and {} destination addresses",
        config.source_blocklist.len(),
        config.destination_blocklist.len()
    );

    let log_file: Arc<dyn EventSink> = Arc::new(
        RotatingFileSink::open(&config.log_file, config.log_max_bytes, config.log_backups)
            .with_context(|| format!("failed to open event log {}", config.log_file.display()))?,
    );
    let sink = Arc::new(
        QueuedSink::spawn(log_file, DEFAULT_QUEUE_CAPACITY)
            .context("failed to start event log writer")?,
    );

    let engine = if config.max_tracked_addresses > 0 {
        AggregationEngine::with_address_limit(config.max_tracked_addresses)
    } else {
        AggregationEngine::new()
    };

    let shutdown = CancellationToken::new();
    let pipeline = TrafficPipeline::new(config.filter(), engine.clone(), sink.clone());

    let supervisor = InterfaceSupervisor::new(
        Arc::new(IpLinkDiscovery::new(config.interface_prefixes.clone())),
        Arc::new(LiveSource::new(config.promiscuous)),
        pipeline,
        config.supervisor(),
        shutdown.clone(),
    );

    let collector = EngineCollector::new(engine)
        .context("failed to build metrics collector")?
        .with_task_status(supervisor.subscribe());
    let exporter = PrometheusExporter::new(collector).context("failed to register metrics")?;
    let listener = PrometheusExporter::bind(&config.metrics_address, config.metrics_port)
        .await
        .context("failed to start metrics server")?;

    let server = tokio::spawn(exporter.serve(listener, shutdown.clone()));
    let supervisor = tokio::spawn(supervisor.run());

    wait_for_signal().await;
    info!("Shutting down");
    shutdown.cancel();

    if let Err(e) = supervisor.await {
        warn!("Supervisor ended abnormally: {}", e);
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Metrics server error: {}", e),
        Err(e) => warn!("Metrics server ended abnormally: {}", e),
    }

    let flushed = tokio::task::spawn_blocking(move || {
        sink.flush()?;
        Ok::<_, netlog::NetlogError>(sink.dropped())
    })
    .await
    .context("event log writer panicked")?;
    let dropped = flushed.context("failed to flush event log")?;
    if dropped > 0 {
        warn!("{} traffic events were dropped because the event log fell behind", dropped);
    }

    info!("netlog stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
    }
}
