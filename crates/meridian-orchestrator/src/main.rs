//! Meridian orchestrator service binary.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meridian_orchestrator::workers::{NotifyWorker, ProcessBuildExecutor};
use meridian_orchestrator::{
    ChannelAgentGateway, OrchestratorConfig, OrchestratorContext, StaticMetrics, Stores,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("meridian_orchestrator=info".parse()?),
        )
        .init();

    info!("meridian orchestrator starting");

    let config = OrchestratorConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        OrchestratorConfig::default()
    });

    let gateway = Arc::new(ChannelAgentGateway::new());
    let metrics: Arc<dyn meridian_orchestrator::MetricsSource> = Arc::new(StaticMetrics::new());
    let context = OrchestratorContext::new(
        config,
        Stores::in_memory(),
        Arc::clone(&gateway) as Arc<dyn meridian_orchestrator::AgentGateway>,
        metrics,
    );

    let channels = NotifyWorker::default_channels(&context.config.notifications);
    let cancel = CancellationToken::new();
    let tasks = context.start(Arc::new(ProcessBuildExecutor), channels, &cancel);

    info!(
        build_workers = context.config.queues.build.concurrency,
        deploy_workers = context.config.queues.deploy.concurrency,
        notify_workers = context.config.queues.notify.concurrency,
        "orchestrator running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }

    info!("meridian orchestrator stopped");
    Ok(())
}
