//! VM power scheduler
//!
//! Deallocates tagged VMs of a resource group in the evening and starts them
//! again in the morning, each job driven by its own cron timer.

use anyhow::{Context, Result};
use scheduler_lib::{
    compute::{ArmClientConfig, AzureProviderFactory, ProviderFactory},
    health::{components, HealthRegistry},
    jobs::PowerJob,
    observability::StructuredLogger,
    timer::{TimerLoopBuilder, TimerSchedule, TimerTrigger},
    JobKind, RunOutcome,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const SCHEDULER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting vm-power-scheduler");

    let config = config::SchedulerConfig::load()?;
    info!(instance = %config.instance_name, "Scheduler configured");

    let logger = StructuredLogger::new(&config.instance_name);
    let factory: Arc<dyn ProviderFactory> =
        Arc::new(AzureProviderFactory::from_env(ArmClientConfig::default())?);

    if let Some(kind) = config.run_once_job()? {
        return run_once(kind, factory, logger).await;
    }

    let health_registry = HealthRegistry::new();
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut schedules = Vec::new();
    let mut timers = Vec::new();

    for kind in [JobKind::Deallocate, JobKind::Start] {
        let expression = config.schedule_for(kind);
        let schedule = TimerSchedule::parse(expression)
            .with_context(|| format!("Invalid schedule for the {} job", kind))?;

        health_registry.register(components::for_job(kind)).await;

        let job = Arc::new(PowerJob::new(kind, factory.clone(), logger.clone()));
        let timer = TimerLoopBuilder::new()
            .job(job)
            .schedule(schedule)
            .health(health_registry.clone())
            .past_due_threshold(config.past_due_threshold())
            .build()?;

        schedules.push((kind, expression.to_string()));
        timers.push(tokio::spawn(timer.run(shutdown_tx.subscribe())));
    }

    logger.log_startup(SCHEDULER_VERSION, &schedules);

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    // A timer in the middle of a run finishes that run first
    for timer in timers {
        let _ = timer.await;
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Run a single job immediately; systemic failures exit non-zero
async fn run_once(
    kind: JobKind,
    factory: Arc<dyn ProviderFactory>,
    logger: StructuredLogger,
) -> Result<()> {
    let job = PowerJob::new(kind, factory, logger);

    match job.invoke(&TimerTrigger::immediate()).await? {
        RunOutcome::Completed(summary) => info!(
            job = %kind,
            transitioned = summary.transitioned,
            skipped = summary.skipped,
            errored = summary.errored,
            "Single run complete"
        ),
        RunOutcome::Aborted { missing } => info!(
            job = %kind,
            missing = ?missing,
            "Single run aborted"
        ),
    }

    Ok(())
}
