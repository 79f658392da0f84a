// Jobs service binary entry point

use anyhow::{Context, Result};
use common::bootstrap;
use common::clock::{Clock, SystemClock};
use common::config::Settings;
use common::lease::InstanceLeaseManager;
use common::queue::{CommandConsumer, CommandHandler, NatsCommandConsumer};
use common::retry::build_policy;
use common::scheduler::{
    JobDispatcher, MessagingMode, ReconcilerConfig, SchedulerReconciler, TimerJobScheduler,
    TimerJobSchedulerConfig, TokioTimerBackend,
};
use common::telemetry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        storage = ?settings.storage.backend,
        nats_url = %settings.nats.url,
        chunk_window_minutes = settings.jobs.chunk_window_minutes,
        "Starting jobs service"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let repositories = bootstrap::build_repositories(&settings).await?;

    // The service keeps firing jobs without the command feed; reconciliation
    // falls back to polling until it comes back.
    let nats = match bootstrap::init_nats_client(&settings).await {
        Ok(client) => Some(client),
        Err(e) => {
            error!(error = %e, "NATS unavailable, running without the command feed");
            None
        }
    };

    let lease = Arc::new(InstanceLeaseManager::new(
        repositories.management.clone(),
        clock.clone(),
        settings.lease.clone(),
    ));
    info!(token = %lease.token(), slot = %settings.lease.slot, "Lease manager created");

    // Only the lease owner arms timers and consumes commands; other replicas
    // stand by until the lease moves to them.
    let (backend, fired_rx) = TokioTimerBackend::new();
    let scheduler = Arc::new(
        TimerJobScheduler::new(
            TimerJobSchedulerConfig::from(&settings.jobs),
            repositories.jobs.clone(),
            Arc::new(backend),
            clock.clone(),
            build_policy(&settings.jobs.retry),
        )
        .with_ownership(lease.subscribe()),
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let executor = bootstrap::build_executor(&settings, nats.as_ref())?;
    let dispatcher = Arc::new(JobDispatcher::new(
        scheduler.clone(),
        executor,
        clock.clone(),
    ));
    let dispatcher_task = tokio::spawn(dispatcher.run(fired_rx, shutdown_tx.subscribe()));

    let lease_task = tokio::spawn(lease.clone().run(shutdown_tx.subscribe()));

    let reconciler = Arc::new(SchedulerReconciler::new(
        scheduler.clone(),
        repositories.jobs.clone(),
        clock.clone(),
        ReconcilerConfig::from(&settings.jobs),
        lease.subscribe(),
    ));
    reconciler.start();

    let consumer = match &nats {
        Some(client) => {
            let mut status = client.connection_status();
            reconciler.on_messaging_status_change(*status.borrow_and_update());

            let watcher = reconciler.clone();
            tokio::spawn(async move {
                while status.changed().await.is_ok() {
                    let connected = *status.borrow_and_update();
                    watcher.on_messaging_status_change(connected);
                }
            });

            let handler = CommandHandler::new(scheduler.clone(), settings.jobs.default_retries)
                .with_ownership(lease.subscribe());
            let consumer = Arc::new(NatsCommandConsumer::new(client, handler).await?);
            let running = consumer.clone();
            tokio::spawn(async move {
                if let Err(e) = running.start().await {
                    error!(error = %e, "Command consumer failed");
                }
            });
            Some(consumer)
        }
        None => {
            reconciler.set_mode(MessagingMode::Degraded);
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    if let Some(consumer) = &consumer {
        consumer.shutdown();
    }
    reconciler.stop();
    // Both tasks listen on the channel; a send error only means they are gone
    let _ = shutdown_tx.send(());

    if let Err(e) = lease_task.await {
        warn!(error = %e, "Lease task ended abnormally");
    }
    if let Err(e) = dispatcher_task.await {
        warn!(error = %e, "Dispatcher task ended abnormally");
    }

    if let Some(pool) = &repositories.pool {
        pool.close().await;
    }
    telemetry::shutdown_tracer();

    info!("Jobs service stopped");
    Ok(())
}
