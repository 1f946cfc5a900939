//! `logpipe` binary entrypoint.
//!
//! Loads configuration from `LOGPIPE_*` environment variables, serves the
//! ingest gateway and the processor metrics endpoint, and runs the
//! dual-write consumer until SIGINT or SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use auth::StaticApiKeyValidator;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use eventlog::PartitionedLog;
use ingestion::IngestionRuntime;
use pipeline::{PipelineConfig, init_logging};
use processor::{DualWriteConsumer, DualWriteProcessor, FailurePolicy, Metrics, ProcessorSinks};
use store::{DeadLetterSink, InMemoryColumnarStore, InMemoryWideColumnStore, LogDeadLetterSink};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = PipelineConfig::from_env()?;
    init_logging(config.log_format);

    let log = Arc::new(PartitionedLog::new(config.log.clone())?);
    let validator = StaticApiKeyValidator::from_specs(
        config.api_keys.as_deref(),
        config.revoked_api_keys.as_deref(),
    );
    if validator.projects_len() == 0 {
        tracing::warn!("LOGPIPE_API_KEYS is empty; every ingest request will be rejected");
    }
    let gateway = Arc::new(IngestionRuntime::new(
        Arc::new(validator),
        log.clone(),
        config.ingestion.clone(),
    ));

    let wide_column = Arc::new(InMemoryWideColumnStore::new());
    let columnar = Arc::new(InMemoryColumnarStore::new());
    let dead_letters: Option<Arc<dyn DeadLetterSink>> =
        if config.processor.failure_policy == FailurePolicy::DeadLetter {
            let dead_letter_log = Arc::new(PartitionedLog::new(config.dead_letter_log())?);
            Some(Arc::new(LogDeadLetterSink::new(dead_letter_log)))
        } else {
            None
        };
    let processor = DualWriteProcessor::new(
        ProcessorSinks {
            wide_column: wide_column.clone(),
            columnar,
            dead_letters,
        },
        config.processor.clone(),
        Arc::new(Metrics::new()),
    )?;
    let consumer = Arc::new(DualWriteConsumer::new(Arc::new(processor)));

    // Gateway stops first; the consumer drains what it accepted before
    // `shutdown` fires.
    let gateway_shutdown = CancellationToken::new();
    let shutdown = CancellationToken::new();

    let gateway_listener = TcpListener::bind(&config.ingestion.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.ingestion.bind_addr))?;
    let gateway_task = tokio::spawn(ingestion::serve(
        gateway,
        gateway_listener,
        gateway_shutdown.clone(),
    ));

    let metrics_listener = TcpListener::bind(&config.processor.metrics_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.processor.metrics_bind))?;
    let metrics_task = tokio::spawn(serve_processor_metrics(
        consumer.processor().metrics().clone(),
        metrics_listener,
        shutdown.clone(),
    ));

    let sweep_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = wide_column.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "expired wide-column rows removed");
                        }
                    }
                }
            }
        }
    });

    let group = log.consumer_group(&config.processor.group_id);
    let consumer_task = tokio::spawn({
        let consumer = consumer.clone();
        let group = group.clone();
        let member_id = config.processor.member_id.clone();
        let shutdown = shutdown.clone();
        async move { consumer.run(group, &member_id, shutdown).await }
    });

    tracing::info!(
        topic = %config.log.topic,
        partitions = config.log.partitions,
        group = %config.processor.group_id,
        failure_policy = %config.processor.failure_policy,
        project_id_policy = config.processor.project_id_policy.as_str(),
        "log pipeline started"
    );

    shutdown_signal().await?;
    gateway_shutdown.cancel();
    gateway_task.await?.context("gateway server failed")?;

    consumer.drain(&group, config.processor.drain_timeout).await;
    shutdown.cancel();
    consumer_task.await?.context("consumer failed")?;
    metrics_task.await?.context("metrics server failed")?;
    sweep_task.await?;
    log.close();
    tracing::info!("log pipeline stopped");
    Ok(())
}

async fn serve_processor_metrics(
    metrics: Arc<Metrics>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(processor_metrics))
        .with_state(metrics);
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "processor metrics listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn processor_metrics(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            [(
                CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode processor metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Waits for SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("failed to listen for SIGINT")?;
                tracing::info!("received SIGINT, shutting down");
            }
            _ = terminate.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to listen for SIGINT")?;
        tracing::info!("received SIGINT, shutting down");
    }
    Ok(())
}
