use std::{sync::Arc, time::Instant};

use auth::ApiKeyValidator;
use eventlog::LogProducer;
use schema::{
    IngestRequest, LogEvent, PartitionPosition, encode_event, validate_project_id, validate_request,
};

use crate::{
    config::IngestionConfig,
    error::IngestError,
    metrics::{Metrics, UnauthorizedReason},
};

pub type SharedRuntime = Arc<IngestionRuntime>;

/// Validates, encodes and publishes ingest requests. Holds no per-request
/// state; every accepted request becomes exactly one log append.
pub struct IngestionRuntime {
    validator: Arc<dyn ApiKeyValidator>,
    producer: Arc<dyn LogProducer>,
    metrics: Metrics,
    config: IngestionConfig,
}

impl IngestionRuntime {
    pub fn new(
        validator: Arc<dyn ApiKeyValidator>,
        producer: Arc<dyn LogProducer>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            validator,
            producer,
            metrics: Metrics::new(),
            config,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn metrics_text(&self) -> Result<String, IngestError> {
        self.metrics.encode().map_err(|err| {
            tracing::error!(error = %err, "failed to encode gateway metrics");
            IngestError::Internal
        })
    }

    /// Parses a raw JSON body. Anything the caller could fix is a 400.
    pub fn parse_body(&self, body: &[u8]) -> Result<IngestRequest, IngestError> {
        let result = parse_ingest_body(body, self.config.max_body_bytes);
        if result.is_err() {
            self.metrics.ingest_bad_request.inc();
        }
        result
    }

    /// Authorize, encode and append. Returns where the record landed.
    pub async fn ingest(&self, request: IngestRequest) -> Result<PartitionPosition, IngestError> {
        self.authorize(&request.project_id, &request.api_key).await?;

        let event = LogEvent::from_request(request)
            .and_then(|event| {
                validate_project_id(&event.project_id, self.config.project_id_policy)?;
                Ok(event)
            })
            .map_err(|err| {
                self.metrics.ingest_bad_request.inc();
                IngestError::BadRequest(err.to_string())
            })?;

        let payload = encode_event(&event).map_err(|err| {
            self.metrics.ingest_encode_failures.inc();
            tracing::error!(error = %err, "failed to encode wire record");
            IngestError::Internal
        })?;

        let started = Instant::now();
        let position = self
            .producer
            .append(&event.project_id, payload)
            .await
            .map_err(|err| {
                self.metrics.ingest_publish_failures.inc();
                tracing::error!(error = %err, "failed to publish to log");
                IngestError::Internal
            })?;
        self.metrics
            .ingest_publish_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        self.metrics.ingest_accepted.inc();
        tracing::debug!(%position, event_name = %event.name, "record accepted");
        Ok(position)
    }

    async fn authorize(&self, project_id: &str, api_key: &str) -> Result<(), IngestError> {
        let check = self.validator.validate(project_id, api_key);
        let reason = match tokio::time::timeout(self.config.auth_timeout, check).await {
            Ok(Ok(true)) => return Ok(()),
            Ok(Ok(false)) => UnauthorizedReason::Rejected,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "authorization check failed");
                UnauthorizedReason::ValidatorError
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.auth_timeout.as_millis() as u64,
                    "authorization check timed out"
                );
                UnauthorizedReason::Timeout
            }
        };
        self.metrics.observe_unauthorized(reason);
        Err(IngestError::Unauthorized)
    }
}

pub fn parse_ingest_body(body: &[u8], max_body_bytes: usize) -> Result<IngestRequest, IngestError> {
    if body.len() > max_body_bytes {
        return Err(IngestError::BadRequest(format!(
            "request body exceeds max body size of {max_body_bytes} bytes"
        )));
    }
    let request: IngestRequest = serde_json::from_slice(body)
        .map_err(|err| IngestError::BadRequest(format!("invalid JSON body: {err}")))?;
    validate_request(&request).map_err(|err| IngestError::BadRequest(err.to_string()))?;
    Ok(request)
}
