//! Prometheus metrics for the ingress gateway.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UnauthorizedReason {
    Rejected,
    Timeout,
    ValidatorError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UnauthorizedLabels {
    pub reason: UnauthorizedReason,
}

pub struct Metrics {
    registry: Registry,

    pub ingest_accepted: Counter,
    pub ingest_bad_request: Counter,
    pub ingest_unauthorized: Family<UnauthorizedLabels, Counter>,
    /// Encoding failures are server faults, never client errors.
    pub ingest_encode_failures: Counter,
    pub ingest_publish_failures: Counter,
    pub ingest_publish_latency_seconds: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let ingest_accepted = Counter::default();
        registry.register(
            "ingest_accepted",
            "Requests appended to the log and acknowledged",
            ingest_accepted.clone(),
        );

        let ingest_bad_request = Counter::default();
        registry.register(
            "ingest_bad_request",
            "Requests rejected for a malformed body",
            ingest_bad_request.clone(),
        );

        let ingest_unauthorized = Family::<UnauthorizedLabels, Counter>::default();
        registry.register(
            "ingest_unauthorized",
            "Requests rejected by the authorization check",
            ingest_unauthorized.clone(),
        );

        let ingest_encode_failures = Counter::default();
        registry.register(
            "ingest_encode_failures",
            "Events that could not be encoded into a wire record",
            ingest_encode_failures.clone(),
        );

        let ingest_publish_failures = Counter::default();
        registry.register(
            "ingest_publish_failures",
            "Appends refused by the partitioned log",
            ingest_publish_failures.clone(),
        );

        // 0.1ms to ~1.6s
        let ingest_publish_latency_seconds = Histogram::new(exponential_buckets(0.0001, 2.0, 15));
        registry.register(
            "ingest_publish_latency_seconds",
            "Time spent appending one record to the log",
            ingest_publish_latency_seconds.clone(),
        );

        Self {
            registry,
            ingest_accepted,
            ingest_bad_request,
            ingest_unauthorized,
            ingest_encode_failures,
            ingest_publish_failures,
            ingest_publish_latency_seconds,
        }
    }

    pub fn observe_unauthorized(&self, reason: UnauthorizedReason) {
        self.ingest_unauthorized
            .get_or_create(&UnauthorizedLabels { reason })
            .inc();
    }

    pub fn unauthorized_count(&self, reason: UnauthorizedReason) -> u64 {
        self.ingest_unauthorized
            .get_or_create(&UnauthorizedLabels { reason })
            .get()
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_gateway_metric() {
        let metrics = Metrics::new();
        let encoded = metrics.encode().unwrap();
        for name in [
            "# HELP ingest_accepted",
            "# HELP ingest_bad_request",
            "# HELP ingest_unauthorized",
            "# HELP ingest_encode_failures",
            "# HELP ingest_publish_failures",
            "# HELP ingest_publish_latency_seconds",
        ] {
            assert!(encoded.contains(name), "missing {name}");
        }
    }

    #[test]
    fn unauthorized_is_labelled_by_reason() {
        let metrics = Metrics::new();
        metrics.observe_unauthorized(UnauthorizedReason::Timeout);
        metrics.observe_unauthorized(UnauthorizedReason::Timeout);
        metrics.observe_unauthorized(UnauthorizedReason::Rejected);

        assert_eq!(metrics.unauthorized_count(UnauthorizedReason::Timeout), 2);
        assert_eq!(metrics.unauthorized_count(UnauthorizedReason::Rejected), 1);
        assert_eq!(metrics.unauthorized_count(UnauthorizedReason::ValidatorError), 0);
        assert!(metrics.encode().unwrap().contains("reason=\"Timeout\""));
    }
}
