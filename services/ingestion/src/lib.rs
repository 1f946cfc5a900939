//! HTTP ingress for application log events.
//!
//! `POST /v1/logs` authorizes the caller, encodes the event into a wire
//! record and appends it to the partitioned log keyed by `project_id`. A 202
//! means the record is queued, not that any store has persisted it.

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod transport;
pub mod transport_axum;

pub use config::{ConfigError, IngestionConfig};
pub use error::IngestError;
pub use transport::{IngestionRuntime, SharedRuntime};
pub use transport_axum::{router, serve};
