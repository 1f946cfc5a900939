//! Single-process wiring of the gateway, the partitioned log and the
//! dual-write consumer.

pub mod config;
pub mod observability;

pub use config::{ConfigError, PipelineConfig};
pub use observability::{LogFormat, init_logging};
