use eventlog::LogConfig;
use ingestion::IngestionConfig;
use processor::ProcessorConfig;
use settings::{InvalidValue, parse, text};

use crate::observability::LogFormat;

pub const ENV_TOPIC: &str = "LOGPIPE_TOPIC";
pub const ENV_PARTITIONS: &str = "LOGPIPE_PARTITIONS";
pub const ENV_MAX_RECORDS_PER_PARTITION: &str = "LOGPIPE_MAX_RECORDS_PER_PARTITION";
pub const ENV_DEAD_LETTER_TOPIC: &str = "LOGPIPE_DEAD_LETTER_TOPIC";
pub const ENV_API_KEYS: &str = "LOGPIPE_API_KEYS";
pub const ENV_REVOKED_API_KEYS: &str = "LOGPIPE_REVOKED_API_KEYS";
pub const ENV_LOG_FORMAT: &str = "LOGPIPE_LOG_FORMAT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Invalid(#[from] InvalidValue),
    #[error(transparent)]
    Ingestion(#[from] ingestion::ConfigError),
    #[error(transparent)]
    Processor(#[from] processor::ConfigError),
}

/// Everything the single-process pipeline needs, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub log: LogConfig,
    pub dead_letter_topic: String,
    pub ingestion: IngestionConfig,
    pub processor: ProcessorConfig,
    /// Comma separated `project:key` pairs.
    pub api_keys: Option<String>,
    pub revoked_api_keys: Option<String>,
    pub log_format: LogFormat,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = LogConfig::default();

        let partitions = match parse::<u32>(&lookup, ENV_PARTITIONS)? {
            Some(0) => {
                return Err(InvalidValue {
                    key: ENV_PARTITIONS,
                    value: "0".to_string(),
                }
                .into());
            }
            Some(partitions) => partitions,
            None => defaults.partitions,
        };
        let max_records_per_partition =
            parse::<usize>(&lookup, ENV_MAX_RECORDS_PER_PARTITION)?.filter(|limit| *limit > 0);
        let topic = text(&lookup, ENV_TOPIC).unwrap_or(defaults.topic);
        let dead_letter_topic = text(&lookup, ENV_DEAD_LETTER_TOPIC)
            .unwrap_or_else(|| format!("{topic}.dead-letter"));

        let processor = ProcessorConfig::from_lookup(&lookup)?;
        let ingestion = IngestionConfig {
            project_id_policy: processor.project_id_policy,
            ..IngestionConfig::from_lookup(&lookup)?
        };

        Ok(Self {
            log: LogConfig {
                topic,
                partitions,
                max_records_per_partition,
            },
            dead_letter_topic,
            ingestion,
            processor,
            api_keys: text(&lookup, ENV_API_KEYS),
            revoked_api_keys: text(&lookup, ENV_REVOKED_API_KEYS),
            log_format: parse::<LogFormat>(&lookup, ENV_LOG_FORMAT)?.unwrap_or_default(),
        })
    }

    /// Dead-letter log shares the main log's shape under its own topic.
    pub fn dead_letter_log(&self) -> LogConfig {
        LogConfig {
            topic: self.dead_letter_topic.clone(),
            ..self.log.clone()
        }
    }
}
