use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use thiserror::Error;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // comma separated bootstrap servers

    #[envconfig(default = "batching-consumer")]
    pub kafka_consumer_group: String,

    pub kafka_consumer_topics: String, // comma separated, at least one

    // Topics the deployment knows about. Consumed topics must be a subset.
    pub registered_topics: String,

    pub dead_letter_topic: String,

    #[envconfig(default = "error")]
    pub kafka_consumer_offset_reset: String, // error, earliest, latest

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before the producer stops retrying a dead-letter write

    // Batching configuration
    #[envconfig(default = "10000")]
    pub max_batch_size: usize,

    #[envconfig(default = "60000")]
    pub max_batch_time_ms: u64,

    #[envconfig(default = "1000")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    // Worker configuration
    #[envconfig(default = "1")]
    pub concurrency: usize, // 1 processes messages inline in the consumer task

    #[envconfig(default = "10")]
    pub max_worker_restarts: u32,

    pub processing_timeout_ms: Option<u64>,

    // Retry budgets
    #[envconfig(default = "10")]
    pub poll_max_retries: u32,

    #[envconfig(default = "5")]
    pub commit_max_retries: u32,

    #[envconfig(default = "5")]
    pub dead_letter_max_retries: u32,

    #[envconfig(default = "100")]
    pub dead_letter_retry_backoff_ms: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("at least one topic to consume is required")]
    NoTopics,

    #[error("topic '{topic}' is not one of: {known:?}")]
    UnknownTopic {
        topic: String,
        known: BTreeSet<String>,
    },

    #[error("a dead letter topic is required")]
    MissingDeadLetterTopic,

    #[error("at least one bootstrap server is required")]
    NoBootstrapServers,

    #[error("{name} must be {requirement}, got {value}")]
    InvalidOption {
        name: &'static str,
        requirement: &'static str,
        value: String,
    },

    #[error("invalid auto offset reset policy '{0}', expected one of: error, earliest, latest")]
    InvalidOffsetReset(String),
}

/// What to do when a partition has no committed offset for the consumer group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    /// Refuse to start: every partition must already have a committed offset
    Error,
    Earliest,
    Latest,
}

impl OffsetReset {
    /// Value understood by librdkafka's `auto.offset.reset`
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Error => "error",
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffsetReset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(OffsetReset::Error),
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            _ => Err(ConfigError::InvalidOffsetReset(s.to_string())),
        }
    }
}

/// Validated, typed consumer settings.
///
/// Built from [`Config::validate`] in the binary, or directly with
/// [`ConsumerSettings::new`] and the `with_*` methods.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub topics: Vec<String>,
    pub dead_letter_topic: String,
    pub group_id: String,
    pub bootstrap_servers: Vec<String>,
    pub auto_offset_reset: OffsetReset,
    pub concurrency: usize,
    pub max_batch_size: usize,
    pub max_batch_time: Duration,
    pub poll_timeout: Duration,
    pub max_poll_records: usize,
    pub max_worker_restarts: u32,
    pub processing_timeout: Option<Duration>,
    pub poll_max_retries: u32,
    pub commit_max_retries: u32,
    pub dead_letter_max_retries: u32,
    pub dead_letter_retry_backoff: Duration,
    pub kafka_tls: bool,
    pub kafka_message_timeout_ms: u32,
}

impl ConsumerSettings {
    /// Settings with the same defaults as the environment config
    pub fn new(topics: Vec<String>, dead_letter_topic: impl Into<String>) -> Self {
        Self {
            topics,
            dead_letter_topic: dead_letter_topic.into(),
            group_id: "batching-consumer".to_string(),
            bootstrap_servers: vec!["localhost:9092".to_string()],
            auto_offset_reset: OffsetReset::Error,
            concurrency: 1,
            max_batch_size: 10000,
            max_batch_time: Duration::from_millis(60000),
            poll_timeout: Duration::from_millis(1000),
            max_poll_records: 500,
            max_worker_restarts: 10,
            processing_timeout: None,
            poll_max_retries: 10,
            commit_max_retries: 5,
            dead_letter_max_retries: 5,
            dead_letter_retry_backoff: Duration::from_millis(100),
            kafka_tls: false,
            kafka_message_timeout_ms: 20000,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_max_batch_time(mut self, max_batch_time: Duration) -> Self {
        self.max_batch_time = max_batch_time;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_auto_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.auto_offset_reset = policy;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_max_worker_restarts(mut self, restarts: u32) -> Self {
        self.max_worker_restarts = restarts;
        self
    }

    pub fn with_dead_letter_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.dead_letter_max_retries = max_retries;
        self.dead_letter_retry_backoff = backoff;
        self
    }

    /// Comma separated bootstrap list for librdkafka
    pub fn bootstrap_servers_str(&self) -> String {
        self.bootstrap_servers.join(",")
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn require_positive(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidOption {
            name,
            requirement: "greater than 0",
            value: value.to_string(),
        });
    }
    Ok(())
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn topics(&self) -> Vec<String> {
        split_list(&self.kafka_consumer_topics)
    }

    pub fn known_topics(&self) -> BTreeSet<String> {
        split_list(&self.registered_topics).into_iter().collect()
    }

    pub fn bootstrap_servers(&self) -> Vec<String> {
        split_list(&self.kafka_hosts)
    }

    /// Check every option and produce typed settings.
    ///
    /// Runs before any broker connection is made, so a bad deployment fails
    /// fast without joining the consumer group.
    pub fn validate(&self) -> Result<ConsumerSettings, ConfigError> {
        let topics = self.topics();
        if topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }

        let known = self.known_topics();
        if let Some(unknown) = topics.iter().find(|t| !known.contains(*t)) {
            return Err(ConfigError::UnknownTopic {
                topic: unknown.clone(),
                known,
            });
        }

        let dead_letter_topic = self.dead_letter_topic.trim();
        if dead_letter_topic.is_empty() {
            return Err(ConfigError::MissingDeadLetterTopic);
        }

        let bootstrap_servers = self.bootstrap_servers();
        if bootstrap_servers.is_empty() {
            return Err(ConfigError::NoBootstrapServers);
        }

        if self.concurrency < 1 {
            return Err(ConfigError::InvalidOption {
                name: "concurrency",
                requirement: "at least 1",
                value: self.concurrency.to_string(),
            });
        }
        require_positive("max_batch_size", self.max_batch_size as u64)?;
        require_positive("max_batch_time_ms", self.max_batch_time_ms)?;
        require_positive("poll_timeout_ms", self.poll_timeout_ms)?;
        require_positive("max_poll_records", self.max_poll_records as u64)?;
        if let Some(ms) = self.processing_timeout_ms {
            require_positive("processing_timeout_ms", ms)?;
        }

        let auto_offset_reset = self.kafka_consumer_offset_reset.parse::<OffsetReset>()?;

        Ok(ConsumerSettings {
            topics,
            dead_letter_topic: dead_letter_topic.to_string(),
            group_id: self.kafka_consumer_group.clone(),
            bootstrap_servers,
            auto_offset_reset,
            concurrency: self.concurrency,
            max_batch_size: self.max_batch_size,
            max_batch_time: Duration::from_millis(self.max_batch_time_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            max_poll_records: self.max_poll_records,
            max_worker_restarts: self.max_worker_restarts,
            processing_timeout: self.processing_timeout_ms.map(Duration::from_millis),
            poll_max_retries: self.poll_max_retries,
            commit_max_retries: self.commit_max_retries,
            dead_letter_max_retries: self.dead_letter_max_retries,
            dead_letter_retry_backoff: Duration::from_millis(self.dead_letter_retry_backoff_ms),
            kafka_tls: self.kafka_tls,
            kafka_message_timeout_ms: self.kafka_message_timeout_ms,
        })
    }
}
