use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::dead_letter::DeadLetterError;
use crate::kafka::types::Partition;
use crate::offset_tracker::OffsetTrackerError;
use crate::worker_pool::WorkerPoolError;

/// Errors surfaced by a [`BrokerClient`](crate::kafka::client::BrokerClient).
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        source: KafkaError,
    },

    #[error("produce to {topic} was canceled before delivery")]
    ProduceCanceled { topic: String },

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Fatal conditions that stop the consumer loop.
///
/// Anything that reaches this type ends the process with a non-zero exit code.
/// Per-message processing failures never do: they are dead-lettered.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    #[error(transparent)]
    Offset(#[from] OffsetTrackerError),

    #[error(transparent)]
    WorkerPool(#[from] WorkerPoolError),

    #[error("no committed offset for {partition} and auto offset reset is 'error'")]
    NoCommittedOffset { partition: Partition },
}

impl ConsumerError {
    /// Short, low-cardinality label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumerError::Broker(_) => "broker",
            ConsumerError::DeadLetter(_) => "dead_letter",
            ConsumerError::Offset(_) => "offset",
            ConsumerError::WorkerPool(_) => "worker_pool",
            ConsumerError::NoCommittedOffset { .. } => "no_committed_offset",
        }
    }
}
