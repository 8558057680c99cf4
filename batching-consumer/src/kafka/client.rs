use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::config::ConsumerSettings;
use crate::error::BrokerError;
use crate::kafka::config::{dead_letter_producer_config, ConsumerConfigBuilder};
use crate::kafka::message::KafkaMessage;
use crate::kafka::types::{Partition, PartitionOffset};
use crate::metrics_consts::KAFKA_CLIENT_ERROR;

/// The broker primitives the consumer loop is built on.
///
/// Partition assignment, group membership and the wire protocol all live
/// behind this trait. Offsets exchanged here are always the last offset that
/// reached a terminal outcome, never Kafka's "next offset to read".
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Wait up to `timeout` for messages. An empty result is not an error.
    async fn poll(&self, timeout: Duration) -> Result<Vec<KafkaMessage>, BrokerError>;

    /// Commit the given offsets, blocking until the broker acknowledges.
    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError>;

    /// Produce one record and wait for the broker ack. `timestamp` is in
    /// milliseconds since the epoch; `None` lets the broker assign one.
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        timestamp: Option<i64>,
        headers: &[(String, Option<Vec<u8>>)],
    ) -> Result<(), BrokerError>;

    /// Committed offset per partition of every subscribed topic, `None` when
    /// the group has never committed for that partition.
    async fn committed_offsets(
        &self,
        timeout: Duration,
    ) -> Result<Vec<(Partition, Option<i64>)>, BrokerError>;

    /// Partitions revoked from this consumer since the last call.
    fn take_revoked_partitions(&self) -> Vec<Partition> {
        Vec::new()
    }
}

/// Records revocations so the consumer loop can discard open batches for
/// partitions it no longer owns.
#[derive(Default)]
pub struct BatchConsumerContext {
    revoked: Mutex<Vec<Partition>>,
}

impl BatchConsumerContext {
    fn take_revoked(&self) -> Vec<Partition> {
        let mut revoked = match self.revoked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *revoked)
    }
}

impl ClientContext for BatchConsumerContext {}

impl ConsumerContext for BatchConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!(count = partitions.count(), "Partitions revoked");
                let mut revoked = match self.revoked.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                revoked.extend(partitions.elements().into_iter().map(Partition::from));
            }
            Rebalance::Assign(partitions) => {
                info!(count = partitions.count(), "Partitions assigned");
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {e}");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!("Offset commit callback reported an error: {e}");
        }
    }
}

/// What to do with an error surfaced while polling
enum PollErrorAction {
    /// Not a failure (end of partition); keep polling
    Ignore,
    /// Transient; counts against the poll retry budget
    Retry,
    Fatal,
}

/// Poll errors seen back to back. Any poll that completes without an error,
/// including one that times out empty, starts the count over.
#[derive(Default)]
struct PollErrorBudget {
    consecutive: AtomicU32,
}

impl PollErrorBudget {
    /// Count an error, returning how many happened in a row
    fn record_error(&self) -> u32 {
        self.consecutive.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_clean(&self) {
        self.consecutive.store(0, Ordering::Relaxed);
    }
}

/// [`BrokerClient`] over an rdkafka consumer and a dedicated producer for
/// dead-letter writes.
pub struct KafkaBrokerClient {
    consumer: StreamConsumer<BatchConsumerContext>,
    producer: FutureProducer,
    topics: Vec<String>,
    max_poll_records: usize,
    poll_max_retries: u32,
    commit_max_retries: u32,
    produce_timeout: Duration,
    poll_errors: PollErrorBudget,
}

impl KafkaBrokerClient {
    pub fn new(settings: &ConsumerSettings) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer<BatchConsumerContext> =
            ConsumerConfigBuilder::from_settings(settings)
                .build()
                .create_with_context(BatchConsumerContext::default())?;

        let topics: Vec<&str> = settings.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        let producer: FutureProducer = dead_letter_producer_config(settings).create()?;

        info!(
            topics = ?settings.topics,
            group_id = settings.group_id,
            dead_letter_topic = settings.dead_letter_topic,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            producer,
            topics: settings.topics.clone(),
            max_poll_records: settings.max_poll_records,
            poll_max_retries: settings.poll_max_retries,
            commit_max_retries: settings.commit_max_retries,
            produce_timeout: Duration::from_millis(u64::from(settings.kafka_message_timeout_ms)),
            poll_errors: PollErrorBudget::default(),
        })
    }

    async fn handle_kafka_error(e: &KafkaError, current_count: u32) -> PollErrorAction {
        let current_count = u64::from(current_count);
        match e {
            KafkaError::MessageConsumption(code) => match code {
                RDKafkaErrorCode::PartitionEOF => {
                    metrics::counter!(
                        KAFKA_CLIENT_ERROR,
                        &[("level", "info"), ("error", "partition_eof"),]
                    )
                    .increment(1);
                    PollErrorAction::Ignore
                }
                RDKafkaErrorCode::AutoOffsetReset => {
                    // Only raised when auto.offset.reset=error and a partition
                    // has no usable committed offset
                    error!("No valid committed offset and offset reset policy is 'error': {code:?}");
                    metrics::counter!(
                        KAFKA_CLIENT_ERROR,
                        &[("level", "fatal"), ("error", "auto_offset_reset"),]
                    )
                    .increment(1);
                    PollErrorAction::Fatal
                }
                RDKafkaErrorCode::OperationTimedOut => {
                    metrics::counter!(
                        KAFKA_CLIENT_ERROR,
                        &[("level", "info"), ("error", "op_timed_out"),]
                    )
                    .increment(1);
                    PollErrorAction::Retry
                }
                _ => {
                    warn!("Kafka consumer error: {code:?}");
                    metrics::counter!(
                        KAFKA_CLIENT_ERROR,
                        &[("level", "warn"), ("error", "consumer"),]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(100 * current_count.min(10))).await;
                    PollErrorAction::Retry
                }
            },

            KafkaError::MessageConsumptionFatal(code) => {
                error!("Fatal Kafka consumer error: {code:?}");
                metrics::counter!(
                    KAFKA_CLIENT_ERROR,
                    &[("level", "fatal"), ("error", "consumer"),]
                )
                .increment(1);
                PollErrorAction::Fatal
            }

            // Connection issues
            KafkaError::Global(code) => match code {
                RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure => {
                    warn!("Broker connection problem: {code:?} - waiting for reconnect");
                    metrics::counter!(
                        KAFKA_CLIENT_ERROR,
                        &[("level", "warn"), ("error", "broker_transport"),]
                    )
                    .increment(1);
                    sleep(Duration::from_secs(current_count.min(5))).await;
                    PollErrorAction::Retry
                }
                RDKafkaErrorCode::Authentication => {
                    error!("Authentication failed: {code:?}");
                    metrics::counter!(
                        KAFKA_CLIENT_ERROR,
                        &[("level", "fatal"), ("error", "authentication"),]
                    )
                    .increment(1);
                    PollErrorAction::Fatal
                }
                _ => {
                    warn!("Global Kafka error: {code:?}");
                    metrics::counter!(
                        KAFKA_CLIENT_ERROR,
                        &[("level", "warn"), ("error", "global"),]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(500 * current_count.min(6))).await;
                    PollErrorAction::Retry
                }
            },

            KafkaError::Canceled => {
                info!("Consumer canceled");
                PollErrorAction::Fatal
            }

            _ => {
                error!("Unexpected Kafka error: {e:?}");
                metrics::counter!(
                    KAFKA_CLIENT_ERROR,
                    &[("level", "warn"), ("error", "unexpected"),]
                )
                .increment(1);
                sleep(Duration::from_millis(100 * current_count.min(10))).await;
                PollErrorAction::Retry
            }
        }
    }
}

fn commit_backoff(attempt: u32) -> Duration {
    Duration::from_millis(100 * u64::from(attempt.min(10)))
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn poll(&self, timeout: Duration) -> Result<Vec<KafkaMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::new();

        while messages.len() < self.max_poll_records {
            // once something arrived, only drain what is already buffered
            let wait = if messages.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };

            match tokio::time::timeout(wait, self.consumer.recv()).await {
                Err(_) => {
                    self.poll_errors.record_clean();
                    break;
                }
                Ok(Ok(borrowed)) => {
                    messages.push(KafkaMessage::from_borrowed_message(&borrowed));
                    self.poll_errors.record_clean();
                }
                Ok(Err(e)) => {
                    let attempts = self.poll_errors.record_error();
                    match Self::handle_kafka_error(&e, attempts).await {
                        PollErrorAction::Ignore => self.poll_errors.record_clean(),
                        PollErrorAction::Retry if attempts <= self.poll_max_retries => break,
                        PollErrorAction::Retry => {
                            return Err(BrokerError::RetriesExhausted {
                                operation: "poll",
                                attempts,
                                source: e,
                            });
                        }
                        PollErrorAction::Fatal => return Err(BrokerError::Kafka(e)),
                    }
                }
            }
        }

        Ok(messages)
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for offset in offsets {
            // Kafka stores the next offset to consume
            list.add_partition_offset(
                offset.topic(),
                offset.partition_number(),
                Offset::Offset(offset.offset() + 1),
            )?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.consumer.commit(&list, CommitMode::Sync) {
                Ok(()) => return Ok(()),
                Err(e) if attempt <= self.commit_max_retries => {
                    warn!(attempt, "Offset commit failed, retrying: {e}");
                    metrics::counter!(
                        KAFKA_CLIENT_ERROR,
                        &[("level", "warn"), ("error", "commit"),]
                    )
                    .increment(1);
                    sleep(commit_backoff(attempt)).await;
                }
                Err(e) => {
                    return Err(BrokerError::RetriesExhausted {
                        operation: "commit",
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        timestamp: Option<i64>,
        headers: &[(String, Option<Vec<u8>>)],
    ) -> Result<(), BrokerError> {
        let mut owned_headers = OwnedHeaders::new_with_capacity(headers.len());
        for (name, header_value) in headers {
            owned_headers = owned_headers.insert(Header {
                key: name.as_str(),
                value: header_value.as_deref(),
            });
        }

        let record: FutureRecord<'_, [u8], [u8]> = FutureRecord {
            topic,
            partition: None,
            payload: value,
            key,
            timestamp,
            headers: Some(owned_headers),
        };

        match self
            .producer
            .send(record, Timeout::After(self.produce_timeout))
            .await
        {
            Ok(_) => Ok(()),
            Err((KafkaError::Canceled, _)) => Err(BrokerError::ProduceCanceled {
                topic: topic.to_string(),
            }),
            Err((e, _)) => Err(BrokerError::Kafka(e)),
        }
    }

    async fn committed_offsets(
        &self,
        timeout: Duration,
    ) -> Result<Vec<(Partition, Option<i64>)>, BrokerError> {
        let mut list = TopicPartitionList::new();
        for topic in &self.topics {
            let metadata = self.consumer.fetch_metadata(Some(topic.as_str()), timeout)?;
            for topic_metadata in metadata.topics() {
                for partition in topic_metadata.partitions() {
                    list.add_partition(topic_metadata.name(), partition.id());
                }
            }
        }

        let committed = self.consumer.committed_offsets(list, timeout)?;

        Ok(committed
            .elements()
            .into_iter()
            .map(|elem| {
                let offset = match elem.offset() {
                    Offset::Offset(next) => Some(next - 1),
                    _ => None,
                };
                (Partition::from(elem), offset)
            })
            .collect())
    }

    fn take_revoked_partitions(&self) -> Vec<Partition> {
        self.consumer.context().take_revoked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_backoff_is_capped() {
        assert_eq!(commit_backoff(1), Duration::from_millis(100));
        assert_eq!(commit_backoff(5), Duration::from_millis(500));
        assert_eq!(commit_backoff(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_poll_error_budget_counts_only_consecutive_errors() {
        let budget = PollErrorBudget::default();

        assert_eq!(budget.record_error(), 1);
        assert_eq!(budget.record_error(), 2);

        // an empty poll that timed out cleanly in between
        budget.record_clean();
        assert_eq!(budget.record_error(), 1);

        for _ in 0..20 {
            budget.record_error();
            budget.record_clean();
        }
        assert_eq!(budget.record_error(), 1);
    }

    #[tokio::test]
    async fn test_partition_eof_is_ignored() {
        let e = KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF);
        assert!(matches!(
            KafkaBrokerClient::handle_kafka_error(&e, 1).await,
            PollErrorAction::Ignore
        ));
    }

    #[tokio::test]
    async fn test_auto_offset_reset_error_is_fatal() {
        let e = KafkaError::MessageConsumption(RDKafkaErrorCode::AutoOffsetReset);
        assert!(matches!(
            KafkaBrokerClient::handle_kafka_error(&e, 1).await,
            PollErrorAction::Fatal
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let e = KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut);
        assert!(matches!(
            KafkaBrokerClient::handle_kafka_error(&e, 3).await,
            PollErrorAction::Retry
        ));

        let e = KafkaError::Global(RDKafkaErrorCode::AllBrokersDown);
        assert!(matches!(
            KafkaBrokerClient::handle_kafka_error(&e, 2).await,
            PollErrorAction::Retry
        ));
    }

    #[tokio::test]
    async fn test_authentication_failure_is_fatal() {
        let e = KafkaError::Global(RDKafkaErrorCode::Authentication);
        assert!(matches!(
            KafkaBrokerClient::handle_kafka_error(&e, 1).await,
            PollErrorAction::Fatal
        ));
    }
}
