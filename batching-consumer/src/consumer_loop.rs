//! Consumer Loop - poll, accumulate, flush, dispatch, route failures, commit
//!
//! A single control task owns the broker client, the accumulator and the
//! offset tracker. The worker pool is the only parallelism. Every iteration:
//! 1. RUNNING polls (bounded by the next batch deadline) and offers messages,
//!    DRAINING force-flushes whatever is still open
//! 2. Each sealed batch is processed; failures go to the dead-letter topic
//! 3. Everything committable is committed
//!
//! A shutdown request is only observed between iterations, so a dispatched
//! batch always reaches its commit before the loop stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::accumulator::{Batch, BatchAccumulator};
use crate::config::{ConsumerSettings, OffsetReset};
use crate::dead_letter::DeadLetterRouter;
use crate::error::ConsumerError;
use crate::kafka::client::BrokerClient;
use crate::metrics_consts::{
    BATCH_PROCESSING_DURATION_MS, CONSUMER_FATAL_ERRORS, CONSUMER_MESSAGES_RECEIVED,
    CONSUMER_STATE,
};
use crate::offset_tracker::{OffsetTracker, TerminalOutcome};
use crate::shutdown::ShutdownCoordinator;
use crate::worker_pool::{MessageProcessor, ProcessingOutcome, WorkerPool, WorkerPoolConfig};

const COMMITTED_OFFSETS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Running,
    Draining,
    Stopped,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Running => "running",
            ConsumerState::Draining => "draining",
            ConsumerState::Stopped => "stopped",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            ConsumerState::Running => 0.0,
            ConsumerState::Draining => 1.0,
            ConsumerState::Stopped => 2.0,
        }
    }
}

pub struct ConsumerLoop<C: BrokerClient> {
    client: Arc<C>,
    accumulator: BatchAccumulator,
    pool: WorkerPool,
    dead_letter: DeadLetterRouter,
    tracker: OffsetTracker,
    shutdown: ShutdownCoordinator,
    state: ConsumerState,
    poll_timeout: Duration,
    auto_offset_reset: OffsetReset,
}

impl<C: BrokerClient> ConsumerLoop<C> {
    /// Build the loop and start the worker pool
    pub fn new(
        client: Arc<C>,
        processor: Arc<dyn MessageProcessor>,
        settings: &ConsumerSettings,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            client,
            accumulator: BatchAccumulator::new(settings.max_batch_size, settings.max_batch_time),
            pool: WorkerPool::new(processor, WorkerPoolConfig::from_settings(settings)),
            dead_letter: DeadLetterRouter::from_settings(settings),
            tracker: OffsetTracker::new(),
            shutdown,
            state: ConsumerState::Running,
            poll_timeout: settings.poll_timeout,
            auto_offset_reset: settings.auto_offset_reset,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Run until a requested shutdown has drained everything, or until a
    /// fatal error. The worker pool is torn down either way.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        info!(
            concurrency = self.pool.concurrency(),
            dead_letter_topic = self.dead_letter.topic(),
            auto_offset_reset = self.auto_offset_reset.as_str(),
            "Starting consumer loop"
        );
        metrics::gauge!(CONSUMER_STATE).set(self.state.gauge_value());

        let result = self.consume().await;

        if let Err(e) = &result {
            metrics::counter!(CONSUMER_FATAL_ERRORS, "kind" => e.kind()).increment(1);
            error!(state = self.state.as_str(), "Consumer loop failed: {e:#}");
        }

        self.pool.shutdown().await;
        if result.is_ok() {
            info!("Consumer loop stopped, all in-flight batches committed");
        }
        result
    }

    async fn consume(&mut self) -> Result<(), ConsumerError> {
        self.check_committed_offsets().await?;

        loop {
            self.handle_revocations();

            if self.state == ConsumerState::Running && self.shutdown.is_triggered() {
                self.transition(ConsumerState::Draining);
            }

            match self.state {
                ConsumerState::Running => {
                    self.poll_and_accumulate().await?;
                    for batch in self.accumulator.flush_eligible() {
                        self.process_batch(batch).await?;
                    }
                }
                ConsumerState::Draining => {
                    for batch in self.accumulator.flush_all() {
                        self.process_batch(batch).await?;
                    }
                }
                ConsumerState::Stopped => return Ok(()),
            }

            self.tracker.commit(self.client.as_ref()).await?;

            if self.state == ConsumerState::Draining
                && self.accumulator.is_empty()
                && self.tracker.pending_count() == 0
            {
                self.transition(ConsumerState::Stopped);
            }
        }
    }

    /// With `auto_offset_reset = error` every subscribed partition must
    /// already have a committed offset before anything is consumed.
    async fn check_committed_offsets(&mut self) -> Result<(), ConsumerError> {
        if self.auto_offset_reset != OffsetReset::Error {
            return Ok(());
        }

        let committed = self
            .client
            .committed_offsets(COMMITTED_OFFSETS_TIMEOUT)
            .await?;
        for (partition, offset) in committed {
            match offset {
                Some(offset) => info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    "Resuming from committed offset"
                ),
                None => return Err(ConsumerError::NoCommittedOffset { partition }),
            }
        }
        Ok(())
    }

    fn handle_revocations(&mut self) {
        for partition in self.client.take_revoked_partitions() {
            let discarded = self.accumulator.discard(&partition);
            self.tracker.clear_partition(&partition);
            if discarded > 0 {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    discarded,
                    "Discarded open batch of revoked partition"
                );
            }
        }
    }

    /// Poll wait, shortened so a due time-based flush is never late
    fn poll_wait(&self) -> Duration {
        match self.accumulator.next_deadline() {
            Some(deadline) => self
                .poll_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.poll_timeout,
        }
    }

    async fn poll_and_accumulate(&mut self) -> Result<(), ConsumerError> {
        let messages = self.client.poll(self.poll_wait()).await?;
        if messages.is_empty() {
            return Ok(());
        }
        metrics::counter!(CONSUMER_MESSAGES_RECEIVED).increment(messages.len() as u64);

        for message in messages {
            let partition = message.partition().clone();
            // flushing as soon as a batch fills keeps batches bounded even when
            // one poll returns more than max_batch_size messages
            if self.accumulator.offer(message) {
                if let Some(batch) = self.accumulator.flush(&partition) {
                    self.process_batch(batch).await?;
                }
            }
        }
        Ok(())
    }

    async fn process_batch(&mut self, batch: Batch) -> Result<(), ConsumerError> {
        let started = Instant::now();
        self.tracker.track(&batch);

        let outcomes = self.pool.process(&batch).await?;

        let mut dead_lettered = 0;
        for (message, outcome) in batch.messages().iter().zip(outcomes) {
            match outcome {
                ProcessingOutcome::Success => {
                    self.tracker
                        .record(message.partition(), message.offset(), TerminalOutcome::Processed);
                }
                ProcessingOutcome::Failure(reason) => {
                    warn!(
                        topic = message.topic(),
                        partition = message.partition_number(),
                        offset = message.offset(),
                        batch_id = batch.id(),
                        reason,
                        "Message failed processing"
                    );
                    self.dead_letter
                        .route(self.client.as_ref(), message, &reason)
                        .await?;
                    self.tracker.record(
                        message.partition(),
                        message.offset(),
                        TerminalOutcome::DeadLettered,
                    );
                    dead_lettered += 1;
                }
            }
        }

        metrics::histogram!(BATCH_PROCESSING_DURATION_MS)
            .record(started.elapsed().as_millis() as f64);
        info!(
            batch_id = batch.id(),
            topic = batch.partition().topic(),
            partition = batch.partition().partition_number(),
            size = batch.len(),
            first_offset = batch.first_offset(),
            last_offset = batch.last_offset(),
            reason = batch.reason().as_str(),
            age_ms = batch.age().as_millis() as u64,
            dead_lettered,
            "Processed batch"
        );
        Ok(())
    }

    fn transition(&mut self, next: ConsumerState) {
        info!(
            from = self.state.as_str(),
            to = next.as_str(),
            "Consumer state changed"
        );
        self.state = next;
        metrics::gauge!(CONSUMER_STATE).set(next.gauge_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::message::KafkaMessage;
    use crate::kafka::types::Partition;
    use crate::test_utils::{MockBrokerClient, TestProcessor};

    fn settings() -> ConsumerSettings {
        ConsumerSettings::new(vec!["events".to_string()], "events-dlq")
            .with_auto_offset_reset(OffsetReset::Earliest)
            .with_max_batch_size(100)
            .with_max_batch_time(Duration::from_millis(500))
            .with_poll_timeout(Duration::from_secs(1))
    }

    fn consumer() -> ConsumerLoop<MockBrokerClient> {
        ConsumerLoop::new(
            Arc::new(MockBrokerClient::new()),
            Arc::new(TestProcessor::new()),
            &settings(),
            ShutdownCoordinator::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wait_is_bounded_by_batch_deadline() {
        let mut consumer = consumer();
        assert_eq!(consumer.poll_wait(), Duration::from_secs(1));

        consumer
            .accumulator
            .offer(KafkaMessage::new_for_test(Partition::new("events", 0), 1, "{}"));
        assert_eq!(consumer.poll_wait(), Duration::from_millis(500));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(consumer.poll_wait(), Duration::from_millis(100));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(consumer.poll_wait(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_starts_running() {
        let consumer = consumer();
        assert_eq!(consumer.state(), ConsumerState::Running);
        assert_eq!(ConsumerState::Draining.as_str(), "draining");
    }

    #[tokio::test]
    async fn test_startup_check_skipped_for_other_reset_policies() {
        let client = Arc::new(MockBrokerClient::new());
        client.set_committed_offsets(vec![(Partition::new("events", 0), None)]);
        let mut consumer = ConsumerLoop::new(
            client,
            Arc::new(TestProcessor::new()),
            &settings(),
            ShutdownCoordinator::new(),
        );

        consumer.check_committed_offsets().await.unwrap();
    }

    #[tokio::test]
    async fn test_revocation_discards_open_batch() {
        let client = Arc::new(MockBrokerClient::new());
        let mut consumer = ConsumerLoop::new(
            client.clone(),
            Arc::new(TestProcessor::new()),
            &settings(),
            ShutdownCoordinator::new(),
        );
        let partition = Partition::new("events", 0);
        consumer
            .accumulator
            .offer(KafkaMessage::new_for_test(partition.clone(), 1, "{}"));
        consumer
            .accumulator
            .offer(KafkaMessage::new_for_test(Partition::new("events", 1), 1, "{}"));

        client.push_revocation(vec![partition]);
        client.poll(Duration::ZERO).await.unwrap();
        consumer.handle_revocations();

        assert_eq!(consumer.accumulator.open_message_count(), 1);
    }
}
