//! Batch Accumulator - Buffers polled messages per partition until a batch
//! boundary is reached
//!
//! A partition's open batch becomes eligible for flushing when it holds
//! `max_batch_size` messages or when `max_batch_time` has elapsed since its
//! first message arrived. The timer only starts with that first message, so an
//! idle partition never produces an empty time-based flush.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::kafka::message::KafkaMessage;
use crate::kafka::types::Partition;
use crate::metrics_consts::{BATCHES_FLUSHED, BATCH_FILL_RATIO, BATCH_SIZE};

/// Why a batch was sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Time,
    /// Forced while draining for shutdown
    Drain,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Time => "time",
            FlushReason::Drain => "drain",
        }
    }
}

/// A sealed, immutable batch of messages from a single partition, in broker order.
///
/// The messages sit behind an `Arc` so worker tasks can read them without
/// copying while the consumer loop keeps the batch for dead-lettering and
/// offset bookkeeping.
#[derive(Debug, Clone)]
pub struct Batch {
    id: u64,
    partition: Partition,
    messages: Arc<[KafkaMessage]>,
    opened_at: Instant,
    reason: FlushReason,
}

impl Batch {
    /// `opened_at` is when the first message of the batch arrived
    pub fn new(
        id: u64,
        partition: Partition,
        messages: Vec<KafkaMessage>,
        opened_at: Instant,
        reason: FlushReason,
    ) -> Self {
        Self {
            id,
            partition,
            messages: Arc::from(messages),
            opened_at,
            reason,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn messages(&self) -> &[KafkaMessage] {
        &self.messages
    }

    pub(crate) fn shared_messages(&self) -> Arc<[KafkaMessage]> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(KafkaMessage::offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(KafkaMessage::offset)
    }

    pub fn reason(&self) -> FlushReason {
        self.reason
    }

    /// Time since the first message of the batch arrived
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

struct OpenBatch {
    messages: Vec<KafkaMessage>,
    opened_at: Instant,
}

fn flush_reason(
    open: &OpenBatch,
    now: Instant,
    max_batch_size: usize,
    max_batch_time: Duration,
) -> Option<FlushReason> {
    if open.messages.is_empty() {
        return None;
    }
    if open.messages.len() >= max_batch_size {
        return Some(FlushReason::Size);
    }
    if now.saturating_duration_since(open.opened_at) >= max_batch_time {
        return Some(FlushReason::Time);
    }
    None
}

pub struct BatchAccumulator {
    max_batch_size: usize,
    max_batch_time: Duration,
    open: BTreeMap<Partition, OpenBatch>,
    next_batch_id: u64,
}

impl BatchAccumulator {
    pub fn new(max_batch_size: usize, max_batch_time: Duration) -> Self {
        Self {
            max_batch_size,
            max_batch_time,
            open: BTreeMap::new(),
            next_batch_id: 1,
        }
    }

    /// Append a message to its partition's open batch.
    ///
    /// Returns true when that batch is now eligible for flushing.
    pub fn offer(&mut self, message: KafkaMessage) -> bool {
        let now = Instant::now();
        let (max_batch_size, max_batch_time) = (self.max_batch_size, self.max_batch_time);
        let open = self
            .open
            .entry(message.partition().clone())
            .or_insert_with(|| OpenBatch {
                messages: Vec::with_capacity(max_batch_size.min(1024)),
                opened_at: now,
            });
        open.messages.push(message);

        flush_reason(open, now, max_batch_size, max_batch_time).is_some()
    }

    fn eligibility(&self, open: &OpenBatch, now: Instant) -> Option<FlushReason> {
        flush_reason(open, now, self.max_batch_size, self.max_batch_time)
    }

    /// Whether the partition's open batch may be flushed right now
    pub fn is_eligible(&self, partition: &Partition) -> bool {
        let now = Instant::now();
        self.open
            .get(partition)
            .and_then(|open| self.eligibility(open, now))
            .is_some()
    }

    /// Seal the partition's open batch if it is eligible
    pub fn flush(&mut self, partition: &Partition) -> Option<Batch> {
        let now = Instant::now();
        let reason = self
            .open
            .get(partition)
            .and_then(|open| self.eligibility(open, now))?;
        self.seal(partition, reason)
    }

    /// Seal every eligible batch, ordered by partition
    pub fn flush_eligible(&mut self) -> Vec<Batch> {
        let now = Instant::now();
        let eligible: Vec<(Partition, FlushReason)> = self
            .open
            .iter()
            .filter_map(|(partition, open)| {
                self.eligibility(open, now)
                    .map(|reason| (partition.clone(), reason))
            })
            .collect();

        eligible
            .into_iter()
            .filter_map(|(partition, reason)| self.seal(&partition, reason))
            .collect()
    }

    /// Seal every open batch regardless of eligibility
    pub fn flush_all(&mut self) -> Vec<Batch> {
        let partitions: Vec<Partition> = self.open.keys().cloned().collect();
        partitions
            .into_iter()
            .filter_map(|partition| self.seal(&partition, FlushReason::Drain))
            .collect()
    }

    /// Drop a partition's open batch without sealing it, returning how many
    /// messages were discarded. Used when the partition is revoked: the
    /// messages are uncommitted and will be redelivered to the new owner.
    pub fn discard(&mut self, partition: &Partition) -> usize {
        self.open
            .remove(partition)
            .map_or(0, |open| open.messages.len())
    }

    /// The earliest instant at which a time-based flush becomes due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open
            .values()
            .filter(|open| !open.messages.is_empty())
            .map(|open| open.opened_at + self.max_batch_time)
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.open.values().all(|open| open.messages.is_empty())
    }

    pub fn open_message_count(&self) -> usize {
        self.open.values().map(|open| open.messages.len()).sum()
    }

    fn seal(&mut self, partition: &Partition, reason: FlushReason) -> Option<Batch> {
        let open = self.open.remove(partition)?;
        if open.messages.is_empty() {
            return None;
        }

        let id = self.next_batch_id;
        self.next_batch_id += 1;

        let size = open.messages.len();
        metrics::histogram!(BATCH_SIZE).record(size as f64);
        metrics::histogram!(BATCH_FILL_RATIO).record(size as f64 / self.max_batch_size as f64);
        metrics::counter!(BATCHES_FLUSHED, "reason" => reason.as_str()).increment(1);

        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            batch_id = id,
            size,
            reason = reason.as_str(),
            "Sealed batch"
        );

        Some(Batch::new(
            id,
            partition.clone(),
            open.messages,
            open.opened_at,
            reason,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(partition: i32, offset: i64) -> KafkaMessage {
        KafkaMessage::new_for_test(Partition::new("events", partition), offset, "{}")
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_bound_triggers_eligibility() {
        let mut acc = BatchAccumulator::new(3, Duration::from_secs(60));

        assert!(!acc.offer(msg(0, 10)));
        assert!(!acc.offer(msg(0, 11)));
        assert!(acc.flush(&Partition::new("events", 0)).is_none());
        assert!(acc.offer(msg(0, 12)));

        let batch = acc.flush(&Partition::new("events", 0)).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.reason(), FlushReason::Size);
        assert_eq!(batch.first_offset(), Some(10));
        assert_eq!(batch.last_offset(), Some(12));
        assert!(acc.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_bound_flushes_undersized_batch() {
        let mut acc = BatchAccumulator::new(100, Duration::from_millis(500));
        let partition = Partition::new("events", 0);

        acc.offer(msg(0, 1));
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!acc.is_eligible(&partition));
        assert!(acc.flush_eligible().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(acc.is_eligible(&partition));

        let batches = acc.flush_eligible();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].reason(), FlushReason::Time);
        assert_eq!(batches[0].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_starts_with_first_message() {
        let mut acc = BatchAccumulator::new(100, Duration::from_millis(500));

        // idle time before the first message does not count
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(acc.flush_eligible().is_empty());
        assert_eq!(acc.next_deadline(), None);

        assert!(!acc.offer(msg(0, 1)));
        assert_eq!(
            acc.next_deadline(),
            Some(Instant::now() + Duration::from_millis(500))
        );

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(acc.flush_eligible().len(), 1);

        // the next batch gets a fresh timer
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!acc.offer(msg(0, 2)));
        assert!(acc.flush_eligible().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_age_counts_from_first_message() {
        let mut acc = BatchAccumulator::new(100, Duration::from_secs(60));
        let partition = Partition::new("events", 0);

        acc.offer(msg(0, 1));
        tokio::time::advance(Duration::from_millis(300)).await;
        acc.offer(msg(0, 2));
        tokio::time::advance(Duration::from_millis(200)).await;

        let batch = acc.flush_all().remove(0);
        assert_eq!(batch.age(), Duration::from_millis(500));
        assert_eq!(batch.partition(), &partition);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partitions_batch_independently() {
        let mut acc = BatchAccumulator::new(2, Duration::from_secs(60));

        assert!(!acc.offer(msg(0, 1)));
        assert!(!acc.offer(msg(1, 1)));
        assert!(acc.offer(msg(0, 2)));

        let batches = acc.flush_eligible();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].partition(), &Partition::new("events", 0));
        assert_eq!(acc.open_message_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_preserves_partition_order() {
        let mut acc = BatchAccumulator::new(100, Duration::from_secs(60));
        for offset in 0..5 {
            acc.offer(msg(1, offset));
            acc.offer(msg(0, offset + 100));
        }

        let batches = acc.flush_all();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.reason() == FlushReason::Drain));

        assert_eq!(batches[0].partition().partition_number(), 0);
        let offsets: Vec<i64> = batches[1].messages().iter().map(|m| m.offset()).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert!(acc.is_empty());
        assert!(acc.flush_all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_ids_are_sequential() {
        let mut acc = BatchAccumulator::new(1, Duration::from_secs(60));
        let partition = Partition::new("events", 0);

        acc.offer(msg(0, 1));
        let first = acc.flush(&partition).unwrap();
        acc.offer(msg(0, 2));
        let second = acc.flush(&partition).unwrap();

        assert_eq!(first.id() + 1, second.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_drops_open_batch() {
        let mut acc = BatchAccumulator::new(100, Duration::from_secs(60));
        acc.offer(msg(0, 1));
        acc.offer(msg(0, 2));
        acc.offer(msg(1, 1));

        assert_eq!(acc.discard(&Partition::new("events", 0)), 2);
        assert_eq!(acc.discard(&Partition::new("events", 0)), 0);
        assert_eq!(acc.open_message_count(), 1);
    }
}
