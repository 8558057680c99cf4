//! Offset Tracker - Tracks which offsets of each partition reached a terminal
//! outcome and commits only the contiguous prefix
//!
//! Every dispatched message is registered as pending. It becomes terminal once
//! it is processed or dead-lettered. The committable offset of a partition is
//! the highest tracked offset O such that every tracked offset <= O is
//! terminal, so outcomes may arrive in any order without a gap ever being
//! committed.
//!
//! Offsets are always "last terminal offset"; the broker client translates them
//! to Kafka's next-offset-to-read convention.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::accumulator::Batch;
use crate::error::BrokerError;
use crate::kafka::client::BrokerClient;
use crate::kafka::types::{Partition, PartitionOffset};
use crate::metrics_consts::{OFFSET_COMMITS, OFFSET_REDELIVERED, PARTITION_LAST_COMMITTED_OFFSET};

#[derive(Error, Debug)]
pub enum OffsetTrackerError {
    /// Committing below a previous commit would rewind the consumer group
    #[error("refusing to commit offset {offset} for {partition}: already committed {committed}")]
    Regression {
        partition: Partition,
        offset: i64,
        committed: i64,
    },

    #[error("offset commit failed: {0}")]
    Commit(#[from] BrokerError),
}

/// How a message left the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Processed,
    DeadLettered,
}

impl TerminalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalOutcome::Processed => "processed",
            TerminalOutcome::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Default)]
struct PartitionState {
    /// Tracked offsets above the last commit; true once terminal
    offsets: BTreeMap<i64, bool>,
    last_committed: Option<i64>,
}

impl PartitionState {
    fn is_redelivery(&self, offset: i64) -> bool {
        self.last_committed.is_some_and(|committed| offset <= committed)
    }

    /// Highest offset whose tracked predecessors are all terminal
    fn safe_offset(&self) -> Option<i64> {
        self.offsets
            .iter()
            .take_while(|(_, terminal)| **terminal)
            .last()
            .map(|(offset, _)| *offset)
    }

    fn committable(&self) -> Option<i64> {
        let safe = self.safe_offset()?;
        match self.last_committed {
            Some(committed) if safe <= committed => None,
            _ => Some(safe),
        }
    }

    fn prune(&mut self, committed: i64) {
        self.offsets = self.offsets.split_off(&(committed + 1));
    }

    fn pending(&self) -> usize {
        self.offsets.values().filter(|terminal| !**terminal).count()
    }
}

/// Per-partition offset bookkeeping, owned by the consumer loop
#[derive(Default)]
pub struct OffsetTracker {
    partitions: HashMap<Partition, PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every message of a dispatched batch as pending
    pub fn track(&mut self, batch: &Batch) {
        let state = self.partitions.entry(batch.partition().clone()).or_default();
        for message in batch.messages() {
            let offset = message.offset();
            if state.is_redelivery(offset) {
                warn!(
                    topic = batch.partition().topic(),
                    partition = batch.partition().partition_number(),
                    offset,
                    "Ignoring redelivered message at or below the committed offset"
                );
                metrics::counter!(OFFSET_REDELIVERED).increment(1);
                continue;
            }
            state.offsets.entry(offset).or_insert(false);
        }
    }

    /// Mark an offset terminal.
    ///
    /// Offsets at or below the last commit are redeliveries and are ignored.
    pub fn record(&mut self, partition: &Partition, offset: i64, outcome: TerminalOutcome) {
        let state = self.partitions.entry(partition.clone()).or_default();
        if state.is_redelivery(offset) {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                "Ignoring outcome for an already committed offset"
            );
            return;
        }

        state.offsets.insert(offset, true);
        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset,
            outcome = outcome.as_str(),
            "Offset reached terminal outcome"
        );
    }

    /// The offsets that can be committed right now, ordered by partition
    pub fn committable_offsets(&self) -> Vec<PartitionOffset> {
        let mut offsets: Vec<PartitionOffset> = self
            .partitions
            .iter()
            .filter_map(|(partition, state)| {
                state
                    .committable()
                    .map(|offset| PartitionOffset::new(partition.clone(), offset))
            })
            .collect();
        offsets.sort_by(|a, b| a.partition().cmp(b.partition()));
        offsets
    }

    /// Commit everything committable in one broker call.
    ///
    /// Returns how many partitions were committed. With nothing new to commit
    /// the broker is not called at all.
    pub async fn commit<C>(&mut self, client: &C) -> Result<usize, OffsetTrackerError>
    where
        C: BrokerClient + ?Sized,
    {
        let offsets = self.committable_offsets();
        if offsets.is_empty() {
            return Ok(0);
        }

        for offset in &offsets {
            self.check_regression(offset)?;
        }

        client.commit(&offsets).await?;

        for offset in &offsets {
            self.mark_committed(offset)?;
        }

        metrics::counter!(OFFSET_COMMITS).increment(1);
        Ok(offsets.len())
    }

    fn check_regression(&self, offset: &PartitionOffset) -> Result<(), OffsetTrackerError> {
        let committed = self
            .partitions
            .get(offset.partition())
            .and_then(|state| state.last_committed);
        match committed {
            Some(committed) if offset.offset() < committed => Err(OffsetTrackerError::Regression {
                partition: offset.partition().clone(),
                offset: offset.offset(),
                committed,
            }),
            _ => Ok(()),
        }
    }

    /// Record a successful commit and prune terminal entries at or below it.
    ///
    /// The same offset twice is a no-op; a lower one is a regression.
    pub fn mark_committed(&mut self, offset: &PartitionOffset) -> Result<(), OffsetTrackerError> {
        self.check_regression(offset)?;

        let partition = offset.partition();
        let state = self.partitions.entry(partition.clone()).or_default();
        if state.last_committed == Some(offset.offset()) {
            return Ok(());
        }

        state.last_committed = Some(offset.offset());
        state.prune(offset.offset());

        metrics::gauge!(
            PARTITION_LAST_COMMITTED_OFFSET,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string()
        )
        .set(offset.offset() as f64);

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = offset.offset(),
            "Committed offset"
        );
        Ok(())
    }

    pub fn last_committed(&self, partition: &Partition) -> Option<i64> {
        self.partitions
            .get(partition)
            .and_then(|state| state.last_committed)
    }

    /// Number of tracked offsets still waiting for an outcome
    pub fn pending_count(&self) -> usize {
        self.partitions.values().map(PartitionState::pending).sum()
    }

    /// Forget a partition after it was revoked
    pub fn clear_partition(&mut self, partition: &Partition) {
        if let Some(state) = self.partitions.remove(partition) {
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                pending = state.pending(),
                "Cleared offset state for revoked partition"
            );
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}
