use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::error::BrokerError;
use crate::kafka::client::BrokerClient;
use crate::kafka::message::KafkaMessage;
use crate::kafka::types::{Partition, PartitionOffset};
use crate::shutdown::ShutdownCoordinator;
use crate::worker_pool::MessageProcessor;

/// A record the consumer produced, as seen by the mock broker
#[derive(Debug, Clone)]
pub struct ProducedRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
}

impl ProducedRecord {
    /// Value of the first header with this name; None when missing or null
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

enum PollStep {
    Messages(Vec<KafkaMessage>),
    Error(String),
    Revoke(Vec<Partition>),
}

#[derive(Default)]
struct MockState {
    script: VecDeque<PollStep>,
    polls: usize,
    commits: Vec<Vec<PartitionOffset>>,
    failing_commits: u32,
    produced: Vec<ProducedRecord>,
    produce_attempts: usize,
    failing_produces: u32,
    committed: Vec<(Partition, Option<i64>)>,
    revoked: Vec<Partition>,
    shutdown_when_drained: Option<ShutdownCoordinator>,
}

/// In-memory [`BrokerClient`] driven by a script of poll results.
///
/// Once the script is exhausted, polls sleep for their timeout and return
/// nothing; if a shutdown coordinator is attached it is triggered at that
/// point so a consumer loop under test drains and stops.
#[derive(Default)]
pub struct MockBrokerClient {
    state: Mutex<MockState>,
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_poll(&self, messages: Vec<KafkaMessage>) {
        self.state
            .lock()
            .unwrap()
            .script
            .push_back(PollStep::Messages(messages));
    }

    pub fn push_poll_error(&self, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .script
            .push_back(PollStep::Error(reason.to_string()));
    }

    /// Revoke partitions at this point of the script; the poll itself
    /// returns no messages
    pub fn push_revocation(&self, partitions: Vec<Partition>) {
        self.state
            .lock()
            .unwrap()
            .script
            .push_back(PollStep::Revoke(partitions));
    }

    pub fn shutdown_when_drained(&self, shutdown: ShutdownCoordinator) {
        self.state.lock().unwrap().shutdown_when_drained = Some(shutdown);
    }

    pub fn set_committed_offsets(&self, committed: Vec<(Partition, Option<i64>)>) {
        self.state.lock().unwrap().committed = committed;
    }

    pub fn fail_next_commits(&self, count: u32) {
        self.state.lock().unwrap().failing_commits = count;
    }

    pub fn fail_next_produces(&self, count: u32) {
        self.state.lock().unwrap().failing_produces = count;
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().unwrap().polls
    }

    pub fn commits(&self) -> Vec<Vec<PartitionOffset>> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Every committed offset, flattened in commit order
    pub fn committed_offsets_log(&self) -> Vec<PartitionOffset> {
        self.commits().into_iter().flatten().collect()
    }

    pub fn produced(&self) -> Vec<ProducedRecord> {
        self.state.lock().unwrap().produced.clone()
    }

    pub fn produce_attempts(&self) -> usize {
        self.state.lock().unwrap().produce_attempts
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn poll(&self, timeout: Duration) -> Result<Vec<KafkaMessage>, BrokerError> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.polls += 1;
            let step = state.script.pop_front();
            if step.is_none() {
                if let Some(shutdown) = &state.shutdown_when_drained {
                    shutdown.trigger("mock broker script drained");
                }
            }
            step
        };

        match step {
            Some(PollStep::Messages(messages)) => Ok(messages),
            Some(PollStep::Error(reason)) => Err(BrokerError::Unavailable(reason)),
            Some(PollStep::Revoke(partitions)) => {
                self.state.lock().unwrap().revoked.extend(partitions);
                Ok(Vec::new())
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(BrokerError::Unavailable("commit rejected".to_string()));
        }
        state.commits.push(offsets.to_vec());
        Ok(())
    }

    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        timestamp: Option<i64>,
        headers: &[(String, Option<Vec<u8>>)],
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.produce_attempts += 1;
        if state.failing_produces > 0 {
            state.failing_produces -= 1;
            return Err(BrokerError::Unavailable("produce rejected".to_string()));
        }
        state.produced.push(ProducedRecord {
            topic: topic.to_string(),
            key: key.map(<[u8]>::to_vec),
            value: value.map(<[u8]>::to_vec),
            timestamp,
            headers: headers.to_vec(),
        });
        Ok(())
    }

    async fn committed_offsets(
        &self,
        _timeout: Duration,
    ) -> Result<Vec<(Partition, Option<i64>)>, BrokerError> {
        Ok(self.state.lock().unwrap().committed.clone())
    }

    fn take_revoked_partitions(&self) -> Vec<Partition> {
        std::mem::take(&mut self.state.lock().unwrap().revoked)
    }
}

/// Processor with scripted behaviour per offset
#[derive(Default)]
pub struct TestProcessor {
    fail_offsets: HashSet<i64>,
    panic_offsets: HashSet<i64>,
    hang_offsets: HashSet<i64>,
    shutdown_on: Option<(i64, ShutdownCoordinator)>,
    processed: AtomicUsize,
    seen: Mutex<Vec<(Partition, i64)>>,
}

impl TestProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error for these offsets
    pub fn failing_on(mut self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.fail_offsets.extend(offsets);
        self
    }

    pub fn panicking_on(mut self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.panic_offsets.extend(offsets);
        self
    }

    /// Never complete for these offsets
    pub fn hanging_on(mut self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.hang_offsets.extend(offsets);
        self
    }

    /// Request shutdown while processing this offset
    pub fn shutting_down_on(mut self, offset: i64, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown_on = Some((offset, shutdown));
        self
    }

    pub fn processed_count(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Every (partition, offset) handed to the processor, sorted
    pub fn seen(&self) -> Vec<(Partition, i64)> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort();
        seen
    }
}

#[async_trait]
impl MessageProcessor for TestProcessor {
    async fn process(&self, message: &KafkaMessage) -> Result<()> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((message.partition().clone(), message.offset()));

        let offset = message.offset();
        if let Some((_, shutdown)) = self.shutdown_on.as_ref().filter(|(at, _)| *at == offset) {
            shutdown.trigger("test processor");
        }
        if self.panic_offsets.contains(&offset) {
            panic!("test processor panicked at offset {offset}");
        }
        if self.hang_offsets.contains(&offset) {
            std::future::pending::<()>().await;
        }
        if self.fail_offsets.contains(&offset) {
            return Err(anyhow!("deterministic failure at offset {offset}"));
        }
        Ok(())
    }
}
