//! Worker Pool - Processes every message of a sealed batch and reports one
//! outcome per message
//!
//! With `concurrency = 1` messages are processed inline on the consumer task.
//! With `concurrency > 1` a fixed set of worker tasks is started once and
//! reused for every batch:
//! 1. Jobs go through a single shared queue, so a slow message never blocks
//!    messages queued behind it on another worker
//! 2. Outcomes come back on a result channel; workers share nothing else
//! 3. A worker that dies mid-message is restarted, and the message it held is
//!    reported as failed. Jobs still queued are picked up by the other workers

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accumulator::Batch;
use crate::config::ConsumerSettings;
use crate::kafka::message::KafkaMessage;
use crate::metrics_consts::{WORKER_MESSAGE_OUTCOMES, WORKER_POOL_DEGRADED, WORKER_RESTARTS};

/// How often the pool checks for dead workers while waiting on a batch
const WORKER_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// The processing function applied to every message.
///
/// Returning an error fails that message only; it is routed to the
/// dead-letter topic and the rest of the batch is unaffected.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &KafkaMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,
    Failure(String),
}

impl ProcessingOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success)
    }

    fn label(&self) -> &'static str {
        match self {
            ProcessingOutcome::Success => "success",
            ProcessingOutcome::Failure(_) => "failure",
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerPoolError {
    #[error("worker {worker_id} crashed and the pool exhausted its restart budget of {max_restarts}")]
    RestartsExhausted { worker_id: usize, max_restarts: u32 },

    #[error("worker pool has been shut down")]
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub max_worker_restarts: u32,
    pub processing_timeout: Option<Duration>,
}

impl WorkerPoolConfig {
    pub fn from_settings(settings: &ConsumerSettings) -> Self {
        Self {
            concurrency: settings.concurrency,
            max_worker_restarts: settings.max_worker_restarts,
            processing_timeout: settings.processing_timeout,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_worker_restarts: 10,
            processing_timeout: None,
        }
    }
}

struct Job {
    batch_id: u64,
    index: usize,
    messages: Arc<[KafkaMessage]>,
}

struct JobResult {
    batch_id: u64,
    index: usize,
    outcome: ProcessingOutcome,
}

/// The job a worker is currently processing, if any
type CurrentJob = Arc<Mutex<Option<(u64, usize)>>>;

type SharedJobQueue = Arc<TokioMutex<mpsc::UnboundedReceiver<Job>>>;

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
    current: CurrentJob,
}

struct Workers {
    job_tx: mpsc::UnboundedSender<Job>,
    job_rx: SharedJobQueue,
    result_tx: mpsc::UnboundedSender<JobResult>,
    result_rx: mpsc::UnboundedReceiver<JobResult>,
    workers: Vec<Worker>,
}

pub struct WorkerPool {
    processor: Arc<dyn MessageProcessor>,
    config: WorkerPoolConfig,
    // None when processing inline
    workers: Option<Workers>,
    restarts: u32,
    degraded: bool,
}

fn lock_current(current: &CurrentJob) -> std::sync::MutexGuard<'_, Option<(u64, usize)>> {
    match current.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn panicked(message: &str) -> ProcessingOutcome {
    ProcessingOutcome::Failure(format!("processing panicked: {message}"))
}

async fn process_one(
    processor: &dyn MessageProcessor,
    message: &KafkaMessage,
    timeout: Option<Duration>,
) -> ProcessingOutcome {
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, processor.process(message)).await {
            Ok(result) => result,
            Err(_) => {
                return ProcessingOutcome::Failure(format!(
                    "processing timed out after {}ms",
                    limit.as_millis()
                ));
            }
        },
        None => processor.process(message).await,
    };

    match result {
        Ok(()) => ProcessingOutcome::Success,
        Err(e) => ProcessingOutcome::Failure(format!("{e:#}")),
    }
}

async fn run_worker(
    id: usize,
    processor: Arc<dyn MessageProcessor>,
    jobs: SharedJobQueue,
    results: mpsc::UnboundedSender<JobResult>,
    current: CurrentJob,
    timeout: Option<Duration>,
) {
    debug!(worker_id = id, "Worker started");

    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        *lock_current(&current) = Some((job.batch_id, job.index));
        let outcome = process_one(processor.as_ref(), &job.messages[job.index], timeout).await;
        // cleared before reporting so a crash check never sees a finished job
        *lock_current(&current) = None;

        let result = JobResult {
            batch_id: job.batch_id,
            index: job.index,
            outcome,
        };
        if results.send(result).is_err() {
            break;
        }
    }

    debug!(worker_id = id, "Worker shutting down");
}

impl Workers {
    fn spawn_worker(&self, id: usize, processor: &Arc<dyn MessageProcessor>, timeout: Option<Duration>) -> Worker {
        let current: CurrentJob = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(run_worker(
            id,
            processor.clone(),
            self.job_rx.clone(),
            self.result_tx.clone(),
            current.clone(),
            timeout,
        ));
        Worker {
            id,
            handle,
            current,
        }
    }
}

impl WorkerPool {
    /// Create the pool. With `concurrency > 1` the workers are spawned here and
    /// live until [`WorkerPool::shutdown`].
    pub fn new(processor: Arc<dyn MessageProcessor>, config: WorkerPoolConfig) -> Self {
        let workers = if config.concurrency > 1 {
            let (job_tx, job_rx) = mpsc::unbounded_channel();
            let (result_tx, result_rx) = mpsc::unbounded_channel();
            let mut workers = Workers {
                job_tx,
                job_rx: Arc::new(TokioMutex::new(job_rx)),
                result_tx,
                result_rx,
                workers: Vec::with_capacity(config.concurrency),
            };
            for id in 0..config.concurrency {
                let worker = workers.spawn_worker(id, &processor, config.processing_timeout);
                workers.workers.push(worker);
            }
            info!("Started worker pool with {} workers", config.concurrency);
            Some(workers)
        } else {
            info!("Processing messages inline on the consumer task");
            None
        };

        metrics::gauge!(WORKER_POOL_DEGRADED).set(0.0);

        Self {
            processor,
            config,
            workers,
            restarts: 0,
            degraded: false,
        }
    }

    /// Process every message of the batch.
    ///
    /// Blocks until each message has exactly one outcome; the returned vector is
    /// aligned index for index with `batch.messages()`.
    pub async fn process(&mut self, batch: &Batch) -> Result<Vec<ProcessingOutcome>, WorkerPoolError> {
        let outcomes = if self.workers.is_some() {
            self.process_with_workers(batch).await?
        } else {
            self.process_inline(batch).await
        };

        for outcome in &outcomes {
            metrics::counter!(WORKER_MESSAGE_OUTCOMES, "outcome" => outcome.label()).increment(1);
        }

        Ok(outcomes)
    }

    async fn process_inline(&self, batch: &Batch) -> Vec<ProcessingOutcome> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for message in batch.messages() {
            let outcome = AssertUnwindSafe(process_one(
                self.processor.as_ref(),
                message,
                self.config.processing_timeout,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| panicked(&panic_message(payload.as_ref())));
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn process_with_workers(
        &mut self,
        batch: &Batch,
    ) -> Result<Vec<ProcessingOutcome>, WorkerPoolError> {
        let batch_id = batch.id();
        let messages = batch.shared_messages();
        let mut outcomes: Vec<Option<ProcessingOutcome>> = vec![None; messages.len()];
        let mut remaining = messages.len();

        {
            let workers = self.workers.as_ref().ok_or(WorkerPoolError::ShutDown)?;
            for index in 0..messages.len() {
                let job = Job {
                    batch_id,
                    index,
                    messages: messages.clone(),
                };
                workers
                    .job_tx
                    .send(job)
                    .map_err(|_| WorkerPoolError::ShutDown)?;
            }
        }

        let mut health_check = tokio::time::interval(WORKER_HEALTH_CHECK_INTERVAL);
        health_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while remaining > 0 {
            let workers = self.workers.as_mut().ok_or(WorkerPoolError::ShutDown)?;
            tokio::select! {
                Some(result) = workers.result_rx.recv() => {
                    if result.batch_id != batch_id {
                        debug!(batch_id = result.batch_id, "Ignoring outcome from a previous batch");
                        continue;
                    }
                    let slot = &mut outcomes[result.index];
                    if slot.is_none() {
                        *slot = Some(result.outcome);
                        remaining -= 1;
                    }
                }

                _ = health_check.tick() => {
                    for (index, outcome) in self.recover_crashed_workers(batch_id).await? {
                        let slot = &mut outcomes[index];
                        if slot.is_none() {
                            *slot = Some(outcome);
                            remaining -= 1;
                        }
                    }
                }
            }
        }

        // every slot is filled once remaining reaches zero
        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| ProcessingOutcome::Failure("no outcome reported".to_string()))
            })
            .collect())
    }

    /// Restart dead workers, returning a failure outcome for each message of
    /// the current batch that a dead worker was holding.
    async fn recover_crashed_workers(
        &mut self,
        batch_id: u64,
    ) -> Result<Vec<(usize, ProcessingOutcome)>, WorkerPoolError> {
        let Some(workers) = self.workers.as_mut() else {
            return Err(WorkerPoolError::ShutDown);
        };

        let mut lost = Vec::new();
        for slot in 0..workers.workers.len() {
            if !workers.workers[slot].handle.is_finished() {
                continue;
            }

            let worker_id = workers.workers[slot].id;
            let held = lock_current(&workers.workers[slot].current).take();
            let reason = match (&mut workers.workers[slot].handle).await {
                Ok(()) => "worker exited unexpectedly".to_string(),
                Err(e) if e.is_panic() => panic_message(e.into_panic().as_ref()),
                Err(e) => e.to_string(),
            };

            self.restarts += 1;
            self.degraded = true;
            metrics::counter!(WORKER_RESTARTS).increment(1);
            metrics::gauge!(WORKER_POOL_DEGRADED).set(1.0);

            warn!(
                worker_id,
                restarts = self.restarts,
                held_job = ?held,
                reason,
                "Worker crashed"
            );

            if let Some((held_batch, index)) = held {
                if held_batch == batch_id {
                    lost.push((index, panicked(&reason)));
                }
            }

            if self.restarts > self.config.max_worker_restarts {
                error!(
                    worker_id,
                    max_restarts = self.config.max_worker_restarts,
                    "Worker restart budget exhausted"
                );
                return Err(WorkerPoolError::RestartsExhausted {
                    worker_id,
                    max_restarts: self.config.max_worker_restarts,
                });
            }

            let replacement =
                workers.spawn_worker(worker_id, &self.processor, self.config.processing_timeout);
            workers.workers[slot] = replacement;
        }

        Ok(lost)
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// True once any worker has crashed since the pool started
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Stop accepting work and wait for the workers to exit
    pub async fn shutdown(mut self) {
        let Some(workers) = self.workers.take() else {
            return;
        };

        let Workers {
            job_tx,
            workers: handles,
            ..
        } = workers;
        // closing the queue lets each worker finish its loop
        drop(job_tx);

        for worker in handles {
            match worker.handle.await {
                Ok(()) => debug!(worker_id = worker.id, "Worker shut down gracefully"),
                Err(e) => warn!(worker_id = worker.id, "Worker panicked during shutdown: {e}"),
            }
        }
        info!("Worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::FlushReason;
    use crate::kafka::types::Partition;
    use crate::test_utils::TestProcessor;
    use tokio::time::Instant;

    fn batch(offsets: std::ops::Range<i64>) -> Batch {
        let partition = Partition::new("events", 0);
        let messages = offsets
            .map(|offset| KafkaMessage::new_for_test(partition.clone(), offset, "{}"))
            .collect();
        Batch::new(1, partition, messages, Instant::now(), FlushReason::Size)
    }

    fn pool(processor: Arc<TestProcessor>, concurrency: usize) -> WorkerPool {
        WorkerPool::new(
            processor,
            WorkerPoolConfig {
                concurrency,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_inline_processing_returns_aligned_outcomes() {
        let processor = Arc::new(TestProcessor::new().failing_on([11]));
        let mut pool = pool(processor.clone(), 1);

        let outcomes = pool.process(&batch(10..13)).await.unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_success());
        assert!(matches!(&outcomes[1], ProcessingOutcome::Failure(reason) if reason.contains("offset 11")));
        assert!(outcomes[2].is_success());
        assert_eq!(processor.processed_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_matches_inline_outcomes() {
        let processor = Arc::new(TestProcessor::new().failing_on([3, 4, 17, 42]));
        let input = batch(0..50);

        let mut inline = pool(processor.clone(), 1);
        let mut parallel = pool(processor.clone(), 4);

        let inline_outcomes = inline.process(&input).await.unwrap();
        let parallel_outcomes = parallel.process(&input).await.unwrap();

        assert_eq!(inline_outcomes.len(), 50);
        assert_eq!(inline_outcomes, parallel_outcomes);
        assert_eq!(processor.processed_count(), 100);

        parallel.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_is_reused_across_batches() {
        let processor = Arc::new(TestProcessor::new());
        let mut pool = pool(processor.clone(), 3);

        for round in 0..5 {
            let outcomes = pool.process(&batch(round * 10..round * 10 + 10)).await.unwrap();
            assert_eq!(outcomes.len(), 10);
            assert!(outcomes.iter().all(ProcessingOutcome::is_success));
        }

        assert_eq!(processor.processed_count(), 50);
        assert!(!pool.is_degraded());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_inline_panic_fails_only_that_message() {
        let processor = Arc::new(TestProcessor::new().panicking_on([1]));
        let mut pool = pool(processor, 1);

        let outcomes = pool.process(&batch(0..3)).await.unwrap();

        assert!(outcomes[0].is_success());
        assert!(matches!(&outcomes[1], ProcessingOutcome::Failure(reason) if reason.contains("panicked")));
        assert!(outcomes[2].is_success());
        assert!(!pool.is_degraded());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_crash_is_recovered() {
        let processor = Arc::new(TestProcessor::new().panicking_on([5]));
        let mut pool = pool(processor.clone(), 2);

        let outcomes = pool.process(&batch(0..10)).await.unwrap();

        assert_eq!(outcomes.len(), 10);
        for (offset, outcome) in outcomes.iter().enumerate() {
            if offset == 5 {
                assert!(matches!(outcome, ProcessingOutcome::Failure(reason) if reason.contains("panicked")));
            } else {
                assert!(outcome.is_success(), "offset {offset} should succeed");
            }
        }
        assert!(pool.is_degraded());
        assert_eq!(pool.restarts(), 1);

        // the restarted worker keeps serving batches
        let outcomes = pool.process(&batch(10..20)).await.unwrap();
        assert!(outcomes.iter().all(ProcessingOutcome::is_success));

        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_budget_exhaustion_is_fatal() {
        let processor = Arc::new(TestProcessor::new().panicking_on([0]));
        let mut pool = WorkerPool::new(
            processor,
            WorkerPoolConfig {
                concurrency: 2,
                max_worker_restarts: 0,
                processing_timeout: None,
            },
        );

        let result = pool.process(&batch(0..4)).await;

        assert!(matches!(
            result,
            Err(WorkerPoolError::RestartsExhausted { max_restarts: 0, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_timeout_fails_hung_message() {
        let processor = Arc::new(TestProcessor::new().hanging_on([1]));
        let mut pool = WorkerPool::new(
            processor,
            WorkerPoolConfig {
                concurrency: 1,
                max_worker_restarts: 10,
                processing_timeout: Some(Duration::from_millis(250)),
            },
        );

        let outcomes = pool.process(&batch(0..3)).await.unwrap();

        assert!(outcomes[0].is_success());
        assert_eq!(
            outcomes[1],
            ProcessingOutcome::Failure("processing timed out after 250ms".to_string())
        );
        assert!(outcomes[2].is_success());
    }
}
