// ==== Consumer loop metrics ====
/// Counter for messages returned by broker polls
pub const CONSUMER_MESSAGES_RECEIVED: &str = "batching_consumer_messages_received_total";

/// Gauge for the consumer state (0 = running, 1 = draining, 2 = stopped)
pub const CONSUMER_STATE: &str = "batching_consumer_state";

/// Counter for loop iterations that ended in a fatal error
pub const CONSUMER_FATAL_ERRORS: &str = "batching_consumer_fatal_errors_total";

// ==== Batch metrics ====
/// Histogram for the number of messages in a sealed batch
pub const BATCH_SIZE: &str = "batching_consumer_batch_size";

/// Histogram for how full a sealed batch was relative to max_batch_size
pub const BATCH_FILL_RATIO: &str = "batching_consumer_batch_fill_ratio";

/// Counter for sealed batches, labelled by flush reason
pub const BATCHES_FLUSHED: &str = "batching_consumer_batches_flushed_total";

/// Histogram for the time spent processing a batch end to end (ms)
pub const BATCH_PROCESSING_DURATION_MS: &str = "batching_consumer_batch_processing_duration_ms";

// ==== Worker pool metrics ====
/// Counter for message outcomes, labelled by outcome
pub const WORKER_MESSAGE_OUTCOMES: &str = "batching_consumer_message_outcomes_total";

/// Counter for worker restarts after a crash
pub const WORKER_RESTARTS: &str = "batching_consumer_worker_restarts_total";

/// Gauge set to 1 once the pool has lost a worker
pub const WORKER_POOL_DEGRADED: &str = "batching_consumer_worker_pool_degraded";

// ==== Dead-letter metrics ====
/// Counter for records produced to the dead-letter topic
pub const DEAD_LETTER_PRODUCED: &str = "batching_consumer_dead_letter_produced_total";

/// Counter for failed dead-letter produce attempts
pub const DEAD_LETTER_PRODUCE_ERRORS: &str = "batching_consumer_dead_letter_produce_errors_total";

// ==== Offset metrics ====
/// Counter for commit calls sent to the broker
pub const OFFSET_COMMITS: &str = "batching_consumer_offset_commits_total";

/// Gauge for the last committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "batching_consumer_partition_last_committed_offset";

/// Counter for redelivered messages at or below the committed offset
pub const OFFSET_REDELIVERED: &str = "batching_consumer_offset_redelivered_total";

// ==== Broker client metrics ====
/// Counter for errors surfaced by the Kafka client, labelled by level and kind
pub const KAFKA_CLIENT_ERROR: &str = "batching_consumer_kafka_error_total";
