//! Batching Kafka consumer.
//!
//! Messages are accumulated per partition into bounded batches, processed by a
//! worker pool, and committed only once every message of a batch was either
//! processed or written to the dead-letter topic. Delivery is at-least-once.
//!
//! ## Error logging (anyhow)
//!
//! Log errors with a format that keeps the cause chain:
//!
//! - **Inline format:** `{e:#}` for the full chain on one line.
//! - **Structured field:** `error = ?e` for the chain with `Caused by:` sections.
//!
//! Avoid `{}` / `%e` (Display) for errors; it only shows the top-level message.

pub mod accumulator;
pub mod config;
pub mod consumer_loop;
pub mod dead_letter;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod metrics_server;
pub mod offset_tracker;
pub mod processor;
pub mod shutdown;
pub mod test_utils;
pub mod worker_pool;

pub use consumer_loop::{ConsumerLoop, ConsumerState};
pub use error::ConsumerError;
pub use worker_pool::{MessageProcessor, ProcessingOutcome};
