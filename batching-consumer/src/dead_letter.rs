//! Dead Letter Router - Re-produces messages that failed processing onto the
//! dead-letter topic
//!
//! The record keeps the original key, payload, timestamp and headers (null
//! valued ones included). Where it came from and why it failed travel as
//! additional headers, so the dead-letter topic can be replayed with the usual
//! tooling.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::ConsumerSettings;
use crate::error::BrokerError;
use crate::kafka::client::BrokerClient;
use crate::kafka::message::KafkaMessage;
use crate::kafka::types::Partition;
use crate::metrics_consts::{DEAD_LETTER_PRODUCED, DEAD_LETTER_PRODUCE_ERRORS};

pub const HEADER_ORIGINAL_TOPIC: &str = "dlq-original-topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "dlq-original-partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "dlq-original-offset";
pub const HEADER_FAILURE_REASON: &str = "dlq-failure-reason";
pub const HEADER_FAILED_AT: &str = "dlq-failed-at";

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to dead-letter {partition} offset {offset} to {topic} after {attempts} attempts: {source}")]
    RetriesExhausted {
        topic: String,
        partition: Partition,
        offset: i64,
        attempts: u32,
        source: BrokerError,
    },
}

/// A failed message together with its failure metadata
#[derive(Debug, Clone)]
pub struct DeadLetterRecord<'a> {
    message: &'a KafkaMessage,
    reason: &'a str,
    failed_at: DateTime<Utc>,
}

impl<'a> DeadLetterRecord<'a> {
    pub fn new(message: &'a KafkaMessage, reason: &'a str, failed_at: DateTime<Utc>) -> Self {
        Self {
            message,
            reason,
            failed_at,
        }
    }

    pub fn message(&self) -> &KafkaMessage {
        self.message
    }

    pub fn reason(&self) -> &str {
        self.reason
    }

    pub fn failed_at(&self) -> DateTime<Utc> {
        self.failed_at
    }

    /// Original headers first, then the provenance headers
    pub fn to_headers(&self) -> Vec<(String, Option<Vec<u8>>)> {
        let mut headers = self.message.headers().to_vec();
        headers.reserve(5);
        headers.push((
            HEADER_ORIGINAL_TOPIC.to_string(),
            Some(self.message.topic().as_bytes().to_vec()),
        ));
        headers.push((
            HEADER_ORIGINAL_PARTITION.to_string(),
            Some(self.message.partition_number().to_string().into_bytes()),
        ));
        headers.push((
            HEADER_ORIGINAL_OFFSET.to_string(),
            Some(self.message.offset().to_string().into_bytes()),
        ));
        headers.push((
            HEADER_FAILURE_REASON.to_string(),
            Some(self.reason.as_bytes().to_vec()),
        ));
        headers.push((
            HEADER_FAILED_AT.to_string(),
            Some(
                self.failed_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
                    .into_bytes(),
            ),
        ));
        headers
    }
}

pub struct DeadLetterRouter {
    topic: String,
    max_retries: u32,
    initial_backoff: Duration,
}

impl DeadLetterRouter {
    pub fn new(topic: impl Into<String>, max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            topic: topic.into(),
            max_retries,
            initial_backoff,
        }
    }

    pub fn from_settings(settings: &ConsumerSettings) -> Self {
        Self::new(
            settings.dead_letter_topic.clone(),
            settings.dead_letter_max_retries,
            settings.dead_letter_retry_backoff,
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Produce the message to the dead-letter topic and wait for the ack.
    ///
    /// Retries with exponential backoff; once retries are exhausted the error
    /// is fatal for the consumer since the offset must not be committed.
    pub async fn route<C>(
        &self,
        client: &C,
        message: &KafkaMessage,
        reason: &str,
    ) -> Result<(), DeadLetterError>
    where
        C: BrokerClient + ?Sized,
    {
        let record = DeadLetterRecord::new(message, reason, Utc::now());
        let headers = record.to_headers();

        let mut backoff = self.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = client
                .produce(
                    &self.topic,
                    message.key(),
                    message.payload(),
                    message.timestamp_millis(),
                    &headers,
                )
                .await;

            match result {
                Ok(()) => {
                    metrics::counter!(DEAD_LETTER_PRODUCED).increment(1);
                    info!(
                        topic = message.topic(),
                        partition = message.partition_number(),
                        offset = message.offset(),
                        dead_letter_topic = self.topic,
                        reason,
                        "Routed message to dead-letter topic"
                    );
                    return Ok(());
                }
                Err(e) if attempt <= self.max_retries => {
                    metrics::counter!(DEAD_LETTER_PRODUCE_ERRORS).increment(1);
                    warn!(
                        attempt,
                        topic = message.topic(),
                        partition = message.partition_number(),
                        offset = message.offset(),
                        error = ?e,
                        "Dead-letter produce failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                }
                Err(e) => {
                    metrics::counter!(DEAD_LETTER_PRODUCE_ERRORS).increment(1);
                    error!(
                        attempts = attempt,
                        topic = message.topic(),
                        partition = message.partition_number(),
                        offset = message.offset(),
                        error = ?e,
                        "Dead-letter produce retries exhausted"
                    );
                    return Err(DeadLetterError::RetriesExhausted {
                        topic: self.topic.clone(),
                        partition: message.partition().clone(),
                        offset: message.offset(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::test_utils::MockBrokerClient;

    fn failed_message() -> KafkaMessage {
        KafkaMessage::new(
            Partition::new("events", 0),
            11,
            Some(b"user-1".to_vec()),
            Some(b"not json".to_vec()),
            Some(UNIX_EPOCH + Duration::from_millis(1_714_566_000_123)),
            vec![
                ("trace-id".to_string(), Some(b"abc".to_vec())),
                ("retry".to_string(), None),
            ],
        )
    }

    fn header<'h>(headers: &'h [(String, Option<Vec<u8>>)], name: &str) -> Option<&'h str> {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    #[test]
    fn test_record_headers_carry_provenance() {
        let message = failed_message();
        let failed_at = DateTime::parse_from_rfc3339("2024-05-01T12:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let headers = DeadLetterRecord::new(&message, "invalid payload", failed_at).to_headers();

        assert_eq!(headers.len(), 7);
        assert_eq!(header(&headers, "trace-id"), Some("abc"));
        assert_eq!(headers[1], ("retry".to_string(), None));
        assert_eq!(header(&headers, HEADER_ORIGINAL_TOPIC), Some("events"));
        assert_eq!(header(&headers, HEADER_ORIGINAL_PARTITION), Some("0"));
        assert_eq!(header(&headers, HEADER_ORIGINAL_OFFSET), Some("11"));
        assert_eq!(header(&headers, HEADER_FAILURE_REASON), Some("invalid payload"));
        assert_eq!(
            header(&headers, HEADER_FAILED_AT),
            Some("2024-05-01T12:30:00.000Z")
        );
    }

    #[tokio::test]
    async fn test_route_preserves_original_record() {
        let client = MockBrokerClient::new();
        let router = DeadLetterRouter::new("events-dlq", 3, Duration::from_millis(10));

        router
            .route(&client, &failed_message(), "invalid payload")
            .await
            .unwrap();

        let produced = client.produced();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].topic, "events-dlq");
        assert_eq!(produced[0].key.as_deref(), Some(&b"user-1"[..]));
        assert_eq!(produced[0].value.as_deref(), Some(&b"not json"[..]));
        assert_eq!(produced[0].timestamp, Some(1_714_566_000_123));
        assert_eq!(
            header(&produced[0].headers, HEADER_ORIGINAL_OFFSET),
            Some("11")
        );
        assert!(produced[0]
            .headers
            .contains(&("retry".to_string(), None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_retries_transient_failures() {
        let client = MockBrokerClient::new();
        client.fail_next_produces(2);
        let router = DeadLetterRouter::new("events-dlq", 3, Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        router
            .route(&client, &failed_message(), "boom")
            .await
            .unwrap();

        assert_eq!(client.produced().len(), 1);
        assert_eq!(client.produce_attempts(), 3);
        // 100ms then 200ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_gives_up_after_max_retries() {
        let client = MockBrokerClient::new();
        client.fail_next_produces(u32::MAX);
        let router = DeadLetterRouter::new("events-dlq", 2, Duration::from_millis(100));

        let err = router
            .route(&client, &failed_message(), "boom")
            .await
            .unwrap_err();

        let DeadLetterError::RetriesExhausted {
            topic,
            offset,
            attempts,
            ..
        } = err;
        assert_eq!(topic, "events-dlq");
        assert_eq!(offset, 11);
        assert_eq!(attempts, 3);
        assert!(client.produced().is_empty());
    }
}
