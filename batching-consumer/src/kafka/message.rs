use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::message::{BorrowedMessage, Headers, Message};

use crate::kafka::types::Partition;

/// An owned copy of a message read from the broker.
///
/// Messages are never mutated after they are read. The accumulator owns them
/// until a batch is sealed; after that workers and the dead-letter router only
/// borrow them from the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaMessage {
    topic_partition: Partition,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp: Option<SystemTime>,
    headers: Vec<(String, Option<Vec<u8>>)>,
}

impl KafkaMessage {
    pub fn new(
        topic_partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        timestamp: Option<SystemTime>,
        headers: Vec<(String, Option<Vec<u8>>)>,
    ) -> Self {
        Self {
            topic_partition,
            offset,
            key,
            payload,
            timestamp,
            headers,
        }
    }

    /// Copy a message out of rdkafka's buffer so it can outlive the poll call
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        // convert from rdkafka's timestamp to common Rust form
        let timestamp = msg
            .timestamp()
            .to_millis()
            .filter(|ms| *ms >= 0)
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms as u64));

        let headers = msg
            .headers()
            .map(|hdrs| {
                hdrs.iter()
                    .map(|header| (header.key.to_string(), header.value.map(<[u8]>::to_vec)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic_partition: Partition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            timestamp,
            headers,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.topic_partition
    }

    pub fn topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.topic_partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Headers in broker order; a header may carry a null value
    pub fn headers(&self) -> &[(String, Option<Vec<u8>>)] {
        &self.headers
    }

    /// Broker timestamp in milliseconds since the epoch
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp
            .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
            .and_then(|elapsed| i64::try_from(elapsed.as_millis()).ok())
    }

    /// Create a simple message with a payload for tests
    pub fn new_for_test(partition: Partition, offset: i64, payload: &str) -> Self {
        Self {
            topic_partition: partition,
            offset,
            key: None,
            payload: Some(payload.as_bytes().to_vec()),
            timestamp: Some(SystemTime::now()),
            headers: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let msg = KafkaMessage::new(
            Partition::new("events", 2),
            41,
            Some(b"user-1".to_vec()),
            Some(b"{}".to_vec()),
            Some(UNIX_EPOCH + Duration::from_millis(1_600_000_000_000)),
            vec![
                ("trace-id".to_string(), Some(b"abc".to_vec())),
                ("retry".to_string(), None),
            ],
        );

        assert_eq!(msg.topic(), "events");
        assert_eq!(msg.partition_number(), 2);
        assert_eq!(msg.offset(), 41);
        assert_eq!(msg.key(), Some(&b"user-1"[..]));
        assert_eq!(msg.payload(), Some(&b"{}"[..]));
        assert_eq!(msg.timestamp_millis(), Some(1_600_000_000_000));
        assert_eq!(msg.headers()[1], ("retry".to_string(), None));
    }

    #[test]
    fn test_null_key_payload_and_timestamp() {
        let msg = KafkaMessage::new(Partition::new("events", 0), 0, None, None, None, vec![]);

        assert!(msg.key().is_none());
        assert!(msg.payload().is_none());
        assert!(msg.timestamp_millis().is_none());
        assert!(msg.headers().is_empty());
    }
}
