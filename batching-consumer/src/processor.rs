use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::kafka::message::KafkaMessage;
use crate::worker_pool::MessageProcessor;

/// Default processing function of the binary.
///
/// Accepts any message whose payload is a JSON document and rejects the rest,
/// which sends them to the dead-letter topic.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPayloadProcessor;

#[async_trait]
impl MessageProcessor for JsonPayloadProcessor {
    async fn process(&self, message: &KafkaMessage) -> Result<()> {
        let payload = match message.payload() {
            Some(payload) if !payload.is_empty() => payload,
            _ => bail!("message has an empty payload"),
        };

        let value: serde_json::Value =
            serde_json::from_slice(payload).context("payload is not valid JSON")?;

        debug!(
            topic = message.topic(),
            partition = message.partition_number(),
            offset = message.offset(),
            is_object = value.is_object(),
            "Processed message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::types::Partition;

    fn message(payload: Option<&str>) -> KafkaMessage {
        KafkaMessage::new(
            Partition::new("events", 0),
            1,
            None,
            payload.map(|p| p.as_bytes().to_vec()),
            None,
            vec![],
        )
    }

    #[tokio::test]
    async fn test_accepts_json_payloads() {
        let processor = JsonPayloadProcessor;
        processor
            .process(&message(Some(r#"{"event": "pageview"}"#)))
            .await
            .unwrap();
        processor.process(&message(Some("[1, 2]"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_empty_payload() {
        let processor = JsonPayloadProcessor;
        let err = processor.process(&message(None)).await.unwrap_err();
        assert_eq!(err.to_string(), "message has an empty payload");
        assert!(processor.process(&message(Some(""))).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_invalid_json() {
        let err = JsonPayloadProcessor
            .process(&message(Some("not json")))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").starts_with("payload is not valid JSON: "));
    }
}
