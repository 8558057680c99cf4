use rdkafka::ClientConfig;

use crate::config::{ConsumerSettings, OffsetReset};

/// Kafka consumer configuration builder with defaults for a manually committing
/// batch consumer.
///
/// Offsets are never stored or committed by librdkafka on its own: the consumer
/// loop commits explicitly once a batch has reached a terminal outcome.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Sets: auto.offset.store=false, auto.commit=false, socket.timeout.ms,
    /// session.timeout.ms, heartbeat.interval.ms, max.poll.interval.ms.
    pub fn for_batch_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Builder preloaded from validated settings
    pub fn from_settings(settings: &ConsumerSettings) -> Self {
        Self::for_batch_consumer(&settings.bootstrap_servers_str(), &settings.group_id)
            .with_offset_reset(settings.auto_offset_reset)
            .with_tls(settings.kafka_tls)
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Override offset reset policy.
    ///
    /// With `error`, librdkafka surfaces a consumer error instead of silently
    /// jumping to either end of the partition.
    pub fn with_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.config.set("auto.offset.reset", policy.as_str());
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Producer configuration for dead-letter writes.
///
/// Dead-letter writes wait for every in-sync replica to acknowledge, since
/// the original offset is committed as soon as the write succeeds.
pub fn dead_letter_producer_config(settings: &ConsumerSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", settings.bootstrap_servers_str())
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("linger.ms", "0")
        .set(
            "message.timeout.ms",
            settings.kafka_message_timeout_ms.to_string(),
        );

    if settings.kafka_tls {
        config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ConsumerSettings {
        let mut settings = ConsumerSettings::new(vec!["events".to_string()], "events-dlq");
        settings.bootstrap_servers = vec!["kafka-1:9092".to_string(), "kafka-2:9092".to_string()];
        settings.group_id = "group-a".to_string();
        settings
    }

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let config = ConsumerConfigBuilder::from_settings(&settings()).build();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(config.get("group.id"), Some("group-a"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("error"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_consumer_config_overrides() {
        let config = ConsumerConfigBuilder::from_settings(&settings())
            .with_offset_reset(OffsetReset::Latest)
            .with_tls(true)
            .build();

        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn test_dead_letter_producer_config() {
        let config = dead_letter_producer_config(&settings());

        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("message.timeout.ms"), Some("20000"));
        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
    }
}
