use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A partition paired with the last offset that reached a terminal outcome.
///
/// This is the consumer's view of a commit. Translating it to Kafka's
/// "next offset to consume" convention is left to the broker client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_display() {
        let partition = Partition::new("events", 3);
        assert_eq!(partition.to_string(), "events:3");
    }

    #[test]
    fn test_partitions_order_by_topic_then_number() {
        let mut partitions = vec![
            Partition::new("b", 0),
            Partition::new("a", 2),
            Partition::new("a", 1),
        ];
        partitions.sort();

        assert_eq!(
            partitions,
            vec![
                Partition::new("a", 1),
                Partition::new("a", 2),
                Partition::new("b", 0),
            ]
        );
    }
}
