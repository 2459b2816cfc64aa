//! Durable Ordered Log
//!
//! The broker boundary: ingestion publishes encoded chunks onto
//! per-data-type topics, the pipeline consumes them per partition. The
//! broker guarantees per-key ordering and at-least-once delivery; both
//! implementations here preserve per-partition total order.
//!
//! `MemoryLog` keeps everything in process and backs tests and
//! single-node deployments; `RedisLog` maps each (topic, partition) onto
//! a Redis Stream.

pub mod memory;
pub mod redis;

pub use self::redis::RedisLog;
pub use memory::MemoryLog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Topic carrying dead-lettered chunks after retry exhaustion
pub const DEAD_LETTER_TOPIC: &str = "neural-data.dead-letter";

/// One record on the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    /// Routing key, `(device_id, time_bucket)` for signal topics
    pub key: String,
    /// Wire codec version of the payload
    pub codec_version: u8,
    /// Signing/encryption key id when payloads are protected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub payload: Vec<u8>,
    /// Assigned by the log on publish; dense per partition for the
    /// in-process log, monotonic for brokers with sparse ids
    pub offset: u64,
}

/// Subscription handle: an ordered stream of records for one partition
pub struct LogStream {
    pub receiver: mpsc::Receiver<Record>,
}

impl LogStream {
    pub async fn next(&mut self) -> Option<Record> {
        self.receiver.recv().await
    }

    /// Adapt into a `futures::Stream` for combinator-style consumers
    pub fn into_stream(self) -> tokio_stream::wrappers::ReceiverStream<Record> {
        tokio_stream::wrappers::ReceiverStream::new(self.receiver)
    }
}

/// Broker contract assumed by the engine
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append a record; returns its offset within the partition
    async fn publish(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        codec_version: u8,
        key_id: Option<String>,
        payload: Vec<u8>,
    ) -> Result<u64>;

    /// Follow one partition from `from_offset` (inclusive). Replays the
    /// backlog first, then tails new records in order.
    async fn subscribe(&self, topic: &str, partition: u32, from_offset: u64) -> Result<LogStream>;

    /// Records currently retained in a partition
    async fn partition_len(&self, topic: &str, partition: u32) -> Result<u64>;
}

/// Topic name for a data type's signal stream
pub fn signal_topic(data_type: crate::chunk::DataType) -> String {
    format!("neural-data.{}", data_type.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DataType;

    #[test]
    fn test_topic_names() {
        assert_eq!(signal_topic(DataType::Eeg), "neural-data.eeg");
        assert_eq!(signal_topic(DataType::Accelerometer), "neural-data.accelerometer");
    }
}
