//! Redis Streams Log
//!
//! Maps each (topic, partition) onto one Redis Stream. XADD preserves
//! append order, XREAD BLOCK tails it, so per-partition ordering and
//! at-least-once delivery carry over directly. Stream entry ids
//! (`ms-seq`) are folded into a single monotonic u64 offset.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::log::{DurableLog, LogStream, Record};

const BLOCK_MS: usize = 1000;
const READ_COUNT: usize = 256;

/// Redis-backed durable log
#[derive(Clone)]
pub struct RedisLog {
    manager: ConnectionManager,
}

impl RedisLog {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EngineError::configuration(format!("redis url: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::transient(format!("redis connect: {e}")))?;
        Ok(Self { manager })
    }

    fn stream_key(topic: &str, partition: u32) -> String {
        format!("log:{{{topic}}}:{partition}")
    }
}

/// Fold a Redis stream id (`ms-seq`) into one ordered u64
fn encode_offset(id: &str) -> u64 {
    let mut parts = id.splitn(2, '-');
    let ms: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let seq: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (ms << 20) | (seq & 0xF_FFFF)
}

/// Expand an offset back into the stream id it came from
fn decode_offset(offset: u64) -> String {
    format!("{}-{}", offset >> 20, offset & 0xF_FFFF)
}

#[async_trait]
impl DurableLog for RedisLog {
    async fn publish(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        codec_version: u8,
        key_id: Option<String>,
        payload: Vec<u8>,
    ) -> Result<u64> {
        let stream = Self::stream_key(topic, partition);
        let mut conn = self.manager.clone();
        let mut fields: Vec<(&str, Vec<u8>)> = vec![
            ("key", key.as_bytes().to_vec()),
            ("codec", vec![codec_version]),
            ("payload", payload),
        ];
        if let Some(key_id) = &key_id {
            fields.push(("key_id", key_id.as_bytes().to_vec()));
        }
        let id: String = conn
            .xadd(&stream, "*", &fields)
            .await
            .map_err(|e| EngineError::transient(format!("redis xadd: {e}")))?;
        Ok(encode_offset(&id))
    }

    async fn subscribe(&self, topic: &str, partition: u32, from_offset: u64) -> Result<LogStream> {
        let stream_key = Self::stream_key(topic, partition);
        let topic = topic.to_string();
        let mut conn = self.manager.clone();
        let (tx, rx) = mpsc::channel(READ_COUNT);

        tokio::spawn(async move {
            // XREAD is exclusive of the cursor; start just below the
            // requested offset so it is included.
            let mut cursor = if from_offset == 0 {
                "0-0".to_string()
            } else {
                decode_offset(from_offset - 1)
            };
            loop {
                let options = redis::streams::StreamReadOptions::default()
                    .count(READ_COUNT)
                    .block(BLOCK_MS);
                let reply: redis::RedisResult<redis::streams::StreamReadReply> = conn
                    .xread_options(&[&stream_key], &[cursor.as_str()], &options)
                    .await;
                let reply = match reply {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(stream = %stream_key, "redis xread failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                for stream in reply.keys {
                    for entry in stream.ids {
                        cursor = entry.id.clone();
                        let key: String = entry
                            .get::<String>("key")
                            .unwrap_or_default();
                        let payload: Vec<u8> =
                            entry.get::<Vec<u8>>("payload").unwrap_or_default();
                        let codec: Vec<u8> =
                            entry.get::<Vec<u8>>("codec").unwrap_or_else(|| vec![0]);
                        let key_id: Option<String> = entry.get::<String>("key_id");
                        let record = Record {
                            topic: topic.clone(),
                            partition,
                            key,
                            codec_version: codec.first().copied().unwrap_or(0),
                            key_id,
                            payload,
                            offset: encode_offset(&entry.id),
                        };
                        if tx.send(record).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(LogStream { receiver: rx })
    }

    async fn partition_len(&self, topic: &str, partition: u32) -> Result<u64> {
        let mut conn = self.manager.clone();
        let len: u64 = conn
            .xlen(Self::stream_key(topic, partition))
            .await
            .map_err(|e| EngineError::transient(format!("redis xlen: {e}")))?;
        Ok(len)
    }
}
