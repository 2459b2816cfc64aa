//! In-Process Log
//!
//! Per-partition append-only vectors with follow semantics. Subscribers
//! replay the backlog and then tail live appends through a broadcast
//! channel; a per-partition lock gives the total order the pipeline
//! relies on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::error::Result;
use crate::log::{DurableLog, LogStream, Record};

const LIVE_CHANNEL_CAPACITY: usize = 1024;

struct Partition {
    records: Vec<Record>,
    live: broadcast::Sender<Record>,
}

impl Partition {
    fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            records: Vec::new(),
            live,
        }
    }
}

/// Broker stand-in for tests and single-node deployments
#[derive(Clone)]
pub struct MemoryLog {
    partitions: Arc<Mutex<HashMap<(String, u32), Arc<Mutex<Partition>>>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            partitions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn partition(&self, topic: &str, partition: u32) -> Arc<Mutex<Partition>> {
        let mut map = self.partitions.lock().await;
        map.entry((topic.to_string(), partition))
            .or_insert_with(|| Arc::new(Mutex::new(Partition::new())))
            .clone()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn publish(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        codec_version: u8,
        key_id: Option<String>,
        payload: Vec<u8>,
    ) -> Result<u64> {
        let part = self.partition(topic, partition).await;
        let mut part = part.lock().await;
        let offset = part.records.len() as u64;
        let record = Record {
            topic: topic.to_string(),
            partition,
            key: key.to_string(),
            codec_version,
            key_id,
            payload,
            offset,
        };
        part.records.push(record.clone());
        // No subscribers is fine; the backlog serves later ones
        let _ = part.live.send(record);
        Ok(offset)
    }

    async fn subscribe(&self, topic: &str, partition: u32, from_offset: u64) -> Result<LogStream> {
        let part = self.partition(topic, partition).await;
        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            // Snapshot the backlog and attach to the live feed while the
            // partition is locked, so no append lands between the two.
            let (backlog, mut live) = {
                let part = part.lock().await;
                let backlog: Vec<Record> = part
                    .records
                    .iter()
                    .filter(|r| r.offset >= from_offset)
                    .cloned()
                    .collect();
                (backlog, part.live.subscribe())
            };

            let mut next_offset = from_offset;
            for record in backlog {
                next_offset = record.offset + 1;
                if tx.send(record).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(record) => {
                        // Skip anything already replayed from the backlog
                        if record.offset < next_offset {
                            continue;
                        }
                        next_offset = record.offset + 1;
                        if tx.send(record).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(LogStream { receiver: rx })
    }

    async fn partition_len(&self, topic: &str, partition: u32) -> Result<u64> {
        let part = self.partition(topic, partition).await;
        let part = part.lock().await;
        Ok(part.records.len() as u64)
    }
}
