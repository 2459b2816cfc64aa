//! Batch Upload
//!
//! The slow path: a caller uploads a file of encoded chunks, the file is
//! preserved under the object-store prefix, a `batch_uploaded` ledger
//! event is recorded and a background job replays the file chunk by
//! chunk through the normal ingestion contract. A rejected batch stays
//! on disk for adjudication.
//!
//! Batch file format: repeated `u32 LE frame length | frame bytes`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::ingest::IngestionService;
use crate::ledger::{EventType, LedgerIntent};

/// Receipt for an accepted batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchUpload {
    pub batch_id: String,
    pub path: PathBuf,
    pub ledger_event_id: String,
}

/// Outcome of replaying one batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReplayReport {
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
}

/// Filesystem-backed object store for uploaded batches
#[derive(Clone)]
pub struct BatchStore {
    prefix: PathBuf,
}

impl BatchStore {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Persist an uploaded batch and record it in the ledger
    pub async fn store(
        &self,
        service: &IngestionService,
        user_anon: Option<&str>,
        bytes: &[u8],
    ) -> Result<BatchUpload> {
        let batch_id = Uuid::now_v7().to_string();
        let path = self.prefix.join(format!("{batch_id}.batch"));
        tokio::fs::create_dir_all(&self.prefix)
            .await
            .map_err(|e| EngineError::transient(format!("batch dir: {e}")))?;
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| EngineError::transient(format!("batch create: {e}")))?;
        file.write_all(bytes)
            .await
            .map_err(|e| EngineError::transient(format!("batch write: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::transient(format!("batch sync: {e}")))?;

        let mut intent = LedgerIntent::new(EventType::BatchUploaded).metadata(serde_json::json!({
            "batch_id": batch_id,
            "bytes": bytes.len(),
        }));
        if let Some(anon) = user_anon {
            intent = intent.user(anon);
        }
        let event = service.ledger_record(intent).await?;

        info!(batch_id, bytes = bytes.len(), "batch stored");
        Ok(BatchUpload {
            batch_id,
            path,
            ledger_event_id: event.event_id.to_string(),
        })
    }

    /// Replay a stored batch through the normal ingestion path. Each
    /// rejection yields an `anomaly_detected` event; the file is kept
    /// either way.
    pub async fn replay(
        &self,
        service: Arc<IngestionService>,
        batch_path: &Path,
        user_id: Option<&str>,
    ) -> Result<BatchReplayReport> {
        let bytes = tokio::fs::read(batch_path)
            .await
            .map_err(|e| EngineError::validation(format!("batch read: {e}")))?;

        let mut report = BatchReplayReport::default();
        for frame in split_frames(&bytes)? {
            match service.ingest_frame(user_id, frame).await {
                Ok(receipt) if receipt.duplicate => report.duplicates += 1,
                Ok(_) => report.accepted += 1,
                Err(e) => {
                    report.rejected += 1;
                    warn!("batch chunk rejected: {e}");
                    let intent = LedgerIntent::new(EventType::AnomalyDetected).metadata(
                        serde_json::json!({
                            "reason": "batch_chunk_rejected",
                            "batch_path": batch_path.display().to_string(),
                            "code": e.code(),
                        }),
                    );
                    if let Err(e) = service.ledger_record_nowait(intent).await {
                        warn!("failed to record batch rejection: {e}");
                    }
                }
            }
        }
        Ok(report)
    }
}

/// Split a batch file into its length-prefixed frames
pub fn split_frames(bytes: &[u8]) -> Result<Vec<&[u8]>> {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        if pos + 4 > bytes.len() {
            return Err(EngineError::validation(format!(
                "batch truncated at offset {pos}"
            )));
        }
        let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > bytes.len() {
            return Err(EngineError::validation(format!(
                "batch frame at offset {pos} overruns the file"
            )));
        }
        frames.push(&bytes[pos..pos + len]);
        pos += len;
    }
    Ok(frames)
}

/// Assemble frames into the batch file format
pub fn join_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frames = vec![vec![1u8, 2, 3], vec![], vec![9u8; 100]];
        let joined = join_frames(&frames);
        let split = split_frames(&joined).unwrap();
        assert_eq!(split.len(), 3);
        assert_eq!(split[0], &[1, 2, 3]);
        assert!(split[1].is_empty());
        assert_eq!(split[2].len(), 100);
    }

    #[test]
    fn test_truncated_batch_rejected() {
        let mut joined = join_frames(&[vec![1u8; 10]]);
        joined.truncate(joined.len() - 3);
        assert!(split_frames(&joined).is_err());
    }

    #[test]
    fn test_garbage_length_rejected() {
        let bytes = [0xFF, 0xFF, 0xFF, 0x7F, 0x01];
        assert!(split_frames(&bytes).is_err());
    }

    #[test]
    fn test_empty_batch_is_empty() {
        assert!(split_frames(&[]).unwrap().is_empty());
    }
}
