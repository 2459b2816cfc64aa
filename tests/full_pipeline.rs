//! End-to-end pipeline scenarios: a synthetic session flowing through
//! ingestion, the durable log, windowing and the ledger.

use std::sync::Arc;
use std::time::Duration;

use neurascale_engine::chunk::{ChannelInfo, DataType, SampleChunk};
use neurascale_engine::config::{IngestConfig, PipelineConfig};
use neurascale_engine::device::{SyntheticConfig, SyntheticDriver};
use neurascale_engine::ingest::IngestionService;
use neurascale_engine::ledger::{EventType, LedgerIntent, LedgerStore, LedgerWriter};
use neurascale_engine::log::MemoryLog;
use neurascale_engine::pipeline::{DerivedStore, ProcessingPipeline};
use neurascale_engine::session::SessionStore;

struct Rig {
    sessions: SessionStore,
    ledger_store: LedgerStore,
    ingestion: Arc<IngestionService>,
    pipeline: Arc<ProcessingPipeline>,
    _writer: LedgerWriter,
    _consumers: Vec<tokio::task::JoinHandle<()>>,
}

async fn rig() -> Rig {
    let sessions = SessionStore::connect("sqlite::memory:").await.unwrap();
    let ledger_store = LedgerStore::connect("sqlite::memory:").await.unwrap();
    let writer = LedgerWriter::spawn(
        ledger_store.clone(),
        None,
        1,
        Duration::from_secs(5),
        Duration::from_secs(3600),
    )
    .await
    .unwrap();
    let log = Arc::new(MemoryLog::new());
    let config = IngestConfig::default();
    let partitions = config.partitions;
    let ingestion = IngestionService::new(config, sessions.clone(), log.clone(), writer.handle());
    let derived = DerivedStore::connect("sqlite::memory:").await.unwrap();
    let pipeline = ProcessingPipeline::new(
        PipelineConfig::default(),
        log,
        derived,
        writer.handle(),
    );
    let consumers = pipeline.spawn_consumers(partitions, &[DataType::Eeg]);
    Rig {
        sessions,
        ledger_store,
        ingestion,
        pipeline,
        _writer: writer,
        _consumers: consumers,
    }
}

/// A 1 kHz synthetic chunk with deterministic content
fn synthetic_chunk(session_id: &str, seq: u64, samples: usize) -> SampleChunk {
    let generator = SyntheticConfig {
        seed: 0x1234,
        sampling_rate_hz: 1000,
        ..SyntheticConfig::default()
    };
    let channels = 8;
    let start = seq * samples as u64;
    SampleChunk {
        session_id: session_id.to_string(),
        device_id: "synthetic-0".to_string(),
        data_type: DataType::Eeg,
        sampling_rate_hz: 1000,
        channels: (0..channels as u32)
            .map(|i| ChannelInfo::neural(i, format!("SYN{i}")))
            .collect(),
        samples: (0..channels)
            .map(|ch| SyntheticDriver::generate(&generator, ch, start, samples))
            .collect(),
        chunk_seq: seq,
        device_ts_ns: 1_700_000_000_000_000_000 + start as i64 * 1_000_000,
        ingest_ts_ns: 1_700_000_000_000_000_000 + start as i64 * 1_000_000 + 2_000_000,
    }
}

async fn wait_for_frames(rig: &Rig, session_id: &str, expected: u64) -> u64 {
    let mut frames = 0;
    for _ in 0..200 {
        frames = rig
            .pipeline
            .derived()
            .frame_count(session_id)
            .await
            .unwrap();
        if frames >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    frames
}

#[tokio::test]
async fn test_synthetic_session_full_pipeline() {
    let rig = rig().await;

    // A two-second session at 1 kHz in 50 ms chunks: 40 windows at W=50ms
    let session = rig.sessions.create("anon-s1", &[], None).await.unwrap();
    rig.ingestion
        .ledger_record(
            LedgerIntent::new(EventType::SessionCreated).session(&session.session_id),
        )
        .await
        .unwrap();

    for seq in 0..40 {
        let receipt = rig
            .ingestion
            .ingest_chunk(None, synthetic_chunk(&session.session_id, seq, 50))
            .await
            .unwrap();
        assert!(!receipt.duplicate);
    }

    let frames = wait_for_frames(&rig, &session.session_id, 40).await;
    assert_eq!(frames, 40, "expected exactly floor(D/W) feature frames");

    // Frames arrive in window order with contiguous 50 ms windows
    let frames = rig
        .pipeline
        .derived()
        .frames_for_session(&session.session_id)
        .await
        .unwrap();
    for pair in frames.windows(2) {
        assert_eq!(pair[1].window_start_ns - pair[0].window_start_ns, 50_000_000);
        assert_eq!(pair[0].window_end_ns, pair[1].window_start_ns);
    }
    for frame in &frames {
        assert_eq!(frame.channel_features.len(), 8);
    }

    // Ledger: one session_created, 40 data_ingested, 40 features_computed,
    // zero anomalies, and the chain verifies end to end
    let mut events = Vec::new();
    for _ in 0..200 {
        events = rig
            .ledger_store
            .events_for_session(&session.session_id)
            .await
            .unwrap();
        if events
            .iter()
            .filter(|e| e.event_type == EventType::FeaturesComputed)
            .count()
            >= 40
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let count = |t: EventType| events.iter().filter(|e| e.event_type == t).count();
    assert_eq!(count(EventType::SessionCreated), 1);
    assert_eq!(count(EventType::DataIngested), 40);
    assert_eq!(count(EventType::FeaturesComputed), 40);
    assert_eq!(count(EventType::AnomalyDetected), 0);

    let (tip, _) = rig.ledger_store.tip(0).await.unwrap().unwrap();
    let outcome = rig.ledger_store.verify(0, 0, tip, None).await.unwrap();
    assert!(outcome.is_ok(), "chain must verify: {outcome:?}");

    // Session counters moved through ingestion only
    let session = rig.sessions.get(&session.session_id).await.unwrap();
    assert_eq!(session.samples_seen, 40 * 50);
    assert!(session.quality_summary > 0.0);
}

#[tokio::test]
async fn test_purge_preserves_ledger_and_chain() {
    let rig = rig().await;

    let subject = "anon-purge";
    let session = rig.sessions.create(subject, &[], None).await.unwrap();
    for seq in 0..10 {
        rig.ingestion
            .ingest_chunk(None, synthetic_chunk(&session.session_id, seq, 50))
            .await
            .unwrap();
    }
    wait_for_frames(&rig, &session.session_id, 10).await;
    let events_before = rig
        .ledger_store
        .events_for_session(&session.session_id)
        .await
        .unwrap()
        .len();
    assert!(events_before > 0);

    // Purge the subject: raw/derived data disappears, the ledger appends
    let purged_frames = rig
        .pipeline
        .derived()
        .purge_session(&session.session_id)
        .await
        .unwrap();
    assert!(purged_frames > 0);
    rig.sessions.purge_subject(subject).await.unwrap();
    rig.ingestion
        .ledger_record(
            LedgerIntent::new(EventType::PurgeExecuted)
                .user(subject)
                .metadata(serde_json::json!({"scope": format!("user:{subject}")})),
        )
        .await
        .unwrap();

    assert!(rig.sessions.get(&session.session_id).await.is_err());
    assert_eq!(
        rig.pipeline
            .derived()
            .frame_count(&session.session_id)
            .await
            .unwrap(),
        0
    );

    // Every original event is still on the chain, plus the purge record
    let events_after = rig
        .ledger_store
        .events_for_session(&session.session_id)
        .await
        .unwrap()
        .len();
    assert_eq!(events_after, events_before);
    let purge_events = rig.ledger_store.events_for_user(subject).await.unwrap();
    assert!(purge_events
        .iter()
        .any(|e| e.event_type == EventType::PurgeExecuted));

    // And the chain still verifies
    let (tip, _) = rig.ledger_store.tip(0).await.unwrap().unwrap();
    assert!(rig
        .ledger_store
        .verify(0, 0, tip, None)
        .await
        .unwrap()
        .is_ok());
}

#[tokio::test]
async fn test_duplicate_replay_keeps_single_copy_downstream() {
    let rig = rig().await;
    let session = rig.sessions.create("anon-idem", &[], None).await.unwrap();

    for seq in 0..6 {
        rig.ingestion
            .ingest_chunk(None, synthetic_chunk(&session.session_id, seq, 50))
            .await
            .unwrap();
    }
    // Replay a subset; ingestion suppresses them before the log
    for seq in [1u64, 3, 5] {
        let receipt = rig
            .ingestion
            .ingest_chunk(None, synthetic_chunk(&session.session_id, seq, 50))
            .await
            .unwrap();
        assert!(receipt.duplicate);
    }

    let frames = wait_for_frames(&rig, &session.session_id, 6).await;
    assert_eq!(frames, 6);
    let session = rig.sessions.get(&session.session_id).await.unwrap();
    assert_eq!(session.samples_seen, 6 * 50);
}
