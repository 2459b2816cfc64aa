//! Neural Engine Server
//!
//! Wires every component together from one immutable configuration and
//! serves the control-plane API.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use neurascale_engine::auth::AuthRegistry;
use neurascale_engine::config::EngineConfig;
use neurascale_engine::ingest::{BatchStore, IngestionService};
use neurascale_engine::ledger::{HmacSigner, KmsSigner, LedgerStore, LedgerWriter, Signer};
use neurascale_engine::log::{DurableLog, MemoryLog, RedisLog};
use neurascale_engine::manager::DeviceManager;
use neurascale_engine::pipeline::{DerivedStore, ProcessingPipeline};
use neurascale_engine::server::{run_server, AppState};
use neurascale_engine::session::SessionStore;
use neurascale_engine::DataType;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,neurascale_engine=debug".into()),
        )
        .init();

    // Configuration is assembled once and never mutated
    let config = Arc::new(EngineConfig::from_env().context("configuration")?);
    let auth = Arc::new(AuthRegistry::from_env().context("auth configuration")?);

    // Stores; sqlite creates files but not parent directories
    std::fs::create_dir_all("data").ok();
    let sessions = SessionStore::connect(&config.storage.engine_db)
        .await
        .context("session store")?;
    let derived = DerivedStore::connect(&config.storage.engine_db)
        .await
        .context("derived store")?;
    let ledger_store = LedgerStore::connect(&config.storage.ledger_db)
        .await
        .context("ledger store")?;

    // Durable log: Redis Streams when configured, in-process otherwise
    let log: Arc<dyn DurableLog> = match &config.storage.redis_url {
        Some(url) => {
            info!("durable log: redis streams at {url}");
            Arc::new(RedisLog::connect(url).await.context("redis log")?)
        }
        None => {
            info!("durable log: in-process (single node)");
            Arc::new(MemoryLog::new())
        }
    };

    // Ledger writer, signed when a key is configured
    let signer: Option<Arc<dyn Signer>> = match (&config.ledger.signing_key_id, &config.ledger.kms_endpoint)
    {
        (Some(key_id), Some(endpoint)) => {
            info!(key_id, "ledger signing through KMS");
            Some(Arc::new(KmsSigner::new(endpoint, key_id)))
        }
        (Some(key_id), None) => {
            let secret = std::env::var("LEDGER_HMAC_SECRET")
                .context("LEDGER_SIGNING_KEY_ID set without LEDGER_KMS_ENDPOINT or LEDGER_HMAC_SECRET")?;
            info!(key_id, "ledger signing with local HMAC key");
            Some(Arc::new(HmacSigner::new(key_id, secret)))
        }
        _ => None,
    };
    let writer = LedgerWriter::spawn(
        ledger_store.clone(),
        signer,
        config.ledger.shard_count,
        config.ledger.append_timeout,
        config.ledger.root_interval,
    )
    .await
    .context("ledger writer")?;
    let ledger = writer.handle();

    // Services
    let ingestion = IngestionService::new(
        config.ingest.clone(),
        sessions.clone(),
        log.clone(),
        ledger.clone(),
    );
    let pipeline = ProcessingPipeline::new(
        config.pipeline.clone(),
        log.clone(),
        derived,
        ledger.clone(),
    );
    let _consumers = pipeline.spawn_consumers(config.ingest.partitions, &DataType::ALL);

    let manager = DeviceManager::new(
        config.devices.clone(),
        sessions.clone(),
        ingestion.clone(),
        ledger.clone(),
    );
    manager.start_background_loops().await;

    let state = AppState {
        config: config.clone(),
        auth,
        manager,
        ingestion,
        pipeline,
        ledger,
        ledger_store,
        sessions,
        batches: BatchStore::new(&config.ingest.batch_prefix),
    };

    // The writer's tasks live as long as the process
    std::mem::forget(writer);

    run_server(state).await
}
