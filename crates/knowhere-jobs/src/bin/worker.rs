//! `knowhere-worker`: runs the knowledge pipeline against PostgreSQL, Redis
//! and an OpenAI-compatible endpoint until interrupted.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use knowhere_core::{defaults, EventBus};
use knowhere_crypto::AesContentCipher;
use knowhere_db::{Database, PoolConfig, RedisLockStore};
use knowhere_inference::OpenAIBackend;
use knowhere_jobs::{KnowledgeProcess, PipelineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "knowhere_jobs=info,knowhere_db=info,knowhere_inference=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("knowhere-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let config = PipelineConfig::from_env();
    let pool_config =
        PoolConfig::for_pipeline(config.concurrency, config.usage_workers).with_env_overrides();
    let db = Database::connect_with_config(&database_url, pool_config).await?;
    db.migrate().await?;

    let locks = RedisLockStore::from_env().await?;
    let cipher = AesContentCipher::from_env()?;
    let backend = Arc::new(OpenAIBackend::from_env()?);
    let events = EventBus::new(defaults::EVENT_BUS_CAPACITY);

    let process = KnowledgeProcess::builder()
        .store(Arc::new(db.knowledge.clone()))
        .usage_repository(Arc::new(db.usage.clone()))
        .cipher(Arc::new(cipher))
        .summarizer(backend.clone())
        .embedder(backend)
        .locks(Arc::new(locks))
        .publisher(Arc::new(events))
        .config(config)
        .build()?;

    process.start().await;
    knowhere_db::log_pool_metrics(db.pool());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    process.shutdown().await;

    Ok(())
}
