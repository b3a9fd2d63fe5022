//! PSTPP server entry point.
//!
//! Loads configuration, wires every store behind its trait object, builds
//! the fixed pipeline stage graph, and starts the axum server. Mirrors the
//! teacher's `gateway::run_server` shape: a Postgres connection is optional
//! — when `database_url` is unreachable or unset, every store falls back to
//! its in-memory backend and the service still comes up, just without
//! cross-instance durability.
//!
//! Usage: `pstpp-server [config.yaml]` (defaults to `config.yaml` in the
//! current directory if the argument is omitted).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use pstpp::api::state::AppState;
use pstpp::backpressure::BackpressureController;
use pstpp::blotter_store::{BlotterStore, InMemoryBlotterStore, PostgresBlotterStore};
use pstpp::cache_lock::{CacheLock, InMemoryCacheLock, PostgresCacheLock};
use pstpp::commit_store::{CommitStore, InMemoryCommitStore, PostgresCommitStore};
use pstpp::config::AppConfig;
use pstpp::dispatcher::PartitionDispatcher;
use pstpp::idempotency_store::{IdempotencyRecordStore, IdempotencyStore, InMemoryIdempotencyRecords, PostgresIdempotencyRecords};
use pstpp::job_registry::{InMemoryJobRegistry, JobRegistry, PostgresJobRegistry};
use pstpp::partition_state_store::{InMemoryPartitionStateStore, PartitionStateStore, PostgresPartitionStateStore};
use pstpp::pipeline::stages::{
    CommitStage, DeepValidateStage, EnrichStage, PersistBlotterStage, PublishStage, QuickValidateStage, RulesStage, StateTransitionStage,
};
use pstpp::pipeline::{NoopEnrichmentClient, Pipeline, RuleSet};
use pstpp::publisher::websocket::ConnectionManager;
use pstpp::publisher::{NullPublisher, Publisher, WsPublisher};
use pstpp::schema;
use pstpp::sequence_buffer::SequenceBuffer;
use pstpp::webhook::WebhookDispatcher;

/// Durable backends pinned to the same `PgPool`, or the in-memory
/// equivalents when no database is reachable at startup.
struct Stores {
    cache: Arc<dyn CacheLock>,
    idempotency_records: Arc<dyn IdempotencyRecordStore>,
    partition_states: Arc<dyn PartitionStateStore>,
    blotters: Arc<dyn BlotterStore>,
    jobs: Arc<dyn JobRegistry>,
}

async fn connect_stores(config: &AppConfig) -> Stores {
    match sqlx::PgPool::connect(&config.database_url).await {
        Ok(pool) => {
            if let Err(err) = schema::ensure_schema(&pool).await {
                eprintln!("⚠️  schema bootstrap failed, falling back to in-memory stores: {err}");
                return in_memory_stores();
            }
            println!("🗄️  connected to Postgres, durable stores active");
            Stores {
                cache: Arc::new(PostgresCacheLock::new(pool.clone())),
                idempotency_records: Arc::new(PostgresIdempotencyRecords::new(pool.clone())),
                partition_states: Arc::new(PostgresPartitionStateStore::new(pool.clone())),
                blotters: Arc::new(PostgresBlotterStore::new(pool.clone())),
                jobs: Arc::new(PostgresJobRegistry::new(pool)),
            }
        }
        Err(err) => {
            eprintln!("⚠️  Postgres unavailable ({err}), falling back to in-memory stores");
            in_memory_stores()
        }
    }
}

fn in_memory_stores() -> Stores {
    Stores {
        cache: Arc::new(InMemoryCacheLock::new()),
        idempotency_records: Arc::new(InMemoryIdempotencyRecords::new()),
        partition_states: Arc::new(InMemoryPartitionStateStore::new()),
        blotters: Arc::new(InMemoryBlotterStore::new()),
        jobs: Arc::new(InMemoryJobRegistry::new()),
    }
}

/// `CommitStore` needs its own connection path (spec.md §5's lock-ordering
/// transaction), so it's assembled separately from the rest of `Stores`
/// rather than folded into `connect_stores`.
async fn build_commit_store(
    config: &AppConfig,
    partition_states: Arc<dyn PartitionStateStore>,
    idempotency: Arc<IdempotencyStore>,
) -> Arc<dyn CommitStore> {
    match sqlx::PgPool::connect(&config.database_url).await {
        Ok(pool) => Arc::new(PostgresCommitStore::new(pool)),
        Err(_) => Arc::new(InMemoryCommitStore::new(partition_states, idempotency)),
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("config.yaml");

    let config = match AppConfig::from_file(config_path) {
        Ok(config) => config,
        Err(err) if std::path::Path::new(config_path).exists() => {
            eprintln!("❌ FATAL: failed to parse {config_path}: {err}");
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("⚠️  {config_path} not found, starting with default configuration");
            AppConfig::default()
        }
    };

    let _log_guard = pstpp::logging::init_logging(&config);
    tracing::info!(bind_addr = %config.bind_addr, "starting pstpp-server");

    let stores = connect_stores(&config).await;
    let idempotency = Arc::new(IdempotencyStore::new(
        stores.cache.clone(),
        stores.idempotency_records,
        Duration::from_secs((config.idempotency.window_hours * 3600) as u64),
    ));
    let commit = build_commit_store(&config, stores.partition_states.clone(), idempotency.clone()).await;

    let ws_manager = Arc::new(ConnectionManager::new());
    let publisher: Arc<dyn Publisher> = Arc::new(WsPublisher::new(ws_manager.clone()));

    let pipeline = Arc::new(Pipeline::new(vec![
        Box::new(QuickValidateStage),
        Box::new(EnrichStage::new(Arc::new(NoopEnrichmentClient))),
        Box::new(RulesStage::new(Arc::new(RuleSet::empty("v1")))),
        Box::new(DeepValidateStage),
        Box::new(StateTransitionStage),
        Box::new(PersistBlotterStage::new(stores.blotters.clone())),
        Box::new(CommitStage::new(commit.clone())),
        Box::new(PublishStage::new(publisher)),
    ]));

    let webhooks = Arc::new(WebhookDispatcher::spawn(config.webhook.clone(), 4));
    let backpressure = Arc::new(BackpressureController::new(&config.backpressure));
    let sequence_buffer = Arc::new(SequenceBuffer::new());

    let dispatcher = PartitionDispatcher::new(
        stores.cache,
        idempotency,
        stores.partition_states,
        stores.blotters.clone(),
        commit,
        sequence_buffer.clone(),
        pipeline,
        stores.jobs.clone(),
        webhooks,
        backpressure.clone(),
        config.lock.clone(),
        config.sequence_buffer.clone(),
        config.dispatcher.clone(),
    );

    let state = Arc::new(AppState {
        dispatcher,
        blotters: stores.blotters,
        jobs: stores.jobs,
        backpressure,
        sequence_buffer,
        ws_manager,
        upload: config.upload.clone(),
        service_name: "pstpp".to_string(),
    });

    let app = pstpp::api::build_router(state);

    let listener = match TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("❌ FATAL: failed to bind {}: {err}", config.bind_addr);
            std::process::exit(1);
        }
    };

    println!("🚀 pstpp-server listening on http://{}", config.bind_addr);
    println!("📡 downstream publish: ws://{}/ws/trades", config.bind_addr);
    println!("📖 API docs: http://{}/docs", config.bind_addr);

    if let Err(err) = axum::serve(listener, app).await {
        eprintln!("❌ FATAL: server error: {err}");
        std::process::exit(2);
    }
}
