//! Warehouse Projection Demo
//!
//! Seeds a small warehouse log with one sequence gap, then runs the
//! `Bin:All` and `SkuStock:All` shards until both have consumed the log.
//!
//! Runs in memory by default. Set `DATABASE_URL` to project into
//! `PostgreSQL` instead. Daemon settings are read from `FOLDLINE_*`
//! variables; the gap is skipped once it ages out of the safe zone.

use anyhow::{Context, Result};
use chrono::Utc;
use foldline_core::config::DaemonSettings;
use foldline_core::environment::SystemClock;
use foldline_core::event::{SerializedEvent, TenantId};
use foldline_core::event_log::{EventLog, EventSource};
use foldline_core::operation::{AppendEvents, PendingEvent};
use foldline_core::session::SessionFactory;
use foldline_core::storage::DocumentStorage;
use foldline_core::stream::StreamIdentity;
use foldline_postgres::{PostgresStore, append_events};
use foldline_projections::metrics::MetricsExporter;
use foldline_projections::{
    AggregationRuntime, ProjectionDaemon, ShardAgent, ShardCollaborators, SingleStreamSlicer,
};
use foldline_testing::{
    InMemoryDocumentStorage, InMemoryDocumentStore, InMemoryEventLog, InMemoryOutbox,
    InMemorySessionFactory, LogWriter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use warehouse_projection_demo::{
    BIN_DOCUMENT, Bin, BinProjection, SKU_DOCUMENT, SkuStock, SkuStockProjection, StockEvent,
    sku_slicer,
};

const BIN_SHARD: &str = "Bin:All";
const SKU_SHARD: &str = "SkuStock:All";
/// A sequence is burnt before the event at this position of the script.
const GAP_BEFORE: usize = 3;

/// Collaborators shared by both shards.
struct Backend {
    log: Arc<dyn EventLog>,
    source: Arc<dyn EventSource<StockEvent>>,
    sessions: Arc<dyn SessionFactory>,
    bins: Arc<dyn DocumentStorage<Bin>>,
    stock: Arc<dyn DocumentStorage<SkuStock>>,
}

fn script() -> Vec<(&'static str, StockEvent)> {
    let sku = |s: &str| s.to_string();
    vec![
        ("bin-a1", StockEvent::BinOpened { sku: sku("sku-apple") }),
        ("bin-a1", StockEvent::Received { sku: sku("sku-apple"), quantity: 12 }),
        ("bin-a2", StockEvent::BinOpened { sku: sku("sku-apple") }),
        ("bin-a2", StockEvent::Received { sku: sku("sku-apple"), quantity: 6 }),
        ("bin-a1", StockEvent::Picked { sku: sku("sku-apple"), quantity: 9 }),
        ("bin-b1", StockEvent::BinOpened { sku: sku("sku-pear") }),
        ("bin-b1", StockEvent::Received { sku: sku("sku-pear"), quantity: 20 }),
        (
            "bin-a2",
            StockEvent::Relabelled {
                from: sku("sku-apple"),
                to: sku("sku-pear"),
                quantity: 6,
            },
        ),
        ("bin-b1", StockEvent::Picked { sku: sku("sku-pear"), quantity: 4 }),
        ("bin-a2", StockEvent::BinRetired),
    ]
}

fn in_memory() -> Backend {
    let log = Arc::new(InMemoryEventLog::<StockEvent>::new());
    for (position, (bin, event)) in script().into_iter().enumerate() {
        if position == GAP_BEFORE {
            log.reserve_sequences(1);
        }
        log.append(StreamIdentity::key(bin), event);
    }

    let store = InMemoryDocumentStore::new();
    let sessions =
        InMemorySessionFactory::new(store.clone()).with_log(Arc::clone(&log) as Arc<dyn LogWriter>);

    Backend {
        log: Arc::clone(&log) as Arc<dyn EventLog>,
        source: log,
        sessions: Arc::new(sessions),
        bins: Arc::new(InMemoryDocumentStorage::<Bin>::new(BIN_DOCUMENT, store.clone())),
        stock: Arc::new(InMemoryDocumentStorage::<SkuStock>::new(SKU_DOCUMENT, store)),
    }
}

async fn postgres(database_url: &str) -> Result<Backend> {
    info!("Connecting to PostgreSQL...");
    let store = PostgresStore::connect(database_url).await?;
    store.migrate().await?;

    for (position, (bin, event)) in script().into_iter().enumerate() {
        if position == GAP_BEFORE {
            // What a rolled-back writer leaves behind.
            sqlx::query("SELECT nextval('foldline_event_sequence')")
                .execute(store.pool())
                .await?;
        }
        let append = AppendEvents {
            tenant_id: TenantId::default(),
            stream: StreamIdentity::key(bin),
            expected_version: None,
            events: vec![PendingEvent {
                id: Uuid::new_v4(),
                version: None,
                event: SerializedEvent::from_event(&event, None)?,
                timestamp: Utc::now(),
            }],
        };
        append_events(store.pool(), &append).await?;
    }

    Ok(Backend {
        log: Arc::new(store.event_log()),
        source: Arc::new(store.event_source::<StockEvent>()),
        sessions: Arc::new(store.sessions()),
        bins: Arc::new(store.documents::<Bin>(BIN_DOCUMENT)),
        stock: Arc::new(store.documents::<SkuStock>(SKU_DOCUMENT)),
    })
}

/// Poll the progression rows until every shard reached `target`.
async fn wait_for(log: &dyn EventLog, shards: &[&str], target: u64, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    for shard in shards {
        loop {
            let reached = log
                .load_progression(shard)
                .await?
                .is_some_and(|progress| progress.sequence >= target);
            if reached {
                info!(shard, target, "Shard caught up");
                break;
            }
            anyhow::ensure!(
                Instant::now() < deadline,
                "{shard} did not reach sequence {target} within {timeout:?}"
            );
            sleep(Duration::from_millis(100)).await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let mut exporter = MetricsExporter::new();
    exporter.install()?;

    let settings = DaemonSettings::from_env().context("invalid FOLDLINE_* settings")?;
    let backend = match std::env::var("DATABASE_URL") {
        Ok(url) => postgres(&url).await?,
        Err(_) => {
            info!("DATABASE_URL not set, projecting in memory");
            in_memory()
        }
    };

    let target = backend.log.highest_sequence().await?;
    info!(
        target,
        safe_zone = ?settings.safe_zone(),
        "Log seeded with a gap; it is skipped once it leaves the safe zone"
    );

    let outbox = InMemoryOutbox::new();
    let collaborators = ShardCollaborators {
        log: Arc::clone(&backend.log),
        source: Arc::clone(&backend.source),
        sessions: Arc::clone(&backend.sessions),
        clock: Arc::new(SystemClock),
        listeners: Vec::new(),
        outbox: Some(Arc::new(outbox.clone())),
    };

    let bins = AggregationRuntime::builder(
        BinProjection,
        Arc::clone(&backend.bins),
        SingleStreamSlicer::new(),
    )
    .cache_limit_per_tenant(100)
    .build()?;
    let stock = AggregationRuntime::builder(SkuStockProjection, Arc::clone(&backend.stock), sku_slicer())
        .build()?;

    let mut daemon = ProjectionDaemon::new();
    daemon.add(ShardAgent::new(BIN_SHARD, Arc::new(bins), collaborators.clone(), settings.clone()))?;
    daemon.add(ShardAgent::new(SKU_SHARD, Arc::new(stock), collaborators, settings.clone()))?;
    let running = daemon.start();

    let timeout = settings.safe_zone() + Duration::from_secs(10);
    let outcome = wait_for(backend.log.as_ref(), &[BIN_SHARD, SKU_SHARD], target, timeout).await;
    running.stop().await;
    outcome?;

    let tenant = TenantId::default();
    info!("");
    info!("Bins:");
    for id in ["bin-a1", "bin-a2", "bin-b1"] {
        match backend.bins.load(&tenant, &id.to_string()).await? {
            Some(bin) => info!(
                "  {} holds {} x {} (version {})",
                bin.id, bin.quantity, bin.sku, bin.version
            ),
            None => info!("  {id} retired"),
        }
    }

    info!("Stock per SKU:");
    let skus = ["sku-apple".to_string(), "sku-pear".to_string()];
    for stock in backend.stock.load_many(&tenant, &skus).await? {
        info!(
            "  {}: {} on hand, {} picked, {} relabels",
            stock.id, stock.on_hand, stock.picked, stock.relabels
        );
    }

    info!("Messages:");
    for message in outbox.published() {
        info!("  {} {}", message.message_type, message.body);
    }

    if let Some(rendered) = exporter.render() {
        tracing::debug!("Metrics:\n{rendered}");
    }
    Ok(())
}
