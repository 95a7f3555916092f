use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use grove_monitor::{
    actors::{
        AggregatorHandle, CollectorHandle, CollectorSettings, EvaluatorHandle, Rollup,
        RollupHandle, RollupSettings, SampleEvent,
    },
    aggregate::Aggregator,
    cache::MemoryCache,
    config::{Config, StorageConfig, read_config_file},
    evaluation::StoreThresholdSource,
    incident::{IncidentManager, IncidentSettings},
    liveness::Liveness,
    notify::WebhookNotifier,
    probes::{HealthProbe, Probe, ServiceMetricsProbe, StorageStatsProbe},
    storage::{MemoryBackend, SampleStore, with_timeout},
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Log at trace level instead of info
    #[arg(long)]
    verbose: bool,
}

fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    let filter = filter::Targets::new().with_targets(vec![
        ("grove_monitor", level),
        ("tower_http", LevelFilter::DEBUG.min(level)),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let mut config = read_config_file(&args.file)?;
    config.apply_env();
    config.validate()?;
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let store = open_store(&config).await?;
    seed_thresholds(&config, store.as_ref()).await?;

    let cache = Arc::new(MemoryCache::new());
    let liveness = Liveness::new();
    let thresholds = Arc::new(StoreThresholdSource::new(store.clone()));
    let store_timeout = config.collection.store_timeout();

    let notifier = Arc::new(
        WebhookNotifier::new(Duration::from_secs(10)).context("failed to build webhook client")?,
    );
    let incidents = Arc::new(IncidentManager::new(
        store.clone(),
        cache.clone(),
        notifier,
        IncidentSettings {
            alerts_enabled: config.alerts.enabled,
            webhook_url: config.alerts.webhook_url.clone(),
            dashboard_url: config.alerts.dashboard_url.clone(),
            max_delivery_attempts: config.alerts.max_delivery_attempts,
            retry_backoff: Duration::from_millis(config.alerts.retry_backoff_ms),
            store_timeout,
        },
    ));
    if !config.alerts.enabled {
        warn!("alerts are disabled, incidents will be tracked without notifications");
    }

    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        cache.clone(),
        thresholds.clone(),
        config.service_names(),
        Duration::from_secs(config.aggregator.freshness_horizon_secs),
        store_timeout,
    ));

    // The cache starts empty; derive it from the store before serving anything
    match aggregator.rebuild(Utc::now()).await {
        Ok(snapshot) => info!(
            "rebuilt status cache: {} services, {} open incidents",
            snapshot.services.len(),
            snapshot.active_incidents.incidents.len()
        ),
        Err(e) => warn!("initial cache rebuild failed: {}", e),
    }

    let (sample_tx, _) = broadcast::channel::<SampleEvent>(1024);

    // Subscribe before any collector publishes
    let evaluator = EvaluatorHandle::spawn(
        thresholds,
        incidents.clone(),
        &sample_tx,
        Duration::from_secs(config.aggregator.evaluator_refresh_secs),
    );

    let collectors = spawn_collectors(&config, store.clone(), &sample_tx, &liveness)?;
    info!("started {} collectors", collectors.len());

    let aggregator = AggregatorHandle::spawn(
        aggregator,
        liveness.clone(),
        Duration::from_secs(config.aggregator.interval_secs),
    );

    let rollup = RollupHandle::spawn(Rollup::new(
        store.clone(),
        config.target_names(),
        sample_tx.clone(),
        RollupSettings {
            retention_days: config
                .storage
                .as_ref()
                .map(StorageConfig::retention_days)
                .unwrap_or(30),
            store_timeout,
            ..RollupSettings::default()
        },
    ));

    #[cfg(feature = "api")]
    if config.api.enabled {
        let state = grove_monitor::api::ApiState::new(
            liveness.clone(),
            Duration::from_secs(config.aggregator.stall_after_secs),
        )
        .with_incidents(incidents.clone());
        let addr = std::net::SocketAddr::new(config.api.addr, config.api.port);
        grove_monitor::api::spawn_api_server(addr, state).await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    for collector in &collectors {
        if let Err(e) = collector.shutdown().await {
            debug!("collector {} already stopped: {}", collector.collector_id, e);
        }
    }
    let _ = evaluator.shutdown().await;
    let _ = aggregator.shutdown().await;
    let _ = rollup.shutdown().await;

    incidents.shutdown().await;
    let counts = incidents.notification_counts();
    info!(
        "notifications: {} dispatched, {} delivered, {} failed, {} abandoned",
        counts.dispatched, counts.delivered, counts.failed, counts.abandoned
    );

    if let Err(e) = store.close().await {
        error!("failed to close store: {}", e);
    }

    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SampleStore>> {
    match config.storage.clone().unwrap_or_default() {
        StorageConfig::None => {
            info!("using in-memory storage, samples are lost on restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, .. } => {
            info!("using sqlite storage at {}", path.display());
            let backend = grove_monitor::storage::sqlite::SqliteBackend::new(&path)
                .await
                .with_context(|| format!("failed to open database {}", path.display()))?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            anyhow::bail!("sqlite storage configured but built without the storage-sqlite feature")
        }
    }
}

/// Populate an empty threshold table from the config
async fn seed_thresholds(config: &Config, store: &dyn SampleStore) -> anyhow::Result<()> {
    let timeout = config.collection.store_timeout();
    let existing = with_timeout(timeout, store.list_thresholds()).await?;
    if !existing.is_empty() {
        debug!("{} thresholds configured, not seeding", existing.len());
        return Ok(());
    }

    let rows = config.threshold_rows();
    let count = rows.len();
    for row in rows {
        with_timeout(timeout, store.insert_threshold(row)).await?;
    }
    info!("seeded {} thresholds", count);
    Ok(())
}

fn spawn_collectors(
    config: &Config,
    store: Arc<dyn SampleStore>,
    sample_tx: &broadcast::Sender<SampleEvent>,
    liveness: &Liveness,
) -> anyhow::Result<Vec<CollectorHandle>> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("grove-monitor/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let collection = &config.collection;
    let settings = |interval: Option<u64>, timeout: Option<u64>| CollectorSettings {
        interval: Duration::from_secs(interval.unwrap_or(collection.interval_secs).max(1)),
        probe_timeout: timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| collection.probe_timeout()),
        retry_backoff: Duration::from_millis(collection.retry_backoff_ms),
        store_timeout: collection.store_timeout(),
        ..CollectorSettings::default()
    };

    let mut probes: Vec<(Arc<dyn Probe>, CollectorSettings)> = Vec::new();

    for service in &config.services {
        let health = HealthProbe::new(client.clone(), service)
            .with_context(|| format!("invalid body_pattern for service '{}'", service.name))?;
        probes.push((Arc::new(health), settings(service.interval, service.timeout)));

        if let Some(url) = &service.metrics_url {
            let interval = settings(service.interval, service.timeout).interval;
            let probe = ServiceMetricsProbe::new(client.clone(), &service.name, url, interval);
            probes.push((Arc::new(probe), settings(service.interval, service.timeout)));
        }
    }
    for database in &config.databases {
        let probe = StorageStatsProbe::database(client.clone(), database);
        probes.push((Arc::new(probe), settings(database.interval, None)));
    }
    for bucket in &config.buckets {
        let probe = StorageStatsProbe::bucket(client.clone(), bucket);
        probes.push((Arc::new(probe), settings(bucket.interval, None)));
    }
    for namespace in &config.kv_namespaces {
        let probe = StorageStatsProbe::kv_namespace(client.clone(), namespace);
        probes.push((Arc::new(probe), settings(namespace.interval, None)));
    }

    Ok(probes
        .into_iter()
        .map(|(probe, settings)| {
            CollectorHandle::spawn(
                probe,
                store.clone(),
                sample_tx.clone(),
                liveness.clone(),
                settings,
            )
        })
        .collect())
}
