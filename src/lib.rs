pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod query;
pub mod server;
pub mod store;
pub mod workers;

use std::sync::Arc;

use tokio::sync::watch;

use config::AppConfig;
use metrics::{AggregatorSettings, EventRecorder, LifetimeStats, RecorderQueues, WindowAggregator};
use query::QueryService;
use store::{BlacklistCache, Persistence};

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    pub config: AppConfig,

    /// Proxy core → engine entry point; never blocks.
    pub recorder: EventRecorder,

    /// Rolling in-memory buckets; the aggregator worker writes, everyone else reads.
    pub aggregator: Arc<WindowAggregator>,

    /// Process-lifetime totals for the dashboard card.
    pub lifetime: LifetimeStats,

    /// SQLite store, or the reason there is none.
    pub persistence: Arc<Persistence>,

    pub query: QueryService,

    pub blacklist: BlacklistCache,

    /// Flipped to `true` once shutdown starts; long-lived streams end on it.
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Build the engine from config. The returned queues must be handed to
    /// [`workers::Workers::spawn`] or recorded events go nowhere.
    pub fn new(config: AppConfig) -> (Arc<Self>, RecorderQueues) {
        let persistence = Arc::new(Persistence::from_config(&config.metrics_storage));
        let aggregator = Arc::new(WindowAggregator::new(AggregatorSettings::from(&config.metrics)));
        workers::warm_start(&aggregator, &persistence, metrics::now_ms());
        let (recorder, queues) =
            EventRecorder::new(config.metrics.queue_capacity, persistence.is_ready());
        let query = QueryService::new(
            aggregator.clone(),
            persistence.clone(),
            config.metrics.query_timeout(),
            config.metrics.max_series_points,
        );

        let state = Arc::new(Self {
            config,
            recorder,
            aggregator,
            lifetime: LifetimeStats::new(),
            persistence,
            query,
            blacklist: BlacklistCache::new(),
            shutdown: watch::Sender::new(false),
        });
        (state, queues)
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
