use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::config::Config;
use crate::engine::assignment::Dispatcher;
use crate::engine::queue::{DispatchJob, DispatchQueue};
use crate::error::AppError;
use crate::observability::metrics::Metrics;
use crate::payments::PaymentEvents;
use crate::store::{CourierStore, MemoryStore, OrderStore, PaymentStore, SqliteStore};

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub payments: PaymentEvents,
    pub metrics: Metrics,
    pub backend: &'static str,
    pub auto_assign_timeout: Duration,
}

impl AppState {
    pub fn new(
        config: &Config,
        backend: &'static str,
        orders: Arc<dyn OrderStore>,
        users: Arc<dyn CourierStore>,
        payments: Arc<dyn PaymentStore>,
    ) -> (Self, mpsc::Receiver<DispatchJob>) {
        let metrics = Metrics::new();
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);
        let (queue, job_rx) = DispatchQueue::new(config.dispatch_queue_size, metrics.clone());

        let dispatcher = Dispatcher::new(orders.clone(), users, config, events_tx, metrics.clone());
        let payments = PaymentEvents::new(orders, payments, queue, config.db_timeout, metrics.clone());

        (
            Self {
                dispatcher: Arc::new(dispatcher),
                payments,
                metrics,
                backend,
                auto_assign_timeout: config.auto_assign_timeout,
            },
            job_rx,
        )
    }

    pub fn in_memory(config: &Config) -> (Self, mpsc::Receiver<DispatchJob>) {
        let store = Arc::new(MemoryStore::new());
        Self::new(config, "memory", store.clone(), store.clone(), store)
    }

    /// Picks the backend from `DATABASE_URL`: sqlite when set, process memory otherwise.
    pub async fn from_config(config: &Config) -> Result<(Self, mpsc::Receiver<DispatchJob>), AppError> {
        match &config.database_url {
            Some(url) => {
                let store = Arc::new(SqliteStore::connect(url, config.db_max_connections).await?);
                info!(max_connections = config.db_max_connections, "sqlite store ready");
                Ok(Self::new(config, "sqlite", store.clone(), store.clone(), store))
            }
            None => {
                info!("DATABASE_URL not set; using in-memory store");
                Ok(Self::in_memory(config))
            }
        }
    }
}
