//! Background workers: outbox relay, commit-intent settler, in-process event
//! consumer and the periodic expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::PublisherConfig;
use crate::errors::ServiceError;
use crate::events::consumer::OrderEventConsumer;
use crate::events::publisher::Delivery;
use crate::events::{InMemoryPublisher, OutboxRelay, Publisher, RedisPublisher};
use crate::services::{
    CheckoutSessionManager, CommitIntentSettler, IdempotencyLedger, InventoryReservationManager,
};
use crate::AppState;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Publisher selected by configuration. Only the in-memory backend exposes a
/// local bus the consumer can subscribe to.
#[derive(Clone)]
pub struct EventBus {
    pub publisher: Arc<dyn Publisher>,
    local: Option<Arc<InMemoryPublisher>>,
}

impl EventBus {
    pub fn in_memory(capacity: usize) -> Self {
        let local = Arc::new(InMemoryPublisher::new(capacity));
        Self {
            publisher: local.clone(),
            local: Some(local),
        }
    }

    pub async fn from_config(config: &PublisherConfig) -> Result<Self, ServiceError> {
        match config.backend.to_ascii_lowercase().as_str() {
            "redis" => {
                let redis = RedisPublisher::connect(config).await?;
                info!(prefix = %config.channel_prefix, "publishing outbox events to redis");
                Ok(Self {
                    publisher: Arc::new(redis),
                    local: None,
                })
            }
            _ => {
                info!("publishing outbox events on the in-memory bus");
                Ok(Self::in_memory(1024))
            }
        }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<Delivery>> {
        self.local.as_ref().map(|bus| bus.subscribe())
    }
}

/// What one expiry sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub sessions_expired: u64,
    pub reservations_expired: u64,
    pub keys_purged: u64,
}

/// Deactivates expired sessions, drops stale reservations and purges
/// idempotency records past their TTL.
#[derive(Clone)]
pub struct MaintenanceSweep {
    sessions: Arc<CheckoutSessionManager>,
    reservations: InventoryReservationManager,
    ledger: IdempotencyLedger,
}

impl MaintenanceSweep {
    pub fn new(
        sessions: Arc<CheckoutSessionManager>,
        reservations: InventoryReservationManager,
        ledger: IdempotencyLedger,
    ) -> Self {
        Self {
            sessions,
            reservations,
            ledger,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, ServiceError> {
        let sessions_expired = self.sessions.expire_sessions(now).await?;
        let reservations_expired = self.reservations.expire_stale(now).await?;
        let keys_purged = self.ledger.purge_expired(now).await?;
        let report = MaintenanceReport {
            sessions_expired,
            reservations_expired,
            keys_purged,
        };
        if report != MaintenanceReport::default() {
            info!(
                sessions_expired,
                reservations_expired, keys_purged, "expiry sweep completed"
            );
        }
        Ok(report)
    }

    pub async fn run(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once(Utc::now()).await {
                        error!(error = %err, "expiry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Running worker tasks sharing one shutdown flag.
pub struct WorkerSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerSet {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every worker and waits for each to finish its current cycle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.handles {
            if let Err(err) = handle.await {
                warn!(worker = name, error = %err, "worker task ended abnormally");
            }
        }
        info!("background workers stopped");
    }
}

/// Spawns every background worker. `settlement_rx` is the receiving half of
/// the signal channel whose sender was handed to [`AppState`].
pub fn spawn_all(state: &AppState, bus: &EventBus, settlement_rx: mpsc::Receiver<i64>) -> WorkerSet {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let relay = OutboxRelay::new(
        state.db.clone(),
        bus.publisher.clone(),
        state.config.outbox.clone(),
    );
    handles.push(("outbox_relay", tokio::spawn(relay.run(shutdown_rx.clone()))));

    let reservations = InventoryReservationManager::new(state.db.clone());
    let settler = CommitIntentSettler::new(
        state.db.clone(),
        reservations.clone(),
        state.config.settler.clone(),
    );
    handles.push((
        "commit_intent_settler",
        tokio::spawn(settler.run(settlement_rx, shutdown_rx.clone())),
    ));

    if let Some(deliveries) = bus.subscribe() {
        let consumer = OrderEventConsumer::new(state.db.clone());
        handles.push((
            "order_event_consumer",
            tokio::spawn(consumer.run(deliveries, shutdown_rx.clone())),
        ));
    }

    let sweep = MaintenanceSweep::new(
        state.services.checkout.clone(),
        reservations,
        IdempotencyLedger::new(state.db.clone(), state.config.checkout.idempotency_ttl()),
    );
    handles.push((
        "expiry_sweep",
        tokio::spawn(sweep.run(MAINTENANCE_INTERVAL, shutdown_rx)),
    ));

    info!(workers = handles.len(), "background workers started");
    WorkerSet { shutdown, handles }
}
