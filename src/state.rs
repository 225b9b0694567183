use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::gateway::{self, PaymentGateway};
use crate::models::booking::Booking;
use crate::models::payment::Payment;
use crate::models::rating::Rating;
use crate::models::vehicle::Vehicle;
use crate::notify::{BroadcastNotifier, Notification, Notifier};
use crate::observability::metrics::Metrics;
use crate::routing::Estimator;

pub struct AppState {
    pub bookings: DashMap<Uuid, Booking>,
    pub payments: DashMap<Uuid, Payment>,
    /// Gateway checkout reference -> payment id, for callbacks.
    pub checkout_index: DashMap<String, Uuid>,
    /// Keyed by `(booking_id, rater_id)`; the key is the uniqueness constraint.
    pub ratings: DashMap<(Uuid, Uuid), Rating>,
    pub vehicles: DashMap<Uuid, Vehicle>,
    pub estimator: Estimator,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub events_tx: broadcast::Sender<Notification>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        estimator: Estimator,
        gateway: Arc<dyn PaymentGateway>,
        event_buffer_size: usize,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        Self {
            bookings: DashMap::new(),
            payments: DashMap::new(),
            checkout_index: DashMap::new(),
            ratings: DashMap::new(),
            vehicles: DashMap::new(),
            estimator,
            gateway,
            notifier: Arc::new(BroadcastNotifier::new(events_tx.clone())),
            events_tx,
            metrics: Metrics::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let estimator = Estimator::from_config(&config.routing)?;
        let gateway = gateway::from_config(&config.gateway)?;

        Ok(Self::new(estimator, gateway, config.event_buffer_size))
    }

    /// Replaces the default in-process notifier, e.g. with an external
    /// dispatcher client.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}
