//! Incident lifecycle
//!
//! Every incident is keyed by `(service_name, title)`, where the title is
//! derived from the metric type alone. Per key the lifecycle is
//!
//! ```text
//! Absent ──candidate──▶ Open ──acknowledge──▶ Acknowledged
//!                        │                        │
//!                        └────────cleared─────────┴──▶ Resolved (terminal)
//! ```
//!
//! A later breach after resolution opens a new incident with a new id.
//!
//! Transitions for one key are serialized through a lock taken from a keyed
//! lock map, so concurrent candidates for the same key coalesce into one
//! incident while unrelated keys proceed in parallel. The store's unique
//! open-incident rule backs this up across processes.
//!
//! Notifications go out on spawned tasks with bounded retries. A transition
//! commits and returns before delivery is attempted, and pending retries are
//! abandoned on shutdown.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{ActiveIncidents, CacheKey, StatusCache, put_entry};
use crate::evaluation::{AlertCandidate, Evaluation};
use crate::metrics;
use crate::notify::{AlertWebhookPayload, Notifier, NotifyError};
use crate::storage::{
    Incident, IncidentId, NewIncident, SampleStore, StorageError, with_timeout,
};
use crate::util::backoff_delay;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IncidentKey {
    pub service_name: String,
    pub title: String,
}

impl IncidentKey {
    pub fn for_metric(service_name: &str, metric_type: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            title: metrics::incident_title(metric_type),
        }
    }
}

impl fmt::Display for IncidentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.service_name, self.title)
    }
}

/// Outcome of handing one evaluation to the manager
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Absent → Open, one notification dispatched
    Opened(Incident),

    /// Candidate folded into the open incident; `escalated` when its
    /// severity was raised
    Coalesced { incident: Incident, escalated: bool },

    /// Open/Acknowledged → Resolved
    Resolved(Incident),

    /// Nothing to do (cleared without an open incident, or not configured)
    Noop,
}

#[derive(Debug)]
pub enum IncidentError {
    Store(StorageError),
    UnknownIncident(IncidentId),
    AlreadyResolved(IncidentId),
}

impl fmt::Display for IncidentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncidentError::Store(e) => write!(f, "incident store error: {}", e),
            IncidentError::UnknownIncident(id) => write!(f, "incident {} does not exist", id),
            IncidentError::AlreadyResolved(id) => write!(f, "incident {} is already resolved", id),
        }
    }
}

impl std::error::Error for IncidentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IncidentError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for IncidentError {
    fn from(err: StorageError) -> Self {
        IncidentError::Store(err)
    }
}

pub type IncidentResult<T> = Result<T, IncidentError>;

#[derive(Debug, Clone)]
pub struct IncidentSettings {
    /// When false incidents still open and resolve, nothing is sent
    pub alerts_enabled: bool,

    /// Used when the matching threshold has no webhook of its own
    pub webhook_url: Option<String>,

    pub dashboard_url: String,
    pub max_delivery_attempts: u32,

    /// Delay before the second attempt, doubled for each one after
    pub retry_backoff: Duration,

    /// Bound on every store call made while holding a key lock
    pub store_timeout: Duration,
}

impl Default for IncidentSettings {
    fn default() -> Self {
        Self {
            alerts_enabled: true,
            webhook_url: None,
            dashboard_url: "http://localhost:8080".to_string(),
            max_delivery_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct NotificationStats {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NotificationCounts {
    pub dispatched: u64,
    pub delivered: u64,
    pub failed: u64,
    pub abandoned: u64,
}

impl NotificationStats {
    pub fn snapshot(&self) -> NotificationCounts {
        NotificationCounts {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

pub struct IncidentManager {
    store: Arc<dyn SampleStore>,
    cache: Arc<dyn StatusCache>,
    notifier: Arc<dyn Notifier>,
    settings: IncidentSettings,
    locks: DashMap<IncidentKey, Arc<Mutex<()>>>,

    /// Held across one read-then-write of the active set
    publish_lock: Mutex<()>,
    stats: Arc<NotificationStats>,
    deliveries: TaskTracker,
    shutdown: CancellationToken,
}

impl IncidentManager {
    pub fn new(
        store: Arc<dyn SampleStore>,
        cache: Arc<dyn StatusCache>,
        notifier: Arc<dyn Notifier>,
        settings: IncidentSettings,
    ) -> Self {
        Self {
            store,
            cache,
            notifier,
            settings,
            locks: DashMap::new(),
            publish_lock: Mutex::new(()),
            stats: Arc::new(NotificationStats::default()),
            deliveries: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn notification_counts(&self) -> NotificationCounts {
        self.stats.snapshot()
    }

    fn lock_for(&self, key: &IncidentKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply one evaluator outcome
    pub async fn handle(&self, evaluation: Evaluation) -> IncidentResult<Transition> {
        match evaluation {
            Evaluation::Matched(candidate) => self.handle_candidate(candidate).await,
            Evaluation::Cleared {
                service_name,
                metric_type,
                ..
            } => self.handle_cleared(&service_name, &metric_type).await,
            Evaluation::NotConfigured => Ok(Transition::Noop),
        }
    }

    #[instrument(skip(self, candidate), fields(service = %candidate.service_name, metric = %candidate.metric_type, severity = %candidate.severity))]
    pub async fn handle_candidate(&self, candidate: AlertCandidate) -> IncidentResult<Transition> {
        let key = IncidentKey::for_metric(&candidate.service_name, &candidate.metric_type);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let timeout = self.settings.store_timeout;
        let open = with_timeout(
            timeout,
            self.store.find_open_incident(&key.service_name, &key.title),
        )
        .await?;

        if let Some(incident) = open {
            return self.coalesce(incident, &candidate).await;
        }

        let new_incident = NewIncident {
            service_name: key.service_name.clone(),
            metric_type: candidate.metric_type.clone(),
            severity: candidate.severity,
            title: key.title.clone(),
            description: Some(candidate.describe()),
            triggered_at: Utc::now(),
            last_value: Some(candidate.current_value),
        };

        let incident = match with_timeout(timeout, self.store.insert_incident(new_incident)).await {
            Ok(incident) => incident,
            Err(StorageError::Conflict(_)) => {
                // Opened by another writer sharing the store
                let Some(existing) = with_timeout(
                    timeout,
                    self.store.find_open_incident(&key.service_name, &key.title),
                )
                .await?
                else {
                    return Err(IncidentError::Store(StorageError::Conflict(key.to_string())));
                };
                return self.coalesce(existing, &candidate).await;
            }
            Err(e) => return Err(e.into()),
        };

        info!(incident_id = incident.id, "incident opened: {}", key);

        self.publish_active().await;
        self.dispatch(&incident, &candidate);

        Ok(Transition::Opened(incident))
    }

    async fn coalesce(
        &self,
        mut incident: Incident,
        candidate: &AlertCandidate,
    ) -> IncidentResult<Transition> {
        let escalated = candidate.severity > incident.severity;
        if escalated {
            info!(
                incident_id = incident.id,
                "escalating incident from {} to {}", incident.severity, candidate.severity
            );
            incident.severity = candidate.severity;
            incident.description = Some(candidate.describe());
        }
        incident.last_value = Some(candidate.current_value);

        with_timeout(self.settings.store_timeout, self.store.update_incident(&incident)).await?;
        debug!(incident_id = incident.id, "candidate coalesced");

        if escalated {
            self.publish_active().await;
        }

        Ok(Transition::Coalesced { incident, escalated })
    }

    #[instrument(skip(self))]
    pub async fn handle_cleared(
        &self,
        service_name: &str,
        metric_type: &str,
    ) -> IncidentResult<Transition> {
        let key = IncidentKey::for_metric(service_name, metric_type);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let timeout = self.settings.store_timeout;
        let Some(mut incident) = with_timeout(
            timeout,
            self.store.find_open_incident(&key.service_name, &key.title),
        )
        .await?
        else {
            return Ok(Transition::Noop);
        };

        incident.resolved_at = Some(Utc::now().max(incident.triggered_at));
        with_timeout(timeout, self.store.update_incident(&incident)).await?;

        info!(incident_id = incident.id, "incident resolved: {}", key);
        self.publish_active().await;

        Ok(Transition::Resolved(incident))
    }

    /// Record who is handling an open incident
    ///
    /// Acknowledged incidents stay in the active set and keep coalescing.
    #[instrument(skip(self))]
    pub async fn acknowledge(&self, id: IncidentId, by: &str) -> IncidentResult<Incident> {
        let timeout = self.settings.store_timeout;
        let Some(incident) = with_timeout(timeout, self.store.get_incident(id)).await? else {
            return Err(IncidentError::UnknownIncident(id));
        };

        let key = IncidentKey {
            service_name: incident.service_name.clone(),
            title: incident.title.clone(),
        };
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        // Re-read under the lock, a transition may have landed in between
        let Some(mut incident) = with_timeout(timeout, self.store.get_incident(id)).await? else {
            return Err(IncidentError::UnknownIncident(id));
        };
        if !incident.is_open() {
            return Err(IncidentError::AlreadyResolved(id));
        }

        incident.acknowledged_by = Some(by.to_string());
        with_timeout(timeout, self.store.update_incident(&incident)).await?;

        info!("incident {} acknowledged by {}", id, by);
        Ok(incident)
    }

    /// Rewrite the active incident set from the store
    ///
    /// Publishes are serialized so a slow writer can never overwrite a newer
    /// set with an older read. Failures are logged; the aggregator rewrites
    /// the set every cycle.
    pub async fn publish_active(&self) {
        let _publishing = self.publish_lock.lock().await;
        let open = match with_timeout(
            self.settings.store_timeout,
            self.store.list_open_incidents(),
        )
        .await
        {
            Ok(open) => open,
            Err(e) => {
                warn!("could not list open incidents: {}", e);
                return;
            }
        };

        let active = ActiveIncidents::from_open(&open);
        if let Err(e) = put_entry(self.cache.as_ref(), &CacheKey::ActiveIncidents, &active).await {
            warn!("failed to publish active incidents: {}", e);
        }
    }

    fn dispatch(&self, incident: &Incident, candidate: &AlertCandidate) {
        if !self.settings.alerts_enabled {
            debug!(incident_id = incident.id, "alerts disabled, not notifying");
            return;
        }

        let Some(url) = candidate
            .webhook_url
            .clone()
            .or_else(|| self.settings.webhook_url.clone())
        else {
            warn!(
                incident_id = incident.id,
                "alert delivery failed: {}",
                NotifyError::NoDestination
            );
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let payload = AlertWebhookPayload {
            kind: AlertWebhookPayload::KIND.to_string(),
            severity: incident.severity,
            service: incident.service_name.clone(),
            metric: candidate.metric_type.clone(),
            current_value: candidate.current_value,
            threshold: candidate.threshold_value,
            title: incident.title.clone(),
            description: incident.description.clone().unwrap_or_default(),
            timestamp: incident.triggered_at,
            dashboard_url: self.settings.dashboard_url.clone(),
        };

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        let delivery = Delivery {
            incident_id: incident.id,
            url,
            payload,
            notifier: Arc::clone(&self.notifier),
            stats: Arc::clone(&self.stats),
            max_attempts: self.settings.max_delivery_attempts.max(1),
            backoff: self.settings.retry_backoff,
            shutdown: self.shutdown.clone(),
        };
        self.deliveries.spawn(delivery.run());
    }

    /// Wait until every dispatched notification finished or gave up
    pub async fn settle(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }

    /// Abandon pending notification retries and wait for their tasks to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.deliveries.close();
        self.deliveries.wait().await;
    }
}

struct Delivery {
    incident_id: IncidentId,
    url: String,
    payload: AlertWebhookPayload,
    notifier: Arc<dyn Notifier>,
    stats: Arc<NotificationStats>,
    max_attempts: u32,
    backoff: Duration,
    shutdown: CancellationToken,
}

impl Delivery {
    async fn run(self) {
        for attempt in 1..=self.max_attempts {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.abandon();
                    return;
                }
                result = self.notifier.deliver(&self.url, &self.payload) => result,
            };

            match result {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    info!(incident_id = self.incident_id, attempt, "alert delivered");
                    return;
                }
                Err(e) if attempt < self.max_attempts && e.is_retryable() => {
                    let delay = backoff_delay(self.backoff, attempt);
                    warn!(
                        incident_id = self.incident_id,
                        attempt, "alert delivery attempt failed, retrying in {:?}: {}", delay, e
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            self.abandon();
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        incident_id = self.incident_id,
                        attempt, "alert delivery failed: {}", e
                    );
                    return;
                }
            }
        }
    }

    fn abandon(&self) {
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        debug!(incident_id = self.incident_id, "notification abandoned on shutdown");
    }
}
