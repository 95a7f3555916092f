//! Shared state for API handlers

use std::sync::Arc;
use std::time::Duration;

use crate::incident::IncidentManager;
use crate::liveness::Liveness;

#[derive(Clone)]
pub struct ApiState {
    pub liveness: Liveness,

    /// Silence after which a loop is reported as stalled
    pub stall_after: Duration,

    /// Source of notification delivery counters
    pub incidents: Option<Arc<IncidentManager>>,
}

impl ApiState {
    pub fn new(liveness: Liveness, stall_after: Duration) -> Self {
        Self {
            liveness,
            stall_after,
            incidents: None,
        }
    }

    pub fn with_incidents(mut self, incidents: Arc<IncidentManager>) -> Self {
        self.incidents = Some(incidents);
        self
    }
}
