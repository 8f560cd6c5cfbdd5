//! Call-budget tracking for the remote service.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use gharvest_adapters::{QuotaResource, RepoService, ServiceError};
use tracing::{debug, info, warn};

/// Below this the gate asks the quota endpoint instead of trusting its cache.
pub const LOW_WATER_MARK: u32 = 10;
/// Below this the gate reports [`Capacity::Stop`].
pub const HARD_FLOOR: u32 = 5;

/// Starting guess before any response has reported the real value:
/// (anonymous, authenticated) per window.
fn default_budget(resource: QuotaResource) -> (u32, u32) {
    match resource {
        QuotaResource::Core => (60, 5000),
        QuotaResource::Search => (10, 30),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Remaining(u32),
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
struct QuotaState {
    remaining: u32,
    reset_at: Option<DateTime<Utc>>,
}

/// Budget tracking for one [`QuotaResource`]. Search batches and enrichment
/// draw from different buckets, so each gets its own gate.
pub struct QuotaGate {
    service: Arc<dyn RepoService>,
    resource: QuotaResource,
    low_water: u32,
    floor: u32,
    state: Mutex<QuotaState>,
}

impl QuotaGate {
    /// Gate over the core budget used by the per-repository endpoints.
    pub fn new(service: Arc<dyn RepoService>) -> Self {
        Self::for_resource(service, QuotaResource::Core)
    }

    pub fn for_resource(service: Arc<dyn RepoService>, resource: QuotaResource) -> Self {
        let (anonymous, authenticated) = default_budget(resource);
        let guess = if service.has_credential() {
            authenticated
        } else {
            anonymous
        };
        let remaining = service.observed_remaining(resource).unwrap_or(guess);
        Self {
            service,
            resource,
            low_water: LOW_WATER_MARK,
            floor: HARD_FLOOR,
            state: Mutex::new(QuotaState {
                remaining,
                reset_at: None,
            }),
        }
    }

    pub fn with_thresholds(mut self, low_water: u32, floor: u32) -> Self {
        self.low_water = low_water.max(floor);
        self.floor = floor;
        self
    }

    pub fn resource(&self) -> QuotaResource {
        self.resource
    }

    pub fn remaining(&self) -> u32 {
        self.snapshot().remaining
    }

    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot().reset_at
    }

    /// Record an exhaustion reported by a call that bypassed the gate.
    pub fn mark_exhausted(&self, reset_at: Option<DateTime<Utc>>) {
        self.update(|state| {
            state.remaining = 0;
            if reset_at.is_some() {
                state.reset_at = reset_at;
            }
        });
    }

    /// Ask the quota endpoint for the current budget. A failed lookup keeps
    /// the cached value.
    pub async fn refresh(&self) -> Refresh {
        match self.service.rate_limit(self.resource).await {
            Ok(status) => {
                self.update(|state| {
                    state.remaining = status.remaining;
                    state.reset_at = status.reset_at.or(state.reset_at);
                });
                info!(
                    resource = self.resource.as_str(),
                    remaining = status.remaining,
                    limit = status.limit,
                    reset_at = ?status.reset_at,
                    "rate limit refreshed"
                );
            }
            Err(ServiceError::QuotaExhausted { reset_at }) => self.mark_exhausted(reset_at),
            Err(err) => warn!(error = %err, "rate limit lookup failed; keeping cached budget"),
        }

        let remaining = self.remaining();
        if remaining < self.floor {
            warn!(remaining, reset_at = ?self.reset_at(), "rate limit almost exhausted");
            Refresh::Exhausted
        } else {
            Refresh::Remaining(remaining)
        }
    }

    /// Decide whether `min_needed` more calls may be issued.
    pub async fn ensure_capacity(&self, min_needed: u32) -> Capacity {
        if let Some(observed) = self.service.observed_remaining(self.resource) {
            self.update(|state| state.remaining = observed);
        }

        if self.remaining() < self.low_water.max(min_needed) {
            debug!(
                cached = self.remaining(),
                min_needed, "budget below low-water mark"
            );
            if self.refresh().await == Refresh::Exhausted {
                return Capacity::Stop;
            }
        }

        if self.remaining() < self.floor.max(min_needed) {
            Capacity::Stop
        } else {
            Capacity::Continue
        }
    }

    fn snapshot(&self) -> QuotaState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut QuotaState)) {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}
