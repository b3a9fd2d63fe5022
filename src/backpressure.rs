//! Backpressure Controller (C7) — two independent admission gauges named in
//! spec.md §4.7: a bounded-semaphore API admission check, and a
//! lag/queue-depth-driven consumer pause/resume. Health and status
//! endpoints never consult either gauge — callers simply don't wire this
//! controller into those routes.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Semaphore, TryAcquireError};

use crate::config::BackpressureConfig;

/// Held while an API request is in flight; releases its semaphore permit
/// on drop regardless of how the request handler exits.
pub struct ApiPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Result of [`BackpressureController::try_admit_api`].
pub enum ApiAdmission {
    Admitted(ApiPermit),
    /// Saturation reached 100%; caller should respond 503 with
    /// `Retry-After` (spec.md §6 uses 5 seconds for this in scenario S5).
    Rejected,
}

pub struct BackpressureController {
    api_semaphore: Arc<Semaphore>,
    api_limit: usize,
    high_water_pct: u8,
    max_consumer_lag: u64,
    max_processing_queue_size: usize,
    current_lag: AtomicU64,
    current_queue_depth: AtomicUsize,
    consumer_paused: AtomicBool,
}

impl BackpressureController {
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            api_semaphore: Arc::new(Semaphore::new(config.api_admission_limit)),
            api_limit: config.api_admission_limit,
            high_water_pct: config.api_high_water_pct,
            max_consumer_lag: config.max_consumer_lag,
            max_processing_queue_size: config.max_processing_queue_size,
            current_lag: AtomicU64::new(0),
            current_queue_depth: AtomicUsize::new(0),
            consumer_paused: AtomicBool::new(false),
        }
    }

    /// `canAcceptApiRequest()` — try to reserve one of the bounded in-flight
    /// slots. Logs a warning once usage crosses the configured high-water
    /// mark; rejects outright once every permit is taken.
    pub fn try_admit_api(self: &Arc<Self>) -> ApiAdmission {
        match self.api_semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let in_flight = self.api_limit - self.api_semaphore.available_permits();
                let pct = (in_flight * 100) / self.api_limit.max(1);
                if pct as u8 >= self.high_water_pct {
                    tracing::warn!(
                        in_flight,
                        limit = self.api_limit,
                        pct,
                        "API admission above high-water mark"
                    );
                }
                ApiAdmission::Admitted(ApiPermit { _permit: permit })
            }
            Err(TryAcquireError::NoPermits) => {
                tracing::warn!(limit = self.api_limit, "API admission saturated, rejecting");
                ApiAdmission::Rejected
            }
            Err(TryAcquireError::Closed) => ApiAdmission::Rejected,
        }
    }

    pub fn in_flight_api_requests(&self) -> usize {
        self.api_limit - self.api_semaphore.available_permits()
    }

    /// Update the consumer-side gauges. Called periodically by whatever
    /// reports lag/queue-depth (the queue ingress adapter, the partition
    /// dispatcher).
    pub fn report_consumer_state(&self, lag: u64, queue_depth: usize) {
        self.current_lag.store(lag, Ordering::Relaxed);
        self.current_queue_depth.store(queue_depth, Ordering::Relaxed);
    }

    /// `canProcessMessage()` — hysteresis: once paused, both gauges must
    /// recover below their thresholds before resuming, so a gauge
    /// oscillating right at the limit doesn't flap the consumer on and off
    /// every poll.
    pub fn can_process_message(&self) -> bool {
        let lag = self.current_lag.load(Ordering::Relaxed);
        let depth = self.current_queue_depth.load(Ordering::Relaxed);
        let over_limit = lag >= self.max_consumer_lag || depth >= self.max_processing_queue_size;

        if over_limit {
            if !self.consumer_paused.swap(true, Ordering::Relaxed) {
                tracing::warn!(lag, depth, "consumer paused: backpressure thresholds exceeded");
            }
            return false;
        }

        if self.consumer_paused.swap(false, Ordering::Relaxed) {
            tracing::info!(lag, depth, "consumer resumed: backpressure thresholds recovered");
        }
        true
    }

    pub fn is_consumer_paused(&self) -> bool {
        self.consumer_paused.load(Ordering::Relaxed)
    }
}

/// Operator-visible snapshot for `/api/v1/backpressure/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackpressureStatus {
    pub api_in_flight: usize,
    pub api_limit: usize,
    pub consumer_lag: u64,
    pub max_consumer_lag: u64,
    pub processing_queue_depth: usize,
    pub max_processing_queue_size: usize,
    pub consumer_paused: bool,
}

impl BackpressureController {
    pub fn status(&self) -> BackpressureStatus {
        BackpressureStatus {
            api_in_flight: self.in_flight_api_requests(),
            api_limit: self.api_limit,
            consumer_lag: self.current_lag.load(Ordering::Relaxed),
            max_consumer_lag: self.max_consumer_lag,
            processing_queue_depth: self.current_queue_depth.load(Ordering::Relaxed),
            max_processing_queue_size: self.max_processing_queue_size,
            consumer_paused: self.is_consumer_paused(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(limit: usize) -> BackpressureConfig {
        BackpressureConfig {
            api_admission_limit: limit,
            api_high_water_pct: 80,
            max_consumer_lag: 100,
            max_processing_queue_size: 50,
        }
    }

    #[test]
    fn admits_until_saturated_then_rejects() {
        let controller = Arc::new(BackpressureController::new(&config(2)));
        let p1 = controller.try_admit_api();
        assert!(matches!(p1, ApiAdmission::Admitted(_)));
        let p2 = controller.try_admit_api();
        assert!(matches!(p2, ApiAdmission::Admitted(_)));
        assert!(matches!(controller.try_admit_api(), ApiAdmission::Rejected));
    }

    #[test]
    fn releasing_a_permit_frees_capacity() {
        let controller = Arc::new(BackpressureController::new(&config(1)));
        {
            let _permit = controller.try_admit_api();
            assert!(matches!(controller.try_admit_api(), ApiAdmission::Rejected));
        }
        assert!(matches!(controller.try_admit_api(), ApiAdmission::Admitted(_)));
    }

    #[test]
    fn consumer_pauses_when_lag_exceeds_threshold_and_resumes_after_recovery() {
        let controller = BackpressureController::new(&config(1000));
        assert!(controller.can_process_message());
        controller.report_consumer_state(150, 0);
        assert!(!controller.can_process_message());
        assert!(controller.is_consumer_paused());
        controller.report_consumer_state(0, 0);
        assert!(controller.can_process_message());
        assert!(!controller.is_consumer_paused());
    }

    #[test]
    fn consumer_pauses_on_queue_depth_alone() {
        let controller = BackpressureController::new(&config(1000));
        controller.report_consumer_state(0, 60);
        assert!(!controller.can_process_message());
    }
}
