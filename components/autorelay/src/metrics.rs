use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters and gauges describing relay finder activity.
#[derive(Default)]
pub struct FinderMetrics {
    probe_attempts: AtomicU64,
    probe_successes: AtomicU64,
    probe_failures: AtomicU64,
    reservation_attempts: AtomicU64,
    reservation_successes: AtomicU64,
    reservation_failures: AtomicU64,
    refresh_failures: AtomicU64,
    relay_disconnects: AtomicU64,
    candidates_active: AtomicU64,
    candidates_on_backoff: AtomicU64,
    reservations_active: AtomicU64,
}

impl FinderMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_probe_attempt(&self) {
        self.probe_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_success(&self) {
        self.probe_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reservation_attempt(&self) {
        self.reservation_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reservation_success(&self) {
        self.reservation_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reservation_failure(&self) {
        self.reservation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_disconnect(&self) {
        self.relay_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_candidate_counts(&self, active: usize, on_backoff: usize) {
        self.candidates_active.store(active as u64, Ordering::Relaxed);
        self.candidates_on_backoff.store(on_backoff as u64, Ordering::Relaxed);
    }

    pub fn set_active_reservations(&self, active: usize) {
        self.reservations_active.store(active as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FinderMetricsSnapshot {
        FinderMetricsSnapshot {
            probe_attempts: self.probe_attempts.load(Ordering::Relaxed),
            probe_successes: self.probe_successes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            reservation_attempts: self.reservation_attempts.load(Ordering::Relaxed),
            reservation_successes: self.reservation_successes.load(Ordering::Relaxed),
            reservation_failures: self.reservation_failures.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            relay_disconnects: self.relay_disconnects.load(Ordering::Relaxed),
            candidates_active: self.candidates_active.load(Ordering::Relaxed),
            candidates_on_backoff: self.candidates_on_backoff.load(Ordering::Relaxed),
            reservations_active: self.reservations_active.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FinderMetricsSnapshot {
    pub probe_attempts: u64,
    pub probe_successes: u64,
    pub probe_failures: u64,
    pub reservation_attempts: u64,
    pub reservation_successes: u64,
    pub reservation_failures: u64,
    pub refresh_failures: u64,
    pub relay_disconnects: u64,
    pub candidates_active: u64,
    pub candidates_on_backoff: u64,
    pub reservations_active: u64,
}
