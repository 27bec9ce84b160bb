use crate::stage::config::Delivery;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use ulid::Ulid;

/// Snapshot of one stage run.
#[derive(Debug, Clone, Serialize)]
pub struct StageMetrics {
    pub stage_id: String,
    pub name: String,
    pub delivery: Delivery,
    pub concurrency: usize,
    pub started_at: Option<DateTime<Utc>>,
    /// Set once the stage terminated.
    pub duration_ms: Option<u64>,
    pub admitted: u64,
    pub emitted: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Results dropped because the stage had already failed.
    pub discarded: u64,
    /// Task units running right now. A reserved slot waiting on upstream
    /// does not count.
    pub in_flight: usize,
    pub peak_in_flight: usize,
    /// Most completed results held back at once waiting for an earlier one.
    pub peak_buffered: usize,
}

impl StageMetrics {
    /// Units that settled, whatever the result.
    pub fn settled(&self) -> u64 {
        self.emitted + self.skipped + self.failed + self.discarded
    }
}

#[derive(Default)]
struct Timing {
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    duration_ms: Option<u64>,
}

/// Lock-free counters shared between a running stage and its handle.
pub(crate) struct StageMetricsStorage {
    stage_id: Ulid,
    name: String,
    delivery: Delivery,
    concurrency: usize,
    admitted: AtomicU64,
    emitted: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    peak_buffered: AtomicUsize,
    timing: Mutex<Timing>,
}

impl StageMetricsStorage {
    pub(crate) fn new(name: &str, delivery: Delivery, concurrency: usize) -> Self {
        Self {
            stage_id: Ulid::new(),
            name: name.to_string(),
            delivery,
            concurrency,
            admitted: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            peak_buffered: AtomicUsize::new(0),
            timing: Mutex::new(Timing::default()),
        }
    }

    pub(crate) fn stage_id(&self) -> Ulid {
        self.stage_id
    }

    pub(crate) fn mark_started(&self) {
        let mut timing = self.timing.lock();
        timing.started_at = Some(Utc::now());
        timing.started = Some(Instant::now());
    }

    pub(crate) fn mark_finished(&self) {
        let mut timing = self.timing.lock();
        timing.duration_ms = timing
            .started
            .map(|started| started.elapsed().as_millis() as u64);
    }

    pub(crate) fn record_admitted(&self, in_flight: usize) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        self.in_flight.store(in_flight, Ordering::Relaxed);
        self.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);
    }

    pub(crate) fn set_in_flight(&self, in_flight: usize) {
        self.in_flight.store(in_flight, Ordering::Relaxed);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn record_buffered(&self, buffered: usize) {
        self.peak_buffered.fetch_max(buffered, Ordering::Relaxed);
    }

    pub(crate) fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StageMetrics {
        let timing = self.timing.lock();
        StageMetrics {
            stage_id: self.stage_id.to_string(),
            name: self.name.clone(),
            delivery: self.delivery,
            concurrency: self.concurrency,
            started_at: timing.started_at,
            duration_ms: timing.duration_ms,
            admitted: self.admitted.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            peak_buffered: self.peak_buffered.load(Ordering::Relaxed),
        }
    }
}
