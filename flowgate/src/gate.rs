//! Concurrency gate.
//!
//! Bounds the number of task units in flight. Admission reserves one slot
//! and hands back a [`GatePermit`]; dropping (or releasing) the permit frees
//! the slot and resumes the longest-waiting admission, if any.
//!
//! ```text
//! admit() ──► slot free? ──yes──► GatePermit (in_flight += 1)
//!                 │
//!                 no ──► wait in FIFO queue ──► woken by release()
//! ```

use flowgate_shared::errors::{FlowgateError, FlowgateResult};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Upper bound on simultaneous task units.
///
/// Cheap to clone; all clones share the same slots.
#[derive(Clone)]
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    /// Fair semaphore: suspended admissions are served in request order.
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `concurrency` units at once.
    ///
    /// # Errors
    ///
    /// Returns [`FlowgateError::Configuration`] if `concurrency` is zero or
    /// exceeds the number of permits a semaphore can track.
    pub fn new(concurrency: usize) -> FlowgateResult<Self> {
        if concurrency == 0 {
            return Err(FlowgateError::Configuration(
                "concurrency must be greater than 0".into(),
            ));
        }
        if concurrency > Semaphore::MAX_PERMITS {
            return Err(FlowgateError::Configuration(format!(
                "concurrency {} exceeds the maximum of {}",
                concurrency,
                Semaphore::MAX_PERMITS
            )));
        }

        Ok(Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(concurrency)),
                capacity: concurrency,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        })
    }

    /// Reserve one slot, suspending until one is free.
    ///
    /// Cancel-safe: dropping the returned future before it resolves
    /// leaves the waiter queue untouched for everyone else.
    pub async fn admit(&self) -> FlowgateResult<GatePermit> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| FlowgateError::Internal("concurrency gate closed".into()))?;
        Ok(self.track(permit))
    }

    /// Reserve one slot only if one is free right now.
    pub fn try_admit(&self) -> Option<GatePermit> {
        Arc::clone(&self.inner.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.track(permit))
    }

    /// Run `fut` while holding one slot.
    pub async fn run<F>(&self, fut: F) -> FlowgateResult<F::Output>
    where
        F: Future,
    {
        let _permit = self.admit().await?;
        Ok(fut.await)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently reserved.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of slots ever reserved at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> GatePermit {
        let now = self.inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(now, Ordering::AcqRel);
        GatePermit {
            gate: Arc::clone(&self.inner),
            _permit: permit,
        }
    }
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("capacity", &self.capacity())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// One reserved slot of a [`ConcurrencyGate`].
///
/// The slot is released exactly once, when the permit is dropped.
#[must_use = "dropping a permit immediately releases its slot"]
pub struct GatePermit {
    gate: Arc<GateInner>,
    // Dropped after `Drop::drop` runs, so the counter is decremented before
    // the next waiter is woken.
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Release the slot explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = ConcurrencyGate::new(0).unwrap_err();
        assert!(matches!(err, FlowgateError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_admit_and_release_are_paired() {
        let gate = ConcurrencyGate::new(2).unwrap();

        let a = gate.admit().await.unwrap();
        let b = gate.admit().await.unwrap();
        assert_eq!(gate.in_flight(), 2);
        assert_eq!(gate.available(), 0);
        assert!(gate.try_admit().is_none());

        a.release();
        assert_eq!(gate.in_flight(), 1);
        assert_eq!(gate.available(), 1);

        drop(b);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_suspended_admissions_resume_in_fifo_order() {
        let gate = ConcurrencyGate::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = gate.admit().await.unwrap();

        let mut waiters = Vec::new();
        for id in 0..3 {
            let gate = gate.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let _permit = gate.admit().await.unwrap();
                order.lock().push(id);
            }));
            // Let the waiter enqueue itself before the next one is spawned.
            tokio::task::yield_now().await;
        }

        assert!(order.lock().is_empty());
        held.release();

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_never_exceeds_capacity() {
        let gate = ConcurrencyGate::new(3).unwrap();

        let jobs = (0..10u64).map(|i| {
            let gate = gate.clone();
            async move {
                gate.run(async move {
                    tokio::time::sleep(Duration::from_millis(5 + i % 3)).await;
                    i
                })
                .await
                .unwrap()
            }
        });
        let mut done = futures::future::join_all(jobs).await;
        done.sort();

        assert_eq!(done, (0..10).collect::<Vec<_>>());
        assert_eq!(gate.peak_in_flight(), 3);
        assert_eq!(gate.in_flight(), 0);
    }
}
