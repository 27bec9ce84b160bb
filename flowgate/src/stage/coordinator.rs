//! Termination coordinator.
//!
//! Decides when a stage is finished and fires its completion signal exactly
//! once.
//!
//! ```text
//! Running ──upstream exhausted──► UpstreamDone ──► Draining ──last unit settles──► Terminated
//!    │                                                ▲
//!    └──────────────────abort (task failure)──────────┘
//! ```
//!
//! `Terminated` is absorbing: completion events that arrive afterwards are
//! reported as protocol errors.

use super::metrics::StageMetricsStorage;
use flowgate_shared::errors::{FlowgateError, FlowgateResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    UpstreamDone,
    Draining,
    Terminated,
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Upstream was exhausted and every admitted unit settled successfully.
    Completed,
    /// A task unit failed; the stage stopped admitting and drained.
    Failed,
    /// The stage was dropped before it terminated. The completion signal
    /// never fired.
    Abandoned,
}

pub struct TerminationCoordinator {
    stage: String,
    state: CoordinatorState,
    aborted: bool,
    signal: watch::Sender<Option<StageOutcome>>,
    metrics: Arc<StageMetricsStorage>,
}

impl TerminationCoordinator {
    pub(crate) fn new(stage: impl Into<String>, metrics: Arc<StageMetricsStorage>) -> Self {
        let (signal, _) = watch::channel(None);
        Self {
            stage: stage.into(),
            state: CoordinatorState::Running,
            aborted: false,
            signal,
            metrics,
        }
    }

    /// Observe the completion signal.
    pub fn subscribe(&self) -> watch::Receiver<Option<StageOutcome>> {
        self.signal.subscribe()
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == CoordinatorState::Terminated
    }

    /// `None` until the completion signal fired.
    pub fn outcome(&self) -> Option<StageOutcome> {
        *self.signal.borrow()
    }

    /// Upstream signalled exhaustion. Returns `true` if the stage terminated
    /// on this call (nothing was in flight).
    pub fn upstream_exhausted(&mut self, in_flight: usize) -> FlowgateResult<bool> {
        match self.state {
            CoordinatorState::Running => {
                self.state = CoordinatorState::UpstreamDone;
                tracing::debug!(stage = %self.stage, in_flight, "upstream exhausted, draining");
                self.state = CoordinatorState::Draining;
                Ok(self.check_drained(in_flight))
            }
            // Abort already stopped pulling from upstream.
            CoordinatorState::Draining if self.aborted => Ok(false),
            state => Err(FlowgateError::Protocol(format!(
                "stage '{}': upstream exhausted twice (state {:?})",
                self.stage, state
            ))),
        }
    }

    /// A unit settled and was removed from the in-flight set, leaving
    /// `in_flight` units. Returns `true` if this was the last one to drain.
    pub fn unit_completed(&mut self, in_flight: usize) -> FlowgateResult<bool> {
        match self.state {
            CoordinatorState::Terminated => Err(FlowgateError::Protocol(format!(
                "stage '{}': unit completed after termination",
                self.stage
            ))),
            CoordinatorState::Draining => Ok(self.check_drained(in_flight)),
            _ => Ok(false),
        }
    }

    /// A task unit failed: stop admitting and drain what is in flight.
    /// Returns `true` if the stage terminated on this call.
    pub fn abort(&mut self, in_flight: usize) -> FlowgateResult<bool> {
        if self.state == CoordinatorState::Terminated {
            return Err(FlowgateError::Protocol(format!(
                "stage '{}': abort after termination",
                self.stage
            )));
        }
        self.aborted = true;
        self.state = CoordinatorState::Draining;
        Ok(self.check_drained(in_flight))
    }

    fn check_drained(&mut self, in_flight: usize) -> bool {
        if in_flight > 0 {
            return false;
        }

        let outcome = if self.aborted {
            StageOutcome::Failed
        } else {
            StageOutcome::Completed
        };
        self.state = CoordinatorState::Terminated;
        // Observers of the signal must see final timings.
        self.metrics.mark_finished();
        self.signal.send_replace(Some(outcome));
        tracing::debug!(stage = %self.stage, ?outcome, "stage terminated");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::config::Delivery;

    fn new_coordinator() -> TerminationCoordinator {
        let metrics = StageMetricsStorage::new("t", Delivery::Unordered, 1);
        TerminationCoordinator::new("t", Arc::new(metrics))
    }

    #[test]
    fn test_empty_upstream_terminates_immediately() {
        let mut coordinator = new_coordinator();
        let signal = coordinator.subscribe();

        assert!(coordinator.upstream_exhausted(0).unwrap());
        assert!(coordinator.is_terminated());
        assert_eq!(*signal.borrow(), Some(StageOutcome::Completed));
        assert_eq!(coordinator.outcome(), Some(StageOutcome::Completed));
    }

    #[test]
    fn test_last_unit_fires_signal() {
        let mut coordinator = new_coordinator();
        let signal = coordinator.subscribe();

        assert!(!coordinator.unit_completed(2).unwrap());
        assert!(!coordinator.upstream_exhausted(2).unwrap());
        assert_eq!(coordinator.state(), CoordinatorState::Draining);
        assert_eq!(*signal.borrow(), None);

        assert!(!coordinator.unit_completed(1).unwrap());
        assert!(coordinator.unit_completed(0).unwrap());
        assert_eq!(*signal.borrow(), Some(StageOutcome::Completed));
    }

    #[test]
    fn test_completion_after_termination_is_reported() {
        let mut coordinator = new_coordinator();
        coordinator.upstream_exhausted(0).unwrap();

        let err = coordinator.unit_completed(0).unwrap_err();
        assert!(matches!(err, FlowgateError::Protocol(_)));
        assert!(coordinator.abort(0).is_err());
        assert!(coordinator.upstream_exhausted(0).is_err());
    }

    #[test]
    fn test_abort_drains_then_fails() {
        let mut coordinator = new_coordinator();
        let signal = coordinator.subscribe();

        assert!(!coordinator.abort(1).unwrap());
        assert_eq!(*signal.borrow(), None);
        // Upstream exhaustion during an abort drain is not an error.
        assert!(!coordinator.upstream_exhausted(1).unwrap());

        assert!(coordinator.unit_completed(0).unwrap());
        assert_eq!(*signal.borrow(), Some(StageOutcome::Failed));
    }
}
