//! Bounded-concurrency parallel stage.
//!
//! A stage consumes items from an upstream stream, runs a [`TaskUnit`] on
//! each with at most `concurrency` units in flight, and forwards results
//! downstream either in completion order or in upstream order.
//!
//! ## Architecture
//!
//! ```text
//! upstream ──► ConcurrencyGate ──► task units ──┬─► (unordered) ─────────────┬─► downstream
//!   (pull)       admit/release     (in flight)  └─► ReorderBuffer (ordered) ─┘
//!                                                          │
//!                                       TerminationCoordinator ──► completion signal
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowgate::{FnTask, ParallelStage, StageConfig};
//! use futures::StreamExt;
//!
//! let task = FnTask::map("double", |x: u64| async move { Ok::<_, flowgate::BoxError>(x * 2) });
//! let stage = ParallelStage::new(StageConfig::ordered(2), task)?;
//! let (mut results, handle) = stage.process(futures::stream::iter(vec![1, 2, 3, 4]));
//!
//! while let Some(result) = results.next().await {
//!     println!("{}", result?);
//! }
//! println!("{:?}", handle.completion().await);
//! ```

mod config;
mod coordinator;
mod executor;
mod metrics;
mod reorder;
mod task;

pub use config::{DEFAULT_STAGE_NAME, Delivery, StageConfig};
pub use coordinator::{CoordinatorState, StageOutcome, TerminationCoordinator};
pub use metrics::StageMetrics;
pub use reorder::ReorderBuffer;
pub use task::{FnTask, TaskOutcome, TaskUnit};

use crate::gate::ConcurrencyGate;
use executor::StageRun;
use flowgate_shared::errors::{FlowgateError, FlowgateResult};
use futures::stream::{BoxStream, Stream, StreamExt};
use metrics::StageMetricsStorage;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A configured stage, ready to run once.
pub struct ParallelStage<I, T> {
    config: StageConfig,
    gate: ConcurrencyGate,
    task: Arc<T>,
    _item: PhantomData<fn(I)>,
}

impl<I, T> ParallelStage<I, T>
where
    I: Send + 'static,
    T: TaskUnit<I> + 'static,
{
    /// Validate `config` and build the stage.
    ///
    /// # Errors
    ///
    /// Returns [`FlowgateError::Configuration`] if the configuration is
    /// invalid (e.g. `concurrency == 0`).
    pub fn new(config: StageConfig, task: T) -> FlowgateResult<Self> {
        config.validate()?;
        let gate = ConcurrencyGate::new(config.concurrency)?;

        Ok(Self {
            config,
            gate,
            task: Arc::new(task),
            _item: PhantomData,
        })
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Pull interface: run the stage over `upstream`.
    ///
    /// Nothing happens until the returned stream is polled. The stream is
    /// finite and yields at most one [`FlowgateError::Task`]; it ends once
    /// the stage has terminated. Dropping it early drops every in-flight unit.
    pub fn process<S>(self, upstream: S) -> (StageStream<T::Output>, StageHandle)
    where
        S: Stream<Item = I> + Send + 'static,
    {
        let delivery = self.config.delivery();
        let metrics = Arc::new(StageMetricsStorage::new(
            &self.config.name,
            delivery,
            self.config.concurrency,
        ));
        let coordinator = TerminationCoordinator::new(self.config.name.clone(), Arc::clone(&metrics));

        let handle = StageHandle {
            name: self.config.name.clone(),
            completion: coordinator.subscribe(),
            metrics: Arc::clone(&metrics),
        };

        let run = StageRun {
            stage: self.config.name,
            delivery,
            gate: self.gate,
            task: self.task,
            coordinator,
            metrics,
        };

        let stream = StageStream {
            inner: run.execute(upstream).boxed(),
        };
        (stream, handle)
    }

    /// Push interface: run the stage on a spawned task and forward results
    /// into a bounded channel of `capacity`.
    ///
    /// A full channel stops the stage from pulling further results, which in
    /// turn stops admissions upstream. Must be called within a Tokio runtime.
    pub fn spawn<S>(self, upstream: S, capacity: usize) -> FlowgateResult<SpawnedStage<T::Output>>
    where
        S: Stream<Item = I> + Send + 'static,
    {
        if capacity == 0 {
            return Err(FlowgateError::Configuration(
                "output capacity must be greater than 0".into(),
            ));
        }

        let (tx, output) = mpsc::channel(capacity);
        let (mut results, handle) = self.process(upstream);
        let worker_handle = handle.clone();

        let join = tokio::spawn(async move {
            while let Some(result) = results.next().await {
                if tx.send(result).await.is_err() {
                    tracing::debug!(stage = %worker_handle.name(), "downstream receiver dropped, abandoning stage");
                    return StageOutcome::Abandoned;
                }
            }
            drop(results);
            worker_handle.completion().await
        });

        Ok(SpawnedStage {
            output,
            handle,
            join,
        })
    }

    /// Run the stage to the end and collect every emitted result.
    ///
    /// Returns the task error, if any, once in-flight units have drained.
    pub async fn collect<S>(self, upstream: S) -> FlowgateResult<Vec<T::Output>>
    where
        S: Stream<Item = I> + Send + 'static,
    {
        let (mut results, _handle) = self.process(upstream);
        let mut collected = Vec::new();
        let mut first_error = None;

        while let Some(result) = results.next().await {
            match result {
                Ok(value) => collected.push(value),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(collected),
        }
    }
}

impl<I, T> std::fmt::Debug for ParallelStage<I, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelStage")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .finish()
    }
}

/// Results of a running stage, in delivery order.
pub struct StageStream<O> {
    inner: BoxStream<'static, FlowgateResult<O>>,
}

impl<O> Stream for StageStream<O> {
    type Item = FlowgateResult<O>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Observer for a running stage: completion signal and metrics.
#[derive(Clone)]
pub struct StageHandle {
    name: String,
    completion: watch::Receiver<Option<StageOutcome>>,
    metrics: Arc<StageMetricsStorage>,
}

impl StageHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the completion signal.
    ///
    /// Resolves to [`StageOutcome::Abandoned`] if the stage is dropped before
    /// it terminates.
    pub async fn completion(&self) -> StageOutcome {
        let mut completion = self.completion.clone();
        let fired = completion
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| *outcome);

        fired
            .or_else(|| *self.completion.borrow())
            .unwrap_or(StageOutcome::Abandoned)
    }

    /// `None` while the stage is still running.
    pub fn outcome(&self) -> Option<StageOutcome> {
        *self.completion.borrow()
    }

    pub fn metrics(&self) -> StageMetrics {
        self.metrics.snapshot()
    }

    /// Task units currently running. A slot reserved for the next upstream
    /// item is not a running unit.
    pub fn in_flight(&self) -> usize {
        self.metrics.in_flight()
    }
}

/// A stage running on its own task, see [`ParallelStage::spawn`].
pub struct SpawnedStage<O> {
    pub output: mpsc::Receiver<FlowgateResult<O>>,
    pub handle: StageHandle,
    pub join: JoinHandle<StageOutcome>,
}

impl<O> SpawnedStage<O> {
    /// Wait for the stage task to finish.
    pub async fn wait(self) -> FlowgateResult<StageOutcome> {
        self.join
            .await
            .map_err(|e| FlowgateError::Internal(format!("stage task failed: {}", e)))
    }
}
