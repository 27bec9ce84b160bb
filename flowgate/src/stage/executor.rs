//! Stage execution loop.
//!
//! A single loop drives everything on the consumer's task: it reserves gate
//! slots, pulls upstream items into reserved slots, and polls in-flight task
//! units. Units are never spawned, so "concurrent" means interleaved.
//!
//! Each turn waits on whichever of these is enabled, in priority order:
//!
//! 1. a unit settling (always drained first, it frees a slot)
//! 2. a free gate slot, when none is reserved yet
//! 3. the next upstream item, once a slot is reserved
//!
//! Holding a reserved slot while upstream is pending is what turns a
//! saturated stage into backpressure: nothing is pulled until a slot frees.
//!
//! In ordered delivery a completed result keeps its slot until it is
//! released downstream, so at most `concurrency - 1` results are ever
//! held back behind a slower one.

use super::config::Delivery;
use super::coordinator::TerminationCoordinator;
use super::metrics::StageMetricsStorage;
use super::reorder::ReorderBuffer;
use super::task::{TaskOutcome, TaskUnit};
use crate::gate::{ConcurrencyGate, GatePermit};
use async_stream::stream;
use flowgate_shared::errors::{BoxError, FlowgateError, FlowgateResult};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::Instrument;

type Settled<O> = (u64, Result<TaskOutcome<O>, BoxError>, Option<GatePermit>);

enum Event<I, O> {
    Settled(Settled<O>),
    Reserved(FlowgateResult<GatePermit>),
    Pulled(Option<I>),
}

/// Everything one stage run owns.
pub(crate) struct StageRun<T> {
    pub(crate) stage: String,
    pub(crate) delivery: Delivery,
    pub(crate) gate: ConcurrencyGate,
    pub(crate) task: Arc<T>,
    pub(crate) coordinator: TerminationCoordinator,
    pub(crate) metrics: Arc<StageMetricsStorage>,
}

impl<T> StageRun<T> {
    /// Drive `upstream` through the stage, yielding results as they become
    /// deliverable.
    ///
    /// Yields at most one task error. After it, nothing else is admitted or
    /// forwarded; units already in flight are still polled to completion and
    /// their results discarded before the stream ends.
    pub(crate) fn execute<I, S>(
        self,
        upstream: S,
    ) -> impl Stream<Item = FlowgateResult<T::Output>> + Send + 'static
    where
        I: Send + 'static,
        T: TaskUnit<I> + 'static,
        S: Stream<Item = I> + Send + 'static,
    {
        let StageRun {
            stage,
            delivery,
            gate,
            task,
            mut coordinator,
            metrics,
        } = self;

        stream! {
            let mut upstream = Box::pin(upstream);
            let mut in_flight: FuturesUnordered<BoxFuture<'static, Settled<T::Output>>> =
                FuturesUnordered::new();
            let mut reorder = match delivery {
                Delivery::Ordered => Some(ReorderBuffer::new()),
                Delivery::Unordered => None,
            };
            let mut held: BTreeMap<u64, GatePermit> = BTreeMap::new();
            let mut reserved: Option<GatePermit> = None;
            let mut accepting = true;
            let mut failed = false;
            let mut next_index: u64 = 0;

            metrics.mark_started();
            tracing::info!(
                stage = %stage,
                stage_id = %metrics.stage_id(),
                task = task.name(),
                concurrency = gate.capacity(),
                ?delivery,
                "stage started"
            );

            while !coordinator.is_terminated() {
                let event = tokio::select! {
                    biased;
                    Some(settled) = in_flight.next(), if !in_flight.is_empty() => {
                        Event::Settled(settled)
                    }
                    permit = gate.admit(), if accepting && reserved.is_none() => {
                        Event::Reserved(permit)
                    }
                    item = upstream.next(), if accepting && reserved.is_some() => {
                        Event::Pulled(item)
                    }
                    else => {
                        tracing::error!(stage = %stage, "stage stalled before termination");
                        break;
                    }
                };
                metrics.set_in_flight(in_flight.len());

                let step = match event {
                    Event::Reserved(Ok(permit)) => {
                        reserved = Some(permit);
                        Ok(false)
                    }
                    Event::Reserved(Err(e)) => {
                        tracing::error!(stage = %stage, error = %e, "admission failed, aborting stage");
                        accepting = false;
                        failed = true;
                        if let Some(buffer) = reorder.as_mut() {
                            metrics.record_discarded(buffer.clear() as u64);
                        }
                        held.clear();
                        yield Err(e);
                        coordinator.abort(in_flight.len())
                    }
                    Event::Pulled(Some(item)) => {
                        let permit = reserved.take();
                        let keep_slot = reorder.is_some();
                        let index = next_index;
                        next_index += 1;

                        let unit = {
                            let task = Arc::clone(&task);
                            async move {
                                let result = task.run(item).await;
                                // Unordered units release on settle.
                                let permit = permit.filter(|_| keep_slot && result.is_ok());
                                (index, result, permit)
                            }
                        };
                        in_flight.push(
                            unit.instrument(tracing::debug_span!("task_unit", stage = %stage, index))
                                .boxed(),
                        );

                        metrics.record_admitted(in_flight.len());
                        tracing::debug!(stage = %stage, index, in_flight = in_flight.len(), "admitted item");
                        Ok(false)
                    }
                    Event::Pulled(None) => {
                        reserved = None;
                        accepting = false;
                        coordinator.upstream_exhausted(in_flight.len())
                    }
                    Event::Settled((index, _, _)) if failed => {
                        metrics.record_discarded(1);
                        tracing::debug!(stage = %stage, index, "discarding result of failed stage");
                        coordinator.unit_completed(in_flight.len())
                    }
                    Event::Settled((index, Ok(outcome), permit)) => {
                        tracing::debug!(stage = %stage, index, in_flight = in_flight.len(), "unit completed");
                        let ready = match reorder.as_mut() {
                            None => vec![outcome],
                            Some(buffer) => match buffer.insert(index, outcome) {
                                Ok(()) => {
                                    if let Some(permit) = permit {
                                        held.insert(index, permit);
                                    }
                                    let ready = buffer.drain_ready();
                                    // Released results hand their slots back.
                                    held = held.split_off(&buffer.next_expected());
                                    metrics.record_buffered(buffer.buffered());
                                    ready
                                }
                                Err(e) => {
                                    tracing::error!(stage = %stage, index, error = %e, "reorder buffer rejected result");
                                    yield Err(e);
                                    Vec::new()
                                }
                            },
                        };
                        for outcome in ready {
                            match outcome {
                                TaskOutcome::Emit(value) => {
                                    metrics.record_emitted();
                                    yield Ok(value);
                                }
                                TaskOutcome::Skip => metrics.record_skipped(),
                            }
                        }
                        coordinator.unit_completed(in_flight.len())
                    }
                    Event::Settled((index, Err(cause), _)) => {
                        metrics.record_failed();
                        tracing::warn!(
                            stage = %stage,
                            index,
                            in_flight = in_flight.len(),
                            error = %cause,
                            "task unit failed, aborting stage"
                        );
                        accepting = false;
                        failed = true;
                        reserved = None;
                        if let Some(buffer) = reorder.as_mut() {
                            metrics.record_discarded(buffer.clear() as u64);
                        }
                        held.clear();
                        yield Err(FlowgateError::task(index, task.name(), cause));
                        coordinator.abort(in_flight.len())
                    }
                };

                if let Err(e) = step {
                    tracing::error!(stage = %stage, error = %e, "termination protocol violated");
                    yield Err(e);
                }
            }

            let snapshot = metrics.snapshot();
            tracing::info!(
                stage = %stage,
                outcome = ?coordinator.outcome(),
                admitted = snapshot.admitted,
                emitted = snapshot.emitted,
                skipped = snapshot.skipped,
                discarded = snapshot.discarded,
                peak_in_flight = snapshot.peak_in_flight,
                peak_buffered = snapshot.peak_buffered,
                duration_ms = ?snapshot.duration_ms,
                "stage finished"
            );
        }
    }
}
