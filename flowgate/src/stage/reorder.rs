//! Reorder buffer for ordered delivery.
//!
//! Units complete in any order; results are held by sequence index until
//! every lower index has been released. With a concurrency ceiling of N at
//! most N - 1 results wait here at any time.

use super::task::TaskOutcome;
use flowgate_shared::errors::{FlowgateError, FlowgateResult};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct ReorderBuffer<O> {
    next_expected: u64,
    pending: BTreeMap<u64, TaskOutcome<O>>,
}

impl<O> ReorderBuffer<O> {
    pub fn new() -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Hold the outcome of unit `index` until it can be released.
    ///
    /// Each index settles exactly once; a second outcome for the same index,
    /// or one for an index already released, is a protocol error.
    pub fn insert(&mut self, index: u64, outcome: TaskOutcome<O>) -> FlowgateResult<()> {
        if index < self.next_expected || self.pending.contains_key(&index) {
            return Err(FlowgateError::Protocol(format!(
                "duplicate completion for item #{}",
                index
            )));
        }
        self.pending.insert(index, outcome);
        Ok(())
    }

    /// Release the contiguous run starting at the next expected index.
    ///
    /// Skipped outcomes are part of the run: they advance the sequence and
    /// are returned so the caller can account for them.
    pub fn drain_ready(&mut self) -> Vec<TaskOutcome<O>> {
        let mut ready = Vec::new();
        while let Some(outcome) = self.pending.remove(&self.next_expected) {
            self.next_expected += 1;
            ready.push(outcome);
        }
        ready
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Outcomes waiting for a lower index.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Drop everything held; returns how many outcomes were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }
}

impl<O> Default for ReorderBuffer<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_fast_path() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(0, TaskOutcome::Emit("a")).unwrap();
        assert_eq!(buffer.drain_ready(), vec![TaskOutcome::Emit("a")]);
        assert_eq!(buffer.next_expected(), 1);
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn test_holds_until_gap_filled() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(2, TaskOutcome::Emit(30)).unwrap();
        buffer.insert(1, TaskOutcome::Emit(20)).unwrap();
        assert!(buffer.drain_ready().is_empty());
        assert_eq!(buffer.buffered(), 2);

        buffer.insert(0, TaskOutcome::Emit(10)).unwrap();
        let released: Vec<_> = buffer
            .drain_ready()
            .into_iter()
            .filter_map(TaskOutcome::into_option)
            .collect();
        assert_eq!(released, vec![10, 20, 30]);
        assert_eq!(buffer.next_expected(), 3);
    }

    #[test]
    fn test_skip_advances_sequence() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(1, TaskOutcome::Emit('b')).unwrap();
        buffer.insert(0, TaskOutcome::Skip).unwrap();
        assert_eq!(
            buffer.drain_ready(),
            vec![TaskOutcome::Skip, TaskOutcome::Emit('b')]
        );
        assert_eq!(buffer.next_expected(), 2);
    }

    #[test]
    fn test_duplicate_completion_is_protocol_error() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(0, TaskOutcome::Emit(1)).unwrap();
        buffer.drain_ready();

        let err = buffer.insert(0, TaskOutcome::Emit(1)).unwrap_err();
        assert!(matches!(err, FlowgateError::Protocol(_)));

        buffer.insert(3, TaskOutcome::Skip).unwrap();
        assert!(buffer.insert(3, TaskOutcome::Skip).is_err());
    }

    #[test]
    fn test_clear_discards() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(1, TaskOutcome::Emit(1)).unwrap();
        buffer.insert(2, TaskOutcome::Emit(2)).unwrap();
        assert_eq!(buffer.clear(), 2);
        assert_eq!(buffer.buffered(), 0);
    }
}
