use super::sequence::{Sequence, TimedEvent};
use std::sync::Arc;

/// A cursor over a shared [`Sequence`].
///
/// Tracks the index of the next event and a trailing timestamp: the timestamp of the last event
/// stepped over, or the target of the last seek.
#[derive(Debug, Clone)]
pub struct SequenceReader {
    sequence: Arc<Sequence>,
    position: usize,
    timestamp: u64,
}

impl SequenceReader {
    pub fn new(sequence: Arc<Sequence>) -> Self {
        Self {
            sequence,
            position: 0,
            timestamp: 0,
        }
    }

    #[inline]
    pub fn sequence(&self) -> &Arc<Sequence> {
        &self.sequence
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Moves to the first event at or after `timestamp`.
    pub fn seek_lower(&mut self, timestamp: u64) {
        self.position = self.sequence.lower_bound(timestamp);
        self.timestamp = timestamp;
    }

    /// Moves to the first event strictly after `timestamp`.
    pub fn seek_upper(&mut self, timestamp: u64) {
        self.position = self.sequence.upper_bound(timestamp);
        self.timestamp = timestamp;
    }

    pub fn peek(&self) -> Option<&TimedEvent> {
        self.sequence.get(self.position)
    }

    /// Timestamp of the next event, if any.
    pub fn next_timestamp(&self) -> Option<u64> {
        self.peek().map(|(t, _)| *t)
    }

    /// Returns the next event and moves past it.
    pub fn step(&mut self) -> Option<&TimedEvent> {
        let item = self.sequence.get(self.position)?;
        self.position += 1;
        self.timestamp = item.0;
        Some(item)
    }

    pub fn rewind(&mut self) {
        self.position = 0;
        self.timestamp = 0;
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.sequence.len()
    }
}
