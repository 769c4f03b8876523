//! FIFO buffering of sensor-data batches between producers and exporters.
//!
//! A strategy persists pushed batches as a unit, hands them out through a
//! *stable* `peek` (repeated calls return identical prefixes) and discards
//! them only on an explicit `pop` — the exporter pops after the server has
//! confirmed the shipment, which is what makes delivery at-least-once.

mod buffer;
mod journal_strategy;
mod recovery;

pub use buffer::{BufferStat, Entry, FileBuffer, format_entries, parse_entry, scan_recoverable};
pub use journal_strategy::JournalQueuingStrategy;
pub use recovery::RecoverableJournalQueuingStrategy;

use crate::io::WriteError;
use crate::journal::JournalError;
use gw_protocol::SensorData;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("malformed entry: {0}")]
    Malformed(String),
    #[error("digest mismatch: {0}")]
    DigestMismatch(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// QueuingStrategy
// ---------------------------------------------------------------------------

pub trait QueuingStrategy: Send {
    /// True when nothing is queued.
    fn empty(&mut self) -> bool;

    /// Persist a batch as a unit.
    fn push(&mut self, data: &[SensorData]) -> Result<(), StrategyError>;

    /// Append up to `count` of the oldest queued items to `out` without
    /// consuming them.  Stable: repeated calls return identical prefixes
    /// until `pop` advances the queue.
    fn peek(&mut self, out: &mut Vec<SensorData>, count: usize) -> Result<usize, StrategyError>;

    /// Discard the oldest `count` previously peeked items.
    fn pop(&mut self, count: usize) -> Result<(), StrategyError>;
}

// ---------------------------------------------------------------------------
// In-memory variant
// ---------------------------------------------------------------------------

/// Volatile strategy backed by a vector; loses everything on restart.
#[derive(Debug, Default)]
pub struct InMemoryQueuingStrategy {
    queue: Vec<SensorData>,
}

impl InMemoryQueuingStrategy {
    pub fn new() -> InMemoryQueuingStrategy {
        InMemoryQueuingStrategy::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl QueuingStrategy for InMemoryQueuingStrategy {
    fn empty(&mut self) -> bool {
        self.queue.is_empty()
    }

    fn push(&mut self, data: &[SensorData]) -> Result<(), StrategyError> {
        self.queue.extend_from_slice(data);
        Ok(())
    }

    fn peek(&mut self, out: &mut Vec<SensorData>, count: usize) -> Result<usize, StrategyError> {
        let n = count.min(self.queue.len());
        out.extend(self.queue.iter().take(n).cloned());
        Ok(n)
    }

    fn pop(&mut self, count: usize) -> Result<(), StrategyError> {
        let n = count.min(self.queue.len());
        self.queue.drain(..n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_protocol::{DeviceID, SensorValue};

    fn data(n: u64) -> SensorData {
        SensorData::new(
            DeviceID::from_raw(0xa300_0000_0000_0000 + n),
            n,
            vec![SensorValue::new(0, n as f64)],
        )
    }

    #[test]
    fn peek_is_stable_until_pop() {
        let mut strategy = InMemoryQueuingStrategy::new();
        strategy.push(&[data(1), data(2), data(3)]).unwrap();

        let mut first = Vec::new();
        let mut second = Vec::new();
        assert_eq!(strategy.peek(&mut first, 2).unwrap(), 2);
        assert_eq!(strategy.peek(&mut second, 2).unwrap(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn pop_advances_past_the_peeked_prefix() {
        let mut strategy = InMemoryQueuingStrategy::new();
        strategy.push(&[data(1), data(2), data(3)]).unwrap();

        let mut long = Vec::new();
        strategy.peek(&mut long, 3).unwrap();

        strategy.pop(1).unwrap();
        let mut rest = Vec::new();
        strategy.peek(&mut rest, 2).unwrap();
        assert_eq!(rest.as_slice(), &long[1..3]);
    }

    #[test]
    fn empty_after_everything_is_popped() {
        let mut strategy = InMemoryQueuingStrategy::new();
        strategy.push(&[data(1)]).unwrap();
        assert!(!strategy.empty());
        strategy.pop(1).unwrap();
        assert!(strategy.empty());
    }

    #[test]
    fn peek_beyond_the_queue_returns_what_exists() {
        let mut strategy = InMemoryQueuingStrategy::new();
        strategy.push(&[data(1)]).unwrap();
        let mut out = Vec::new();
        assert_eq!(strategy.peek(&mut out, 10).unwrap(), 1);
    }
}
