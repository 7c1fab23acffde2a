//! Priority lanes
//!
//! Two FIFO queues of batches. The drain loop always serves `High` before
//! `Normal`; a preempted `Normal` batch goes back to the front of its lane so
//! its cursor is resumed before any later batch.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::token::TokenBatch;

/// Which queue a batch is delivered to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Served first; may preempt `Normal` at token boundaries
    High,
    /// Ordinary terminal output
    Normal,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
        }
    }
}

/// The pair of lanes owned by the executor
pub struct PriorityLanes<T> {
    high: VecDeque<TokenBatch<T>>,
    normal: VecDeque<TokenBatch<T>>,
}

impl<T> Default for PriorityLanes<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityLanes<T> {
    /// Create empty lanes
    #[must_use]
    pub fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
        }
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<TokenBatch<T>> {
        match lane {
            Lane::High => &mut self.high,
            Lane::Normal => &mut self.normal,
        }
    }

    /// Append a batch to the back of `lane`
    pub fn push_back(&mut self, lane: Lane, batch: TokenBatch<T>) {
        self.lane_mut(lane).push_back(batch);
    }

    /// Return a partially executed batch to the front of `lane`
    pub fn push_front(&mut self, lane: Lane, batch: TokenBatch<T>) {
        self.lane_mut(lane).push_front(batch);
    }

    /// Oldest batch of the first non-empty lane
    pub fn pop_next(&mut self) -> Option<(Lane, TokenBatch<T>)> {
        if let Some(batch) = self.high.pop_front() {
            return Some((Lane::High, batch));
        }
        self.normal.pop_front().map(|batch| (Lane::Normal, batch))
    }

    /// Whether a high-priority batch is waiting
    #[must_use]
    pub fn has_high(&self) -> bool {
        !self.high.is_empty()
    }

    /// Number of batches waiting in `lane`
    #[must_use]
    pub fn len(&self, lane: Lane) -> usize {
        match lane {
            Lane::High => self.high.len(),
            Lane::Normal => self.normal.len(),
        }
    }

    /// Whether both lanes are empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty()
    }

    /// Drop every batch without executing it, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.high.len() + self.normal.len();
        self.high.clear();
        self.normal.clear();
        dropped
    }
}
