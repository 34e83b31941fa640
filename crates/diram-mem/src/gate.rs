//! Epoch constraint gate.
//!
//! A [`HeapContext`] counts allocation events within one epoch. It is an
//! explicit value owned by one thread of execution (or one simulated thread in
//! tests), never shared ambient state. N contexts may each spend a full budget
//! in the same epoch.

use crate::error::{AllocError, Result};

/// ε reached when a context has used all of its events.
pub const EPSILON_LIMIT: f64 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub struct HeapContext {
    command_epoch: Option<u64>,
    event_count: u32,
    max_events: u32,
}

impl HeapContext {
    pub fn new(max_events: u32) -> Self {
        Self {
            command_epoch: None,
            event_count: 0,
            max_events: max_events.max(1),
        }
    }

    /// Admit one event in `epoch`. Returns the event count including this one.
    ///
    /// A change of epoch resets the count before the limit is checked.
    pub fn admit(&mut self, epoch: u64) -> Result<u32> {
        if self.command_epoch != Some(epoch) {
            self.command_epoch = Some(epoch);
            self.event_count = 0;
        }
        if self.event_count >= self.max_events {
            return Err(AllocError::ConstraintViolation {
                epoch,
                events: self.event_count,
                max: self.max_events,
            });
        }
        self.event_count += 1;
        Ok(self.event_count)
    }

    /// Undo the most recent admission (underlying allocation failed).
    pub fn rollback(&mut self) {
        self.event_count = self.event_count.saturating_sub(1);
    }

    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    pub fn max_events(&self) -> u32 {
        self.max_events
    }

    pub fn command_epoch(&self) -> Option<u64> {
        self.command_epoch
    }

    /// Events used over max events, scaled so a full context sits at
    /// [`EPSILON_LIMIT`].
    pub fn epsilon(&self) -> f64 {
        EPSILON_LIMIT * f64::from(self.event_count) / f64::from(self.max_events)
    }
}
