//! Waiting list of measurements.
//!
//! Entries are appended at the tail and taken from the head. Any pending
//! entry can be deleted by position; the positions behind it shift up.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::settings::MeasurementSettings;

/// One pending measurement.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    /// Stable id, unique for the lifetime of the queue
    pub id: u64,
    pub settings: MeasurementSettings,
    /// Expected wall time
    #[serde(with = "humantime_serde")]
    pub estimated: Duration,
    pub enqueued_at: DateTime<Local>,
}

/// Expected start and finish of a pending entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryTiming {
    pub id: u64,
    pub name: String,
    /// Offset from now
    #[serde(with = "humantime_serde")]
    pub starts_in: Duration,
    #[serde(with = "humantime_serde")]
    pub finishes_in: Duration,
}

/// Bounded FIFO of measurements waiting to run.
#[derive(Debug)]
pub struct MeasurementQueue {
    entries: VecDeque<QueueEntry>,
    max_entries: usize,
    next_id: u64,
}

impl MeasurementQueue {
    /// Empty queue holding at most `max_entries`.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
            next_id: 1,
        }
    }

    /// Append at the tail. Returns the new id and whether the queue was
    /// empty before.
    pub fn push(
        &mut self,
        settings: MeasurementSettings,
        estimated: Duration,
    ) -> AppResult<(u64, bool)> {
        if self.entries.len() >= self.max_entries {
            return Err(DaqError::QueueFull(self.max_entries));
        }
        let was_empty = self.entries.is_empty();
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(QueueEntry {
            id,
            settings,
            estimated,
            enqueued_at: Local::now(),
        });
        Ok((id, was_empty))
    }

    /// Take the head entry.
    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Delete the entry at `position` (0 = head).
    pub fn remove_at(&mut self, position: usize) -> AppResult<QueueEntry> {
        self.entries
            .remove(position)
            .ok_or(DaqError::QueueIndexOutOfRange(position))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Pending entries, head first.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Sum of the pending estimates.
    pub fn total_estimated(&self) -> Duration {
        self.entries
            .iter()
            .fold(Duration::ZERO, |acc, e| acc.saturating_add(e.estimated))
    }

    /// Start and finish offsets of every pending entry, given that the
    /// running sweep needs `remaining_current` more.
    pub fn completion_times(&self, remaining_current: Duration) -> Vec<EntryTiming> {
        let mut clock = remaining_current;
        self.entries
            .iter()
            .map(|e| {
                let starts_in = clock;
                clock = clock.saturating_add(e.estimated);
                EntryTiming {
                    id: e.id,
                    name: e.settings.name.clone(),
                    starts_in,
                    finishes_in: clock,
                }
            })
            .collect()
    }
}
