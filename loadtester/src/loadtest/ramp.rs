//! Ramp scheduling
//!
//! Spreads tester creation over time at a fixed rate so a run does not open
//! every connection in the same instant.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Offsets are capped so absurdly low rates stay representable
const MAX_OFFSET: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One scheduled tester start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampEntry {
    pub index: usize,
    /// Delay from the start of the ramp
    pub offset: Duration,
}

/// Start times for `count` testers at `rate` testers per second
#[derive(Debug, Clone)]
pub struct RampSchedule {
    entries: Vec<RampEntry>,
    cursor: usize,
}

impl RampSchedule {
    /// Build a schedule. A rate that is zero, negative or NaN starts every
    /// tester immediately.
    pub fn new(count: usize, rate: f64) -> Self {
        let immediate = rate.is_nan() || rate <= 0.0;
        let entries = (0..count)
            .map(|index| RampEntry {
                index,
                offset: if immediate {
                    Duration::ZERO
                } else {
                    offset_for(index, rate)
                },
            })
            .collect();
        Self { entries, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RampEntry] {
        &self.entries
    }

    /// Entries not yet emitted
    pub fn remaining(&self) -> usize {
        self.entries.len() - self.cursor
    }

    /// Offset of the last entry
    pub fn span(&self) -> Duration {
        self.entries.last().map(|e| e.offset).unwrap_or_default()
    }

    /// Emit the next entry, advancing the cursor
    pub fn next_entry(&mut self) -> Option<RampEntry> {
        let entry = self.entries.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(entry)
    }

    /// Emit the next entry if it is due at `now` for a ramp started at `started`
    pub fn next_due(&mut self, started: Instant, now: Instant) -> Option<RampEntry> {
        let entry = self.entries.get(self.cursor)?;
        if started + entry.offset > now {
            return None;
        }
        self.next_entry()
    }

    /// Call `launch` for every remaining entry at its scheduled time.
    ///
    /// Entries that are already overdue are launched back to back. Returns
    /// the number launched, which is short of the schedule only when
    /// `cancel` fired first.
    pub async fn drive<F>(&mut self, started: Instant, cancel: &CancellationToken, mut launch: F) -> usize
    where
        F: FnMut(RampEntry),
    {
        let mut launched = 0;
        while let Some(&entry) = self.entries.get(self.cursor) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(launched, remaining = self.remaining(), "Ramp cancelled");
                    break;
                }
                _ = tokio::time::sleep_until(started + entry.offset) => {}
            }
            self.cursor += 1;
            launched += 1;
            debug!(index = entry.index, offset_ms = entry.offset.as_millis() as u64, "Ramp step");
            launch(entry);
        }
        launched
    }
}

fn offset_for(index: usize, rate: f64) -> Duration {
    let secs = index as f64 / rate;
    if !secs.is_finite() || secs >= MAX_OFFSET.as_secs_f64() {
        return MAX_OFFSET;
    }
    Duration::from_secs_f64(secs)
}
