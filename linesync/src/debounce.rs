//! Trailing-edge debounce for outbound saves.
//!
//! The debouncer holds only a deadline; the session task sleeps until it
//! and then asks [`SaveDebouncer::fire_if_due`]. Every edit pushes the
//! deadline out by the full quiet period, so a burst of keystrokes yields
//! a single fire after the last one.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SaveDebouncer {
    quiet_period: Duration,
    deadline: Option<Instant>,
    /// Edits absorbed since the last fire.
    pending_edits: u32,
}

impl SaveDebouncer {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            deadline: None,
            pending_edits: 0,
        }
    }

    /// Record an edit at `now`, (re)starting the quiet period.
    pub fn on_local_edit(&mut self, now: Instant) {
        self.deadline = Some(now + self.quiet_period);
        self.pending_edits = self.pending_edits.saturating_add(1);
    }

    /// When the timer will fire, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn pending_edits(&self) -> u32 {
        self.pending_edits
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Disarm without firing.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.pending_edits = 0;
    }

    /// Disarm and return the number of coalesced edits if the deadline has
    /// passed at `now`.
    pub fn fire_if_due(&mut self, now: Instant) -> Option<u32> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                let edits = self.pending_edits;
                self.cancel();
                Some(edits)
            }
            _ => None,
        }
    }
}
