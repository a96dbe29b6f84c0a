//! Sliding-window failure tracking for candidate chains.

use std::time::{Duration, Instant};

/// Counts a streak of failures and reports failure only once the streak
/// has lasted longer than `threshold`.
///
/// A streak with no update for longer than `threshold` starts over on the
/// next failure; a streak idle for ten thresholds is forgotten entirely.
#[derive(Debug, Clone)]
pub struct FailStat {
    first: Option<Instant>,
    update: Option<Instant>,
    threshold: Duration,
}

impl FailStat {
    pub fn new(threshold: Duration) -> Self {
        Self {
            first: None,
            update: None,
            threshold,
        }
    }

    /// Record a failure. Returns false once the streak has outlived the threshold.
    pub fn inc(&mut self) -> bool {
        self.inc_at(Instant::now())
    }

    pub fn inc_at(&mut self, now: Instant) -> bool {
        if let Some(update) = self.update {
            if now.saturating_duration_since(update) > self.threshold {
                self.clear();
                return false;
            }
        }
        let first = *self.first.get_or_insert(now);
        self.update = Some(now);
        now.saturating_duration_since(first) <= self.threshold
    }

    pub fn is_fail(&mut self) -> bool {
        self.is_fail_at(Instant::now())
    }

    pub fn is_fail_at(&mut self, now: Instant) -> bool {
        let (Some(first), Some(update)) = (self.first, self.update) else {
            return false;
        };
        if now.saturating_duration_since(update) > self.threshold * 10 {
            self.clear();
            return false;
        }
        update.saturating_duration_since(first) > self.threshold
    }

    pub fn clear(&mut self) {
        self.first = None;
        self.update = None;
    }
}
