//! Global atomic counters for Tasador observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (end of a pipeline run, server shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    runs_recorded: AtomicU64,
    logging_fallbacks: AtomicU64,
    versions_skipped: AtomicU64,
    promotions_applied: AtomicU64,
    partial_promotions: AtomicU64,
    predictions_served: AtomicU64,
    predictions_refused: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_recorded: AtomicU64::new(0),
            logging_fallbacks: AtomicU64::new(0),
            versions_skipped: AtomicU64::new(0),
            promotions_applied: AtomicU64::new(0),
            partial_promotions: AtomicU64::new(0),
            predictions_served: AtomicU64::new(0),
            predictions_refused: AtomicU64::new(0),
        }
    }

    counter!(inc_runs_recorded, runs_recorded, runs_recorded);
    counter!(inc_logging_fallbacks, logging_fallbacks, logging_fallbacks);
    counter!(inc_versions_skipped, versions_skipped, versions_skipped);
    counter!(inc_promotions_applied, promotions_applied, promotions_applied);
    counter!(inc_partial_promotions, partial_promotions, partial_promotions);
    counter!(inc_predictions_served, predictions_served, predictions_served);
    counter!(inc_predictions_refused, predictions_refused, predictions_refused);

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_recorded = self.runs_recorded(),
            logging_fallbacks = self.logging_fallbacks(),
            versions_skipped = self.versions_skipped(),
            promotions_applied = self.promotions_applied(),
            partial_promotions = self.partial_promotions(),
            predictions_served = self.predictions_served(),
            predictions_refused = self.predictions_refused(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.runs_recorded,
            &self.logging_fallbacks,
            &self.versions_skipped,
            &self.promotions_applied,
            &self.partial_promotions,
            &self.predictions_served,
            &self.predictions_refused,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.runs_recorded(), 0);
        m.inc_runs_recorded();
        m.inc_runs_recorded();
        assert_eq!(m.runs_recorded(), 2);

        m.inc_partial_promotions();
        assert_eq!(m.partial_promotions(), 1);
        assert_eq!(m.promotions_applied(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_logging_fallbacks();
        m.inc_versions_skipped();
        m.inc_predictions_served();
        m.inc_predictions_refused();
        m.reset();
        assert_eq!(m.logging_fallbacks(), 0);
        assert_eq!(m.versions_skipped(), 0);
        assert_eq!(m.predictions_served(), 0);
        assert_eq!(m.predictions_refused(), 0);
    }
}
