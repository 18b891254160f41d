//! Stuck detection across iterations.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::types::FailureKind;

/// Repeat thresholds; a kind not listed uses `default`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckThresholds {
    pub default: u32,
    /// Keyed by failure tag (`float_precision_mismatch`, ...).
    pub per_kind: BTreeMap<String, u32>,
}

impl Default for StuckThresholds {
    fn default() -> Self {
        let mut per_kind = BTreeMap::new();
        per_kind.insert(FailureKind::FloatPrecisionMismatch.as_str().to_string(), 3);
        Self {
            default: 2,
            per_kind,
        }
    }
}

impl StuckThresholds {
    pub fn for_kind(&self, kind: &FailureKind) -> u32 {
        self.per_kind
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default)
    }
}

/// Counts consecutive iterations with the same failure and the same changes.
#[derive(Debug, Clone, Default)]
pub struct StuckTracker {
    previous: Option<(String, BTreeSet<String>)>,
    count: u32,
}

impl StuckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Record a failed iteration. The counter grows only when both the
    /// signature and the changed-file set equal the previous observation.
    pub fn observe(&mut self, signature: &str, changed_files: &[String]) -> u32 {
        let files: BTreeSet<String> = changed_files.iter().cloned().collect();
        let repeated = matches!(
            &self.previous,
            Some((prev_sig, prev_files)) if prev_sig == signature && *prev_files == files
        );
        self.count = if repeated { self.count + 1 } else { 0 };
        self.previous = Some((signature.to_string(), files));
        self.count
    }

    /// A passing run clears history.
    pub fn reset(&mut self) {
        self.previous = None;
        self.count = 0;
    }

    pub fn is_stuck(&self, kind: &FailureKind, thresholds: &StuckThresholds) -> bool {
        self.count > 0 && self.count >= thresholds.for_kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn counter_grows_only_on_identical_signature_and_files() {
        let mut tracker = StuckTracker::new();
        assert_eq!(tracker.observe("unknown:aa", &files(&["a.py"])), 0);
        assert_eq!(tracker.observe("unknown:aa", &files(&["a.py"])), 1);
        assert_eq!(tracker.observe("unknown:aa", &files(&["a.py"])), 2);

        // Same symptom, real progress on different files.
        assert_eq!(tracker.observe("unknown:aa", &files(&["a.py", "b.py"])), 0);
        // Different failure, same files.
        assert_eq!(tracker.observe("unknown:bb", &files(&["a.py", "b.py"])), 0);
    }

    #[test]
    fn file_order_does_not_matter() {
        let mut tracker = StuckTracker::new();
        tracker.observe("sig", &files(&["b", "a"]));
        assert_eq!(tracker.observe("sig", &files(&["a", "b"])), 1);
    }

    #[test]
    fn float_mismatch_tolerates_more_repeats() {
        let thresholds = StuckThresholds::default();
        let mut tracker = StuckTracker::new();
        for _ in 0..3 {
            tracker.observe("float_precision_mismatch:x", &files(&["calc.py"]));
        }
        assert_eq!(tracker.count(), 2);
        assert!(tracker.is_stuck(&FailureKind::Unknown, &thresholds));
        assert!(!tracker.is_stuck(&FailureKind::FloatPrecisionMismatch, &thresholds));
        tracker.observe("float_precision_mismatch:x", &files(&["calc.py"]));
        assert!(tracker.is_stuck(&FailureKind::FloatPrecisionMismatch, &thresholds));
    }
}
