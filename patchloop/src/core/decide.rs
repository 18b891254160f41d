//! The Decide stage: map one iteration's evidence to an outcome.

use crate::core::stuck::{StuckThresholds, StuckTracker};
use crate::core::types::{FailureMeta, IterationOutcome};

/// What the test run and the test report said about an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestVerdict {
    pub exit_code: i32,
    pub report_passed: bool,
    pub all_criteria_met: bool,
}

impl TestVerdict {
    pub fn verified(&self) -> bool {
        self.exit_code == 0 && self.report_passed && self.all_criteria_met
    }
}

/// Decide after tests ran.
///
/// A failing exit code feeds the stuck tracker with the failure signature and
/// the changed files; a zero exit code clears it.
pub fn decide(
    verdict: &TestVerdict,
    failure: Option<&FailureMeta>,
    changed_files: &[String],
    tracker: &mut StuckTracker,
    thresholds: &StuckThresholds,
) -> IterationOutcome {
    if verdict.verified() {
        tracker.reset();
        return IterationOutcome::EarlyStop;
    }
    match failure {
        Some(meta) if verdict.exit_code != 0 => {
            tracker.observe(&meta.signature, changed_files);
            if tracker.is_stuck(&meta.kind, thresholds) {
                IterationOutcome::Stuck
            } else {
                IterationOutcome::Continue
            }
        }
        _ => {
            tracker.reset();
            IterationOutcome::Continue
        }
    }
}

/// Decide after a policy check reverted the iteration. Repeating the same
/// violation on the same files escalates to `Stuck`.
pub fn decide_policy_revert(
    failure: &FailureMeta,
    changed_files: &[String],
    tracker: &mut StuckTracker,
    thresholds: &StuckThresholds,
) -> IterationOutcome {
    tracker.observe(&failure.signature, changed_files);
    if tracker.is_stuck(&failure.kind, thresholds) {
        IterationOutcome::Stuck
    } else {
        IterationOutcome::PolicyReverted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureKind;

    fn failure(kind: FailureKind, signature: &str) -> FailureMeta {
        FailureMeta {
            kind,
            hints: Vec::new(),
            signature: signature.to_string(),
            matched_rule_id: None,
        }
    }

    fn failing() -> TestVerdict {
        TestVerdict {
            exit_code: 1,
            report_passed: false,
            all_criteria_met: false,
        }
    }

    #[test]
    fn early_stop_needs_exit_zero_report_and_criteria() {
        let thresholds = StuckThresholds::default();
        let mut tracker = StuckTracker::new();
        let ok = TestVerdict {
            exit_code: 0,
            report_passed: true,
            all_criteria_met: true,
        };
        assert_eq!(
            decide(&ok, None, &[], &mut tracker, &thresholds),
            IterationOutcome::EarlyStop
        );

        let unmet = TestVerdict {
            all_criteria_met: false,
            ..ok
        };
        assert_eq!(
            decide(&unmet, None, &[], &mut tracker, &thresholds),
            IterationOutcome::Continue
        );

        let lying_report = TestVerdict { exit_code: 2, ..ok };
        let meta = failure(FailureKind::Unknown, "unknown:1");
        assert_eq!(
            decide(&lying_report, Some(&meta), &[], &mut tracker, &thresholds),
            IterationOutcome::Continue
        );
    }

    #[test]
    fn repeated_failure_on_same_files_becomes_stuck() {
        let thresholds = StuckThresholds::default();
        let mut tracker = StuckTracker::new();
        let files = vec!["a.py".to_string()];
        let meta = failure(FailureKind::Unknown, "unknown:1");

        let outcomes: Vec<_> = (0..3)
            .map(|_| decide(&failing(), Some(&meta), &files, &mut tracker, &thresholds))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                IterationOutcome::Continue,
                IterationOutcome::Continue,
                IterationOutcome::Stuck
            ]
        );
    }

    #[test]
    fn repeated_policy_revert_escalates() {
        let thresholds = StuckThresholds::default();
        let mut tracker = StuckTracker::new();
        let files = vec!["tests/test_a.py".to_string()];
        let meta = failure(FailureKind::PolicyViolation, "policy:abc");
        assert_eq!(
            decide_policy_revert(&meta, &files, &mut tracker, &thresholds),
            IterationOutcome::PolicyReverted
        );
        decide_policy_revert(&meta, &files, &mut tracker, &thresholds);
        assert_eq!(
            decide_policy_revert(&meta, &files, &mut tracker, &thresholds),
            IterationOutcome::Stuck
        );
    }
}
