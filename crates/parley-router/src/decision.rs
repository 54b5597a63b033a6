//! Decision engine
//!
//! Pure functions over an [`EvaluationSet`]. No I/O, no clocks: the same set
//! and thresholds always produce the same outcome, whatever order the
//! reports arrived in.

use parley_core::{AssignmentDecision, EvaluationReport, EvaluationSet, Thresholds, WorkerId};

/// What to do with a set of initial evaluations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// Confident enough to assign right away
    Assign(WorkerId),
    /// Someone is plausible but nobody is convincing; discuss
    Negotiate,
    /// No report reaches the minimum confidence (or there are no reports)
    NoConfidentWorker,
}

/// Classify the initial evaluations of a task
pub fn decide(set: &EvaluationSet, thresholds: &Thresholds) -> DecisionOutcome {
    match set.best() {
        Some(best)
            if best.confidence >= thresholds.discussion_threshold
                && best.confidence >= thresholds.min_confidence =>
        {
            DecisionOutcome::Assign(best.worker.clone())
        }
        Some(best) if best.confidence >= thresholds.min_confidence => DecisionOutcome::Negotiate,
        _ => DecisionOutcome::NoConfidentWorker,
    }
}

/// Turn a final evaluation set into the decision that gets committed
///
/// The best report wins if it reaches `min_confidence`; otherwise the
/// highest bid (if any) is recorded for the submitter's benefit.
pub fn finalize(set: &EvaluationSet, thresholds: &Thresholds) -> AssignmentDecision {
    match set.best() {
        Some(best) if best.confidence >= thresholds.min_confidence => {
            AssignmentDecision::Assigned {
                worker: best.worker.clone(),
                confidence: best.confidence,
            }
        }
        best => AssignmentDecision::NoConfidentWorker {
            highest: best.map(EvaluationReport::bid),
        },
    }
}

/// Whether negotiation can stop early
pub fn meets_threshold(set: &EvaluationSet, thresholds: &Thresholds) -> bool {
    set.best()
        .is_some_and(|best| best.confidence >= thresholds.discussion_threshold)
}
