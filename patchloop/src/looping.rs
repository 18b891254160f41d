//! Multi-iteration loop over [`run_step`].

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::types::IterationOutcome;
use crate::finalize::RunFacts;
use crate::run::RunContext;
use crate::start::Started;
use crate::step::{LoopState, run_step};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Tests pass and every acceptance criterion is met.
    Verified,
    /// The same failure repeated with the same changes.
    Stuck,
    /// `max_iterations` ran without verification.
    Exhausted,
}

/// Run iterations until one is terminal or the request's ceiling is reached.
///
/// Records are appended to `facts` as they complete, so a fatal error in a
/// later iteration still leaves the earlier ones in the summary.
#[instrument(skip_all, fields(max_iterations = started.request.max_iterations))]
pub fn run_loop(ctx: &RunContext<'_>, started: &Started, facts: &mut RunFacts) -> Result<LoopStop> {
    let mut state = LoopState::new(started.lock.clone());
    for index in 1..=started.request.max_iterations {
        let record = run_step(ctx, started, index, &mut state)?;
        let outcome = record.outcome;
        facts.records.push(record);
        match outcome {
            IterationOutcome::EarlyStop => return Ok(LoopStop::Verified),
            IterationOutcome::Stuck => return Ok(LoopStop::Stuck),
            IterationOutcome::Continue | IterationOutcome::NoChange | IterationOutcome::PolicyReverted => {}
        }
    }
    info!("iteration ceiling reached");
    Ok(LoopStop::Exhausted)
}
