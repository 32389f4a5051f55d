//! Heatgrid delta sequencer.
//!
//! Turns one submission of raw samples plus the user's open state into the ordered
//! Inc/Dec operations a stateless aggregator can apply in receipt order. For `n`
//! samples the output holds `2n - 1` operations, or `2n` when a prior state is closed.

#![forbid(unsafe_code)]

use heatgrid_core::{Action, CoreError, DeltaOp, Sample, SpatialIndex, UserLastState};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SequenceError {
    #[error("empty sample batch")]
    EmptyBatch,
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result of sequencing one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequenced {
    /// Operations in construction order; never re-sorted before dispatch.
    pub ops: Vec<DeltaOp>,
    /// Last entered cell, left open for the next submission to close.
    pub next_state: UserLastState,
}

/// Sequence `samples` for `user_id`, closing `prior` first when present.
///
/// Every sample is validated before anything is emitted, so a bad category or
/// coordinate anywhere in the batch yields no operations at all.
pub fn sequence(
    index: &dyn SpatialIndex,
    user_id: &str,
    samples: &[Sample],
    prior: Option<&UserLastState>,
) -> Result<Sequenced, SequenceError> {
    let mut entered = Vec::with_capacity(samples.len());
    for s in samples {
        let category = s.category()?;
        let cell = index.cell_of(s.longitude, s.latitude)?;
        entered.push(DeltaOp { cell, ts: s.timestamp, action: Action::increment(category) });
    }
    // Stable: equal timestamps keep submission order, which decides the cell left open.
    entered.sort_by_key(|op| op.ts);

    let last = *entered.last().ok_or(SequenceError::EmptyBatch)?;
    let mut ops = Vec::with_capacity(2 * entered.len());
    if let Some(prior) = prior {
        ops.push(prior.compensation(entered[0].ts));
    }
    let mut vacated: Option<DeltaOp> = None;
    for op in entered {
        if let Some(prev) = vacated {
            ops.push(DeltaOp { cell: prev.cell, ts: op.ts, action: Action::decrement(prev.action.category()) });
        }
        ops.push(op);
        vacated = Some(op);
    }

    debug!(user = %user_id, samples = samples.len(), ops = ops.len(), closed_prior = prior.is_some(), "sequenced batch");
    Ok(Sequenced {
        ops,
        next_state: UserLastState { user_id: user_id.to_string(), cell: last.cell, category: last.action.category() },
    })
}
