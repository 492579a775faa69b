//! Result versioning: which result rows are a form's canonical tally.
use std::collections::BTreeMap;

use super::context::FormContext;
use super::form::{Ballot, FormState, TimeStamp};
use super::records::EntryVersion;
use super::error::IntegrityError;

/// Contributing archived forms and their summed votes for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteTotal {
    pub count: usize,
    pub votes: u64,
}

/// Mark the active final results as the canonical tally.
///
/// Every ballot candidate must have exactly one active final result.
/// Returns the number of finalized rows, or 0 when already finalized.
pub fn finalize(ctx: &mut FormContext, ballot: &Ballot) -> Result<usize, IntegrityError> {
    if ctx.form.ballot_id != ballot.id {
        return Err(IntegrityError::BallotMismatch {
            form_id: ctx.form.id.clone(),
            expected: ctx.form.ballot_id,
            found: ballot.id,
        });
    }
    if ctx.form.is_finalized() {
        return Ok(0);
    }
    for candidate in &ballot.candidates {
        if ctx.active_result(candidate.id, EntryVersion::Final)?.is_none() {
            return Err(IntegrityError::MissingResult {
                form_id: ctx.form.id.clone(),
                candidate_id: candidate.id,
                entry: EntryVersion::Final.as_str(),
            });
        }
    }
    ctx.form.finalized_at = Some(TimeStamp::new());
    Ok(ballot.candidates.len())
}

/// Deactivate every result and reconciliation row of the form. Idempotent.
pub fn deactivate_all(ctx: &mut FormContext) -> (usize, usize) {
    let results = ctx.results.deactivate_all();
    let reconciliations = ctx.reconciliations.deactivate_all();
    (results, reconciliations)
}

/// Active final results for `candidate_id` across the archived forms in `forms`.
pub fn compute_votes(
    candidate_id: u32,
    forms: &[FormContext],
) -> Result<VoteTotal, IntegrityError> {
    let mut total = VoteTotal::default();
    for ctx in forms
        .iter()
        .filter(|c| c.form.form_state == FormState::Archived)
    {
        if let Some(result) = ctx.active_result(candidate_id, EntryVersion::Final)? {
            total.count += 1;
            total.votes = total.votes.checked_add(result.votes).ok_or(
                IntegrityError::VoteOverflow {
                    ballot_id: ctx.form.ballot_id,
                    candidate_id,
                },
            )?;
        }
    }
    Ok(total)
}

/// Vote totals for every candidate on `ballot`.
///
/// Each archived form contributes one row per candidate, so all candidates
/// must report the same count. A mismatch is surfaced, never averaged.
pub fn compute_ballot_votes(
    ballot: &Ballot,
    forms: &[FormContext],
) -> Result<BTreeMap<u32, VoteTotal>, IntegrityError> {
    let on_ballot: Vec<FormContext> = forms
        .iter()
        .filter(|c| c.form.ballot_id == ballot.id)
        .cloned()
        .collect();

    let mut totals = BTreeMap::new();
    for candidate in &ballot.candidates {
        totals.insert(candidate.id, compute_votes(candidate.id, &on_ballot)?);
    }

    let mut counts: Vec<usize> = totals.values().map(|t| t.count).collect();
    counts.dedup();
    if counts.len() > 1 {
        return Err(IntegrityError::ResultCountMismatch {
            ballot_id: ballot.id,
            counts: totals.iter().map(|(id, t)| (*id, t.count)).collect(),
        });
    }
    Ok(totals)
}
