//! Duplicate detection: forms on the same ballot whose final tallies are identical.
//!
//! A pure query over loaded forms; it takes no locks and mutates nothing.
use std::collections::{BTreeMap, BTreeSet};

use super::context::FormContext;
use super::records::EntryVersion;
use super::error::TallyError;

/// The sorted `(candidate, votes)` vector of a form's active final results.
/// `None` when the form has no final results yet.
pub fn tally_vector(ctx: &FormContext) -> Option<Vec<(u32, u64)>> {
    let vector: Vec<(u32, u64)> = ctx
        .active_results(EntryVersion::Final)
        .iter()
        .map(|r| (r.candidate_id, r.votes))
        .collect();
    if vector.is_empty() { None } else { Some(vector) }
}

/// Hash of the CBOR encoded tally vector, equal iff the vectors are identical.
pub fn tally_fingerprint(ctx: &FormContext) -> Result<Option<String>, TallyError> {
    match tally_vector(ctx) {
        Some(vector) => {
            let encoded = minicbor::to_vec(&vector)?;
            Ok(Some(sha256::digest(&encoded)))
        }
        None => Ok(None),
    }
}

/// Ids of every form in `tally_id` (optionally restricted to one ballot)
/// that shares its final tally with at least one other form on its ballot.
/// Archived and non-archived forms are both considered.
pub fn find_duplicates(
    forms: &[FormContext],
    tally_id: u32,
    ballot_id: Option<u32>,
) -> Result<BTreeSet<String>, TallyError> {
    let mut groups: BTreeMap<(u32, String), Vec<&str>> = BTreeMap::new();

    for ctx in forms {
        if ctx.form.tally_id != tally_id {
            continue;
        }
        if ballot_id.is_some_and(|b| b != ctx.form.ballot_id) {
            continue;
        }
        if let Some(fingerprint) = tally_fingerprint(ctx)? {
            groups
                .entry((ctx.form.ballot_id, fingerprint))
                .or_default()
                .push(ctx.form_id());
        }
    }

    Ok(groups
        .into_values()
        .filter(|ids| ids.len() > 1)
        .flatten()
        .map(str::to_string)
        .collect())
}
