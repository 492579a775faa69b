//! The result form state machine.
//!
//! `apply` is pure with respect to storage: it validates the request against
//! the loaded aggregate and returns the next aggregate plus the effects. The
//! caller commits the returned aggregate as one unit, or nothing at all.
use std::collections::BTreeSet;

use super::context::{ActorContext, FormContext, TransitionRecord};
use super::form::{Ballot, FormState, TimeStamp};
use super::quarantine::{self, QuarantineCheck, ReconciliationMetrics};
use super::records::{
    Audit, CandidateResult, EntryVersion, QcSection, QualityControl, ReconciliationData,
    ReconciliationForm,
};
use super::utils::new_uuid_to_bech32;
use super::versioning;
use super::error::{IntegrityError, TallyError, ValidationError};

/// One pass of data entry: the vote for every candidate plus the optional
/// reconciliation section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataEntry {
    pub results: Vec<(u32, u64)>,
    pub reconciliation: Option<ReconciliationData>,
}

/// Corrected values for the entries where the two data entry passes disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Corrections {
    pub results: Vec<(u32, u64)>,
    pub reconciliation: Option<ReconciliationData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearanceResolution {
    /// Discard the entered data and send the form back to data entry.
    Reenter,
    /// Return the form to the state it was in before clearance.
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Receive,
    CompleteIntake,
    SubmitDataEntry(DataEntry),
    Correct(Corrections),
    StartQualityControl,
    ApproveQualityControl,
    RejectQualityControl {
        sections: Vec<QcSection>,
        reject_reason: String,
    },
    AbortQualityControl,
    ConfirmAudit,
    SendToClearance,
    ResolveClearance(ClearanceResolution),
    MarkDuplicateReviewed,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Receive => "receive",
            Action::CompleteIntake => "complete_intake",
            Action::SubmitDataEntry(_) => "submit_data_entry",
            Action::Correct(_) => "correct",
            Action::StartQualityControl => "start_quality_control",
            Action::ApproveQualityControl => "approve_quality_control",
            Action::RejectQualityControl { .. } => "reject_quality_control",
            Action::AbortQualityControl => "abort_quality_control",
            Action::ConfirmAudit => "confirm_audit",
            Action::SendToClearance => "send_to_clearance",
            Action::ResolveClearance(_) => "resolve_clearance",
            Action::MarkDuplicateReviewed => "mark_duplicate_reviewed",
        }
    }

    /// Whether the action is defined for `state` at all.
    pub fn permitted_from(&self, state: FormState) -> bool {
        use FormState::*;
        match self {
            Action::Receive => state == Unsubmitted,
            Action::CompleteIntake => state == Intake,
            Action::SubmitDataEntry(_) => matches!(state, DataEntry1 | DataEntry2),
            Action::Correct(_) => state == Correction,
            Action::StartQualityControl
            | Action::ApproveQualityControl
            | Action::RejectQualityControl { .. }
            | Action::AbortQualityControl => state == QualityControl,
            Action::ConfirmAudit => state == Audit,
            Action::SendToClearance => !matches!(state, Archived | Clearance),
            Action::ResolveClearance(_) => state == Clearance,
            Action::MarkDuplicateReviewed => true,
        }
    }
}

/// Observable consequences of an applied action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StateChanged { from: FormState, to: FormState },
    ResultsRecorded { entry: EntryVersion, count: usize },
    ReconciliationRecorded { entry: EntryVersion },
    ResultsDeactivated(usize),
    ReconciliationsDeactivated(usize),
    QualityControlOpened,
    QualityControlClosed,
    QuarantineSkipped,
    AuditOpened { checks: Vec<String> },
    AuditClosed,
    ResultsFinalized(usize),
    RejectedCountIncremented(u32),
    AuditedCountIncremented(u32),
    SkipQuarantineChecksSet,
    RejectReasonStored,
    DuplicateReviewed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub form_id: String,
    pub previous_state: FormState,
    pub new_state: FormState,
    pub version: u64,
    pub effects: Vec<Effect>,
}

/// Everything outside the aggregate an action may consult.
pub struct TransitionEnv<'a> {
    pub ballot: &'a Ballot,
    pub checks: &'a [QuarantineCheck],
    pub actor: &'a ActorContext,
}

fn illegal(ctx: &FormContext, action: &Action, detail: &'static str) -> TallyError {
    TallyError::IllegalTransition {
        form_id: ctx.form.id.clone(),
        state: ctx.form.form_state,
        action: action.name(),
        detail,
    }
}

/// Apply `action` to `ctx`, returning the next aggregate and its effects.
/// `ctx` itself is never modified.
pub fn apply(
    ctx: &FormContext,
    action: &Action,
    env: &TransitionEnv<'_>,
) -> Result<(FormContext, Vec<Effect>), TallyError> {
    validate_payload(action, env.ballot)?;

    if ctx.form.tally_id != env.actor.tally_id {
        return Err(ValidationError::WrongTally {
            form_tally: ctx.form.tally_id,
            actor_tally: env.actor.tally_id,
        }
        .into());
    }
    if ctx.form.ballot_id != env.ballot.id {
        return Err(IntegrityError::BallotMismatch {
            form_id: ctx.form.id.clone(),
            expected: ctx.form.ballot_id,
            found: env.ballot.id,
        }
        .into());
    }
    if !action.permitted_from(ctx.form.form_state) {
        return Err(illegal(ctx, action, "not a transition out of this state"));
    }
    ctx.check_integrity()?;

    let mut next = ctx.clone();
    let mut effects = vec![];
    let from = ctx.form.form_state;

    match action {
        Action::Receive => next.form.advance(FormState::Intake),
        Action::CompleteIntake => next.form.advance(FormState::DataEntry1),
        Action::SubmitDataEntry(entry) => submit_data_entry(&mut next, entry, env, &mut effects)?,
        Action::Correct(corrections) => correct(&mut next, corrections, env, &mut effects)?,
        Action::StartQualityControl => {
            if next.active_quality_control()?.is_some() {
                return Err(illegal(ctx, action, "a quality control review is already open"));
            }
            let qc = QualityControl::new(new_uuid_to_bech32("qc")?, &env.actor.user);
            next.quality_controls.record(qc);
            effects.push(Effect::QualityControlOpened);
        }
        Action::ApproveQualityControl => {
            if next.active_quality_control()?.is_none() {
                return Err(illegal(ctx, action, "no quality control review is open"));
            }
            approve(&mut next, env, &mut effects)?;
        }
        Action::RejectQualityControl {
            sections,
            reject_reason,
        } => {
            if next.active_quality_control()?.is_none() {
                return Err(illegal(ctx, action, "no quality control review is open"));
            }
            reject(&mut next, sections, reject_reason, env, &mut effects)?;
        }
        Action::AbortQualityControl => {
            if next.active_quality_control()?.is_none() {
                return Err(illegal(ctx, action, "no quality control review is open"));
            }
            close_quality_control(&mut next, &mut effects)?;
        }
        Action::ConfirmAudit => {
            let form_id = next.form.id.clone();
            match next.audits.active_in_mut(&form_id, &())? {
                Some(audit) => audit.active = false,
                None => return Err(illegal(ctx, action, "no audit is pending")),
            }
            effects.push(Effect::AuditClosed);
            deactivate_entries(&mut next, &mut effects);
            next.form.skip_quarantine_checks = true;
            effects.push(Effect::SkipQuarantineChecksSet);
            next.form.advance(FormState::DataEntry1);
        }
        Action::SendToClearance => {
            next.form.duplicate_reviewed = true;
            effects.push(Effect::DuplicateReviewed);
            next.form.advance(FormState::Clearance);
        }
        Action::ResolveClearance(ClearanceResolution::Reenter) => {
            deactivate_entries(&mut next, &mut effects);
            close_quality_control(&mut next, &mut effects)?;
            let form_id = next.form.id.clone();
            if let Some(audit) = next.audits.active_in_mut(&form_id, &())? {
                audit.active = false;
                effects.push(Effect::AuditClosed);
            }
            next.form.rejected_count += 1;
            effects.push(Effect::RejectedCountIncremented(next.form.rejected_count));
            next.form.advance(FormState::DataEntry1);
        }
        Action::ResolveClearance(ClearanceResolution::Restore) => {
            let target = match next.form.previous_form_state {
                Some(state) if !matches!(state, FormState::Clearance | FormState::Archived) => {
                    state
                }
                _ => return Err(illegal(ctx, action, "no state to restore")),
            };
            close_quality_control(&mut next, &mut effects)?;
            next.form.advance(target);
        }
        Action::MarkDuplicateReviewed => {
            next.form.duplicate_reviewed = true;
            effects.push(Effect::DuplicateReviewed);
        }
    }

    let to = next.form.form_state;
    if from != to {
        effects.insert(0, Effect::StateChanged { from, to });
    }
    next.insert_transition(TransitionRecord {
        action: action.name().to_string(),
        user: env.actor.user.clone(),
        from,
        to,
        timestamp: TimeStamp::new(),
    });

    Ok((next, effects))
}

/// Payload checks that need nothing but the request and the ballot.
fn validate_payload(action: &Action, ballot: &Ballot) -> Result<(), ValidationError> {
    match action {
        Action::SubmitDataEntry(entry) => validate_votes(&entry.results, ballot, true),
        Action::Correct(corrections) => validate_votes(&corrections.results, ballot, false),
        Action::RejectQualityControl {
            sections,
            reject_reason,
        } => {
            if sections.is_empty() {
                return Err(ValidationError::NoSectionsRejected);
            }
            if reject_reason.trim().is_empty() {
                return Err(ValidationError::MissingRejectReason);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_votes(
    votes: &[(u32, u64)],
    ballot: &Ballot,
    require_all: bool,
) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for (candidate_id, _) in votes {
        if !ballot.has_candidate(*candidate_id) {
            return Err(ValidationError::UnknownCandidate(*candidate_id));
        }
        if !seen.insert(*candidate_id) {
            return Err(ValidationError::DuplicateCandidate(*candidate_id));
        }
    }
    if require_all {
        if let Some(missing) = ballot.candidates.iter().find(|c| !seen.contains(&c.id)) {
            return Err(ValidationError::MissingCandidate(missing.id));
        }
    }
    Ok(())
}

fn submit_data_entry(
    next: &mut FormContext,
    entry: &DataEntry,
    env: &TransitionEnv<'_>,
    effects: &mut Vec<Effect>,
) -> Result<(), TallyError> {
    let (version, target) = match next.form.form_state {
        FormState::DataEntry1 => (EntryVersion::DataEntry1, FormState::DataEntry2),
        _ => (EntryVersion::DataEntry2, FormState::Correction),
    };
    for (candidate_id, votes) in &entry.results {
        next.results.record(CandidateResult::new(
            new_uuid_to_bech32("result")?,
            *candidate_id,
            *votes,
            version,
            &env.actor.user,
        ));
    }
    effects.push(Effect::ResultsRecorded {
        entry: version,
        count: entry.results.len(),
    });
    if let Some(data) = &entry.reconciliation {
        next.reconciliations.record(ReconciliationForm::new(
            new_uuid_to_bech32("recon")?,
            version,
            data.clone(),
            &env.actor.user,
        ));
        effects.push(Effect::ReconciliationRecorded { entry: version });
    }
    next.form.advance(target);
    Ok(())
}

/// Settle the final values: agreeing entries carry over, disagreeing ones
/// need a correction.
fn correct(
    next: &mut FormContext,
    corrections: &Corrections,
    env: &TransitionEnv<'_>,
    effects: &mut Vec<Effect>,
) -> Result<(), TallyError> {
    let mut finals = Vec::with_capacity(env.ballot.candidates.len());
    for candidate in &env.ballot.candidates {
        let first = entered_votes(next, candidate.id, EntryVersion::DataEntry1)?;
        let second = entered_votes(next, candidate.id, EntryVersion::DataEntry2)?;
        let corrected = corrections
            .results
            .iter()
            .find(|(id, _)| *id == candidate.id)
            .map(|(_, votes)| *votes);

        let votes = match corrected {
            Some(votes) => votes,
            None if first == second => first,
            None => return Err(ValidationError::CorrectionRequired(candidate.id).into()),
        };
        finals.push((candidate.id, votes));
    }

    let first = next
        .active_reconciliation(EntryVersion::DataEntry1)?
        .map(|r| r.data.clone());
    let second = next
        .active_reconciliation(EntryVersion::DataEntry2)?
        .map(|r| r.data.clone());
    let reconciliation = match (&corrections.reconciliation, first, second) {
        (Some(corrected), _, _) => Some(corrected.clone()),
        (None, a, b) if a == b => a,
        _ => return Err(ValidationError::ReconciliationCorrectionRequired.into()),
    };

    for (candidate_id, votes) in &finals {
        next.results.record(CandidateResult::new(
            new_uuid_to_bech32("result")?,
            *candidate_id,
            *votes,
            EntryVersion::Final,
            &env.actor.user,
        ));
    }
    effects.push(Effect::ResultsRecorded {
        entry: EntryVersion::Final,
        count: finals.len(),
    });
    if let Some(data) = reconciliation {
        next.reconciliations.record(ReconciliationForm::new(
            new_uuid_to_bech32("recon")?,
            EntryVersion::Final,
            data,
            &env.actor.user,
        ));
        effects.push(Effect::ReconciliationRecorded {
            entry: EntryVersion::Final,
        });
    }
    next.form.advance(FormState::QualityControl);
    Ok(())
}

fn entered_votes(
    ctx: &FormContext,
    candidate_id: u32,
    entry: EntryVersion,
) -> Result<u64, IntegrityError> {
    ctx.active_result(candidate_id, entry)?
        .map(|r| r.votes)
        .ok_or_else(|| IntegrityError::MissingResult {
            form_id: ctx.form.id.clone(),
            candidate_id,
            entry: entry.as_str(),
        })
}

/// Metrics from the single active final reconciliation, if the form has one.
pub fn reconciliation_metrics(
    ctx: &FormContext,
) -> Result<Option<ReconciliationMetrics>, IntegrityError> {
    Ok(ctx
        .active_reconciliation(EntryVersion::Final)?
        .map(|r| ReconciliationMetrics::from_reconciliation(&r.data, ctx.form.registrants)))
}

/// Run the quarantine checks for `ctx`, unless the form skips them.
pub fn quarantine_triggers(
    ctx: &FormContext,
    checks: &[QuarantineCheck],
) -> Result<Vec<String>, IntegrityError> {
    if ctx.form.skip_quarantine_checks {
        return Ok(vec![]);
    }
    Ok(match reconciliation_metrics(ctx)? {
        Some(metrics) => quarantine::evaluate(checks, &metrics),
        None => vec![],
    })
}

fn approve(
    next: &mut FormContext,
    env: &TransitionEnv<'_>,
    effects: &mut Vec<Effect>,
) -> Result<(), TallyError> {
    let form_id = next.form.id.clone();
    if let Some(qc) = next.quality_controls.active_in_mut(&form_id, &())? {
        qc.pass_all();
    }
    close_quality_control(next, effects)?;

    if next.form.skip_quarantine_checks {
        effects.push(Effect::QuarantineSkipped);
    }
    let fired = quarantine_triggers(next, env.checks)?;

    if fired.is_empty() {
        let finalized = versioning::finalize(next, env.ballot)?;
        effects.push(Effect::ResultsFinalized(finalized));
        next.form.advance(FormState::Archived);
    } else {
        next.audits.record(Audit::new(
            new_uuid_to_bech32("audit")?,
            &env.actor.user,
            fired.clone(),
        ));
        effects.push(Effect::AuditOpened { checks: fired });
        next.form.audited_count += 1;
        effects.push(Effect::AuditedCountIncremented(next.form.audited_count));
        next.form.advance(FormState::Audit);
    }
    Ok(())
}

fn reject(
    next: &mut FormContext,
    sections: &[QcSection],
    reject_reason: &str,
    env: &TransitionEnv<'_>,
    effects: &mut Vec<Effect>,
) -> Result<(), TallyError> {
    let form_id = next.form.id.clone();
    if let Some(qc) = next.quality_controls.active_in_mut(&form_id, &())? {
        for section in sections {
            qc.fail(*section);
        }
    }
    next.form.reject_reason = Some(reject_reason.to_string());
    effects.push(Effect::RejectReasonStored);

    if env.ballot.available_for_release {
        // released ballots go to manual clearance; the review stays open until then
        next.form.advance(FormState::Clearance);
        return Ok(());
    }

    deactivate_entries(next, effects);
    close_quality_control(next, effects)?;
    next.form.rejected_count += 1;
    effects.push(Effect::RejectedCountIncremented(next.form.rejected_count));
    next.form.advance(FormState::DataEntry1);
    Ok(())
}

fn close_quality_control(
    next: &mut FormContext,
    effects: &mut Vec<Effect>,
) -> Result<(), IntegrityError> {
    let form_id = next.form.id.clone();
    if let Some(qc) = next.quality_controls.active_in_mut(&form_id, &())? {
        qc.active = false;
        effects.push(Effect::QualityControlClosed);
    }
    Ok(())
}

fn deactivate_entries(next: &mut FormContext, effects: &mut Vec<Effect>) {
    let (results, reconciliations) = versioning::deactivate_all(next);
    effects.push(Effect::ResultsDeactivated(results));
    effects.push(Effect::ReconciliationsDeactivated(reconciliations));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::ResultForm;
    use crate::quarantine::{Comparison, QuarantineMetric};

    fn ballot(released: bool) -> Ballot {
        Ballot::new(1, 1)
            .set_available_for_release(released)
            .add_candidate(1, "first")
            .add_candidate(2, "second")
    }

    fn checks() -> Vec<QuarantineCheck> {
        vec![QuarantineCheck::new(
            "tampering",
            QuarantineMetric::BallotVariance,
            Comparison::GreaterThan,
            20,
        )]
    }

    fn in_quality_control(expected: u64, counted: u64) -> FormContext {
        let mut ctx = FormContext::new(
            ResultForm::new("123456789", 1, 1).set_form_state(FormState::QualityControl),
        );
        ctx.form.id = "form1".into();
        for (candidate, votes) in [(1, 40), (2, 39)] {
            ctx.results.record(CandidateResult::new(
                format!("r{candidate}"),
                candidate,
                votes,
                EntryVersion::Final,
                "clerk",
            ));
        }
        ctx.reconciliations.record(ReconciliationForm::new(
            "recon".into(),
            EntryVersion::Final,
            ReconciliationData::with_counts(expected, counted),
            "clerk",
        ));
        ctx.quality_controls
            .record(QualityControl::new("qc".into(), "reviewer"));
        ctx
    }

    fn run(
        ctx: &FormContext,
        action: Action,
        ballot: &Ballot,
    ) -> Result<(FormContext, Vec<Effect>), TallyError> {
        let actor = ActorContext::new("reviewer", 1);
        let checks = checks();
        let env = TransitionEnv {
            ballot,
            checks: &checks,
            actor: &actor,
        };
        apply(ctx, &action, &env)
    }

    #[test]
    fn approve_without_variance_archives() {
        let ctx = in_quality_control(100, 100);
        let (next, effects) = run(&ctx, Action::ApproveQualityControl, &ballot(false)).unwrap();

        assert_eq!(next.current_state(), FormState::Archived);
        assert!(next.form.is_finalized());
        assert!(next.active_quality_control().unwrap().is_none());
        assert!(effects.contains(&Effect::ResultsFinalized(2)));
        // the input aggregate is untouched
        assert_eq!(ctx.current_state(), FormState::QualityControl);
    }

    #[test]
    fn approve_with_variance_opens_one_audit() {
        let ctx = in_quality_control(100, 79);
        let (next, _) = run(&ctx, Action::ApproveQualityControl, &ballot(false)).unwrap();

        assert_eq!(next.current_state(), FormState::Audit);
        assert_eq!(next.form.audited_count, 1);
        let audit = next.active_audit().unwrap().unwrap();
        assert_eq!(audit.quarantine_checks, vec!["tampering".to_string()]);
    }

    #[test]
    fn reject_without_reason_is_a_validation_error() {
        let ctx = in_quality_control(100, 100);
        let err = run(
            &ctx,
            Action::RejectQualityControl {
                sections: vec![QcSection::General],
                reject_reason: "  ".into(),
            },
            &ballot(false),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            TallyError::Validation(ValidationError::MissingRejectReason)
        ));
    }

    #[test]
    fn archived_forms_reject_every_state_change() {
        let mut ctx = in_quality_control(100, 100);
        ctx.form.form_state = FormState::Archived;

        let err = run(&ctx, Action::SendToClearance, &ballot(false)).unwrap_err();
        assert!(matches!(err, TallyError::IllegalTransition { .. }));
    }

    #[test]
    fn restore_returns_to_previous_state() {
        let ctx = in_quality_control(100, 100);
        let (cleared, _) = run(&ctx, Action::SendToClearance, &ballot(false)).unwrap();
        let (restored, _) = run(
            &cleared,
            Action::ResolveClearance(ClearanceResolution::Restore),
            &ballot(false),
        )
        .unwrap();

        assert_eq!(restored.current_state(), FormState::QualityControl);
        assert!(restored.active_quality_control().unwrap().is_none());
        assert_eq!(restored.history.len(), 2);
    }

    #[test]
    fn data_entry_must_cover_every_candidate() {
        let mut ctx = in_quality_control(100, 100);
        ctx.form.form_state = FormState::DataEntry1;

        let err = run(
            &ctx,
            Action::SubmitDataEntry(DataEntry {
                results: vec![(1, 10)],
                reconciliation: None,
            }),
            &ballot(false),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TallyError::Validation(ValidationError::MissingCandidate(2))
        ));
    }
}
