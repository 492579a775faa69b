use anyhow::Context;
use sled::open;
use std::sync::Arc;
use result_tally::{
    config::TallyConfig,
    context::ActorContext,
    error::{IntegrityError, TallyError, ValidationError},
    form::{Ballot, FormState, ResultForm},
    machine::{Action, ClearanceResolution, Corrections, DataEntry, Effect},
    records::{EntryVersion, QcSection, ReconciliationData, ReconciliationForm},
    service::TallyService,
    store::{EntityStore, SledStore},
    versioned::VersionedLog,
    versioning::VoteTotal,
};

use tempfile::{TempDir, tempdir}; // Use for test db cleanup.

const VARIANCE_TRIGGER: &str = "Trigger 2 - Guard against errors and tampering with the form";

struct Harness {
    _dir: TempDir,
    db: Arc<sled::Db>,
    service: TallyService<SledStore>,
    clerk: ActorContext,
    supervisor: ActorContext,
}

// Sled uses file-based locking, so each test opens its own database in a
// temp dir for simplified cleanup.
fn harness(name: &str, released: bool) -> anyhow::Result<Harness> {
    let _ = env_logger::builder().is_test(true).try_init();

    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join(format!("{name}.db")))?);
    db.clear()?;

    let service = TallyService::open(db.clone(), TallyConfig::default());
    service.install_quarantine_checks()?;
    service.register_ballot(
        &Ballot::new(1, 1)
            .set_available_for_release(released)
            .add_candidate(1, "Candidate One")
            .add_candidate(2, "Candidate Two"),
    )?;

    Ok(Harness {
        _dir: temp_dir,
        db,
        service,
        clerk: ActorContext::new("clerk", 1),
        supervisor: ActorContext::new("supervisor", 1),
    })
}

fn entry(results: &[(u32, u64)], expected: u64, counted: u64) -> DataEntry {
    DataEntry {
        results: results.to_vec(),
        reconciliation: Some(ReconciliationData::with_counts(expected, counted)),
    }
}

/// Run both data entry passes and the correction with agreeing values.
fn enter_data(
    h: &Harness,
    form_id: &str,
    results: &[(u32, u64)],
    expected: u64,
    counted: u64,
) -> anyhow::Result<()> {
    let first = Action::SubmitDataEntry(entry(results, expected, counted));
    h.service
        .apply_transition(form_id, first, &h.clerk)
        .context("Failed on first data entry: ")?;

    let second = Action::SubmitDataEntry(entry(results, expected, counted));
    h.service
        .apply_transition(form_id, second, &h.clerk)
        .context("Failed on second data entry: ")?;

    h.service
        .apply_transition(form_id, Action::Correct(Corrections::default()), &h.clerk)
        .context("Failed on correction: ")?;
    Ok(())
}

/// Register a form and drive it into an open quality control review.
fn form_in_quality_control(
    h: &Harness,
    barcode: &str,
    results: &[(u32, u64)],
    expected: u64,
    counted: u64,
) -> anyhow::Result<String> {
    let ctx = h
        .service
        .create_form(&h.clerk, ResultForm::new(barcode, 1, 1).set_registrants(200))?;
    let form_id = ctx.form.id;

    h.service.apply_transition(&form_id, Action::Receive, &h.clerk)?;
    h.service.apply_transition(&form_id, Action::CompleteIntake, &h.clerk)?;
    enter_data(h, &form_id, results, expected, counted)?;
    h.service
        .apply_transition(&form_id, Action::StartQualityControl, &h.supervisor)
        .context("Failed to open quality control: ")?;
    Ok(form_id)
}

#[test]
fn zero_variance_is_archived() -> anyhow::Result<()> {
    let h = harness("zero_variance", false)?;
    let form_id = form_in_quality_control(&h, "100000001", &[(1, 40), (2, 39)], 100, 100)?;

    assert!(h.service.evaluate_quarantine(&form_id)?.is_empty());

    let outcome = h
        .service
        .apply_transition(&form_id, Action::ApproveQualityControl, &h.supervisor)?;
    assert_eq!(outcome.new_state, FormState::Archived);
    assert!(outcome.effects.contains(&Effect::ResultsFinalized(2)));

    let ctx = h.service.load_form(&form_id)?;
    ctx.view_history();
    assert!(ctx.form.is_finalized());
    assert_eq!(ctx.form.audited_count, 0);
    assert_eq!(ctx.history.len(), 7);
    let qc = ctx.quality_controls.all().last().context("no qc row")?;
    assert_eq!(qc.passed_general, Some(true));
    assert!(!qc.active);

    let totals = h.service.compute_candidate_votes(1)?;
    assert_eq!(totals[&1], VoteTotal { count: 1, votes: 40 });
    assert_eq!(totals[&2], VoteTotal { count: 1, votes: 39 });
    assert_eq!(h.service.archived_barcodes(1)?, vec!["100000001".to_string()]);

    Ok(())
}

#[test]
fn variance_above_tolerance_is_audited() -> anyhow::Result<()> {
    let h = harness("variance_audit", false)?;
    let form_id = form_in_quality_control(&h, "100000002", &[(1, 40), (2, 39)], 100, 79)?;

    assert_eq!(
        h.service.evaluate_quarantine(&form_id)?,
        vec![VARIANCE_TRIGGER.to_string()]
    );

    let outcome = h
        .service
        .apply_transition(&form_id, Action::ApproveQualityControl, &h.supervisor)?;
    assert_eq!(outcome.new_state, FormState::Audit);

    let ctx = h.service.load_form(&form_id)?;
    assert_eq!(ctx.form.audited_count, 1);
    assert!(!ctx.form.is_finalized());
    assert_eq!(ctx.audits.len(), 1);
    let audit = ctx.active_audit()?.context("audit should be pending")?;
    assert_eq!(audit.quarantine_checks, vec![VARIANCE_TRIGGER.to_string()]);

    // not archived, so nothing is counted
    assert_eq!(h.service.compute_candidate_votes(1)?[&1].count, 0);

    Ok(())
}

#[test]
fn confirmed_audit_skips_quarantine_on_resubmission() -> anyhow::Result<()> {
    let h = harness("confirm_audit", false)?;
    let form_id = form_in_quality_control(&h, "100000003", &[(1, 40), (2, 39)], 100, 79)?;
    h.service
        .apply_transition(&form_id, Action::ApproveQualityControl, &h.supervisor)?;

    let outcome = h
        .service
        .apply_transition(&form_id, Action::ConfirmAudit, &h.supervisor)?;
    assert_eq!(outcome.new_state, FormState::DataEntry1);

    let ctx = h.service.load_form(&form_id)?;
    assert!(ctx.form.skip_quarantine_checks);
    assert_eq!(ctx.form.rejected_count, 0);
    assert!(ctx.active_audit()?.is_none());
    assert_eq!(ctx.results.active().count(), 0);
    assert_eq!(ctx.reconciliations.active().count(), 0);

    // the same variance no longer holds the form back
    enter_data(&h, &form_id, &[(1, 40), (2, 39)], 100, 79)?;
    h.service
        .apply_transition(&form_id, Action::StartQualityControl, &h.supervisor)?;
    assert!(h.service.evaluate_quarantine(&form_id)?.is_empty());

    let outcome = h
        .service
        .apply_transition(&form_id, Action::ApproveQualityControl, &h.supervisor)?;
    assert_eq!(outcome.new_state, FormState::Archived);
    assert!(outcome.effects.contains(&Effect::QuarantineSkipped));

    let ctx = h.service.load_form(&form_id)?;
    assert_eq!(ctx.form.audited_count, 1);
    assert_eq!(ctx.active_results(EntryVersion::Final).len(), 2);

    Ok(())
}

#[test]
fn reject_returns_to_data_entry() -> anyhow::Result<()> {
    let h = harness("reject_unreleased", false)?;
    let form_id = form_in_quality_control(&h, "100000004", &[(1, 40), (2, 39)], 100, 100)?;

    let outcome = h.service.apply_transition(
        &form_id,
        Action::RejectQualityControl {
            sections: vec![QcSection::Reconciliation],
            reject_reason: "Reconciliation totals illegible".into(),
        },
        &h.supervisor,
    )?;
    assert_eq!(outcome.new_state, FormState::DataEntry1);
    assert!(outcome.effects.contains(&Effect::RejectedCountIncremented(1)));

    let ctx = h.service.load_form(&form_id)?;
    assert_eq!(ctx.form.rejected_count, 1);
    assert_eq!(
        ctx.form.reject_reason.as_deref(),
        Some("Reconciliation totals illegible")
    );
    assert_eq!(ctx.results.active().count(), 0);
    assert_eq!(ctx.reconciliations.active().count(), 0);
    // history is kept
    assert_eq!(ctx.results.len(), 6);
    assert!(ctx.active_quality_control()?.is_none());
    let qc = ctx.quality_controls.all().last().context("no qc row")?;
    assert_eq!(qc.passed_reconciliation, Some(false));

    Ok(())
}

#[test]
fn reject_on_released_ballot_goes_to_clearance() -> anyhow::Result<()> {
    let h = harness("reject_released", true)?;
    let form_id = form_in_quality_control(&h, "100000005", &[(1, 40), (2, 39)], 100, 100)?;

    let outcome = h.service.apply_transition(
        &form_id,
        Action::RejectQualityControl {
            sections: vec![QcSection::General, QcSection::Women],
            reject_reason: "Signatures missing".into(),
        },
        &h.supervisor,
    )?;
    assert_eq!(outcome.new_state, FormState::Clearance);

    let ctx = h.service.load_form(&form_id)?;
    assert_eq!(ctx.form.rejected_count, 0);
    assert!(ctx.active_quality_control()?.is_some());
    assert_eq!(ctx.active_results(EntryVersion::Final).len(), 2);

    // clearance decides the data must be entered again
    let outcome = h.service.apply_transition(
        &form_id,
        Action::ResolveClearance(ClearanceResolution::Reenter),
        &h.supervisor,
    )?;
    assert_eq!(outcome.new_state, FormState::DataEntry1);

    let ctx = h.service.load_form(&form_id)?;
    assert_eq!(ctx.form.rejected_count, 1);
    assert!(ctx.active_quality_control()?.is_none());
    assert_eq!(ctx.results.active().count(), 0);

    Ok(())
}

#[test]
fn reject_without_reason_changes_nothing() -> anyhow::Result<()> {
    let h = harness("reject_no_reason", false)?;
    let form_id = form_in_quality_control(&h, "100000006", &[(1, 40), (2, 39)], 100, 100)?;
    let before = h.service.load_form(&form_id)?;

    let err = h
        .service
        .apply_transition(
            &form_id,
            Action::RejectQualityControl {
                sections: vec![QcSection::General],
                reject_reason: String::new(),
            },
            &h.supervisor,
        )
        .unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(h.service.load_form(&form_id)?, before);

    Ok(())
}

#[test]
fn archived_duplicates_are_never_sent_to_clearance() -> anyhow::Result<()> {
    let h = harness("duplicates", false)?;
    let archived = form_in_quality_control(&h, "200000001", &[(1, 12), (2, 7)], 19, 19)?;
    h.service
        .apply_transition(&archived, Action::ApproveQualityControl, &h.supervisor)?;
    let pending = form_in_quality_control(&h, "200000002", &[(1, 12), (2, 7)], 19, 19)?;
    let distinct = form_in_quality_control(&h, "200000003", &[(1, 12), (2, 8)], 20, 20)?;

    let found = h.service.find_duplicate_forms(1, Some(1))?;
    assert!(found.contains(&archived));
    assert!(found.contains(&pending));
    assert!(!found.contains(&distinct));

    let err = h.service.send_to_clearance(&h.supervisor, &archived).unwrap_err();
    assert!(matches!(err, TallyError::IllegalTransition { .. }));

    // only duplicates go to clearance one at a time
    let before = h.service.load_form(&distinct)?;
    let err = h.service.send_to_clearance(&h.supervisor, &distinct).unwrap_err();
    assert!(matches!(
        err,
        TallyError::Validation(ValidationError::NotADuplicate(_))
    ));
    assert_eq!(h.service.load_form(&distinct)?, before);

    let report = h.service.send_all_to_clearance(&h.supervisor, 1)?;
    assert_eq!(report.sent, vec![pending.clone()]);
    assert_eq!(report.skipped_archived, vec![archived.clone()]);

    let archived_ctx = h.service.load_form(&archived)?;
    assert_eq!(archived_ctx.current_state(), FormState::Archived);
    assert!(!archived_ctx.form.duplicate_reviewed);
    let pending_ctx = h.service.load_form(&pending)?;
    assert_eq!(pending_ctx.current_state(), FormState::Clearance);
    assert!(pending_ctx.form.duplicate_reviewed);

    // a second pass has nothing left to send
    let report = h.service.send_all_to_clearance(&h.supervisor, 1)?;
    assert!(report.sent.is_empty());
    assert_eq!(report.already_in_clearance, vec![pending.clone()]);

    let marked = h.service.mark_duplicates_reviewed(&h.supervisor, 1)?;
    assert_eq!(marked, vec![archived.clone()]);
    assert!(h.service.load_form(&archived)?.form.duplicate_reviewed);

    Ok(())
}

#[test]
fn stale_version_is_rejected() -> anyhow::Result<()> {
    let h = harness("stale_version", false)?;
    let ctx = h
        .service
        .create_form(&h.clerk, ResultForm::new("300000001", 1, 1))?;
    let form_id = ctx.form.id.clone();

    let outcome = h
        .service
        .apply_transition_at(&form_id, 0, Action::Receive, &h.clerk)?;
    assert_eq!(outcome.version, 1);

    // a second clerk acting on what they loaded before the first commit
    let err = h
        .service
        .apply_transition_at(&form_id, 0, Action::Receive, &h.supervisor)
        .unwrap_err();
    assert!(matches!(
        err,
        TallyError::Conflict {
            expected: 0,
            found: 1,
            ..
        }
    ));
    assert!(err.is_recoverable());

    let ctx = h.service.load_form(&form_id)?;
    assert_eq!(ctx.current_state(), FormState::Intake);
    assert_eq!(ctx.history.len(), 1);

    Ok(())
}

#[test]
fn double_active_reconciliation_aborts_the_transition() -> anyhow::Result<()> {
    let h = harness("double_recon", false)?;
    let form_id = form_in_quality_control(&h, "400000001", &[(1, 40), (2, 39)], 100, 100)?;

    // corrupt the stored aggregate behind the service's back
    let raw = SledStore::new(h.db.clone());
    let mut ctx = raw.load_form(&form_id)?;
    let mut rows = ctx.reconciliations.all().to_vec();
    rows.push(ReconciliationForm::new(
        "recon-extra".into(),
        EntryVersion::Final,
        ReconciliationData::with_counts(100, 50),
        "unknown",
    ));
    ctx.reconciliations = VersionedLog::from_rows(rows);
    raw.commit_form(&ctx, ctx.form.version)?;
    let before = h.service.load_form(&form_id)?;

    let err = h
        .service
        .apply_transition(&form_id, Action::ApproveQualityControl, &h.supervisor)
        .unwrap_err();
    assert!(matches!(
        err,
        TallyError::Integrity(IntegrityError::DuplicateActiveRows {
            kind: "reconciliation",
            count: 2,
            ..
        })
    ));
    assert!(!err.is_recoverable());
    assert!(h.service.evaluate_quarantine(&form_id).is_err());

    // nothing was committed
    assert_eq!(h.service.load_form(&form_id)?, before);

    Ok(())
}
