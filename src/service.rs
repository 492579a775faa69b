//! Service layer API for result form workflow operations
use super::config::TallyConfig;
use super::context::{ActorContext, FormContext};
use super::duplicates;
use super::form::{Ballot, FormState, ResultForm};
use super::machine::{self, Action, TransitionEnv, TransitionOutcome};
use super::store::{EntityStore, SledStore};
use super::utils::new_uuid_to_bech32;
use super::versioning::{self, VoteTotal};
use super::error::{TallyError, ValidationError};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Outcome of sending a ballot's duplicates to clearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearanceReport {
    pub sent: Vec<String>,
    /// Archived duplicates, left untouched.
    pub skipped_archived: Vec<String>,
    pub already_in_clearance: Vec<String>,
}

pub struct TallyService<S: EntityStore> {
    store: S,
    config: TallyConfig,
}

impl TallyService<SledStore> {
    /// Service over an embedded sled database.
    pub fn open(instance: Arc<sled::Db>, config: TallyConfig) -> Self {
        Self::new(SledStore::new(instance), config)
    }
}

impl<S: EntityStore> TallyService<S> {
    pub fn new(store: S, config: TallyConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    /// Store the configured quarantine checks. Checks that already exist are
    /// kept as stored. Returns how many were added.
    pub fn install_quarantine_checks(&self) -> Result<usize, TallyError> {
        let mut installed = 0;
        for check in &self.config.quarantine_checks {
            match self.store.insert_quarantine_check(check) {
                Ok(()) => installed += 1,
                Err(TallyError::Validation(ValidationError::QuarantineCheckExists(name))) => {
                    info!("quarantine check {name} already installed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(installed)
    }

    pub fn register_ballot(&self, ballot: &Ballot) -> Result<(), TallyError> {
        if ballot.candidates.is_empty() {
            return Err(ValidationError::EmptyBallot(ballot.id).into());
        }
        self.store.put_ballot(ballot)
    }

    /// Register a new result form in the actor's tally.
    pub fn create_form(
        &self,
        actor: &ActorContext,
        form: ResultForm,
    ) -> Result<FormContext, TallyError> {
        if form.tally_id != actor.tally_id {
            return Err(ValidationError::WrongTally {
                form_tally: form.tally_id,
                actor_tally: actor.tally_id,
            }
            .into());
        }
        // the ballot must exist before forms can reference it
        self.store.load_ballot(form.ballot_id)?;

        let mut ctx = FormContext::new(form);
        ctx.form.id = new_uuid_to_bech32("form")?;
        ctx.form.version = 0;
        self.store.insert_form(&ctx)?;

        info!(
            "form {} registered with barcode {} by {}",
            ctx.form.id, ctx.form.barcode, actor.user
        );
        Ok(ctx)
    }

    pub fn load_form(&self, form_id: &str) -> Result<FormContext, TallyError> {
        self.store.load_form(form_id)
    }

    pub fn form_by_barcode(&self, barcode: &str) -> Result<FormContext, TallyError> {
        match self.store.form_id_for_barcode(barcode)? {
            Some(form_id) => self.store.load_form(&form_id),
            None => Err(TallyError::FormNotFound(barcode.to_string())),
        }
    }

    /// Apply `action` to the current version of the form.
    pub fn apply_transition(
        &self,
        form_id: &str,
        action: Action,
        actor: &ActorContext,
    ) -> Result<TransitionOutcome, TallyError> {
        let ctx = self.store.load_form(form_id)?;
        self.commit_transition(ctx, &action, actor)
    }

    /// Apply `action` only if the form is still at `expected_version`, the
    /// version the caller last saw.
    pub fn apply_transition_at(
        &self,
        form_id: &str,
        expected_version: u64,
        action: Action,
        actor: &ActorContext,
    ) -> Result<TransitionOutcome, TallyError> {
        let ctx = self.store.load_form(form_id)?;
        if ctx.form.version != expected_version {
            warn!(
                "form {form_id} is at version {}, caller expected {expected_version}",
                ctx.form.version
            );
            return Err(TallyError::Conflict {
                form_id: form_id.to_string(),
                expected: expected_version,
                found: ctx.form.version,
            });
        }
        self.commit_transition(ctx, &action, actor)
    }

    fn commit_transition(
        &self,
        ctx: FormContext,
        action: &Action,
        actor: &ActorContext,
    ) -> Result<TransitionOutcome, TallyError> {
        let ballot = self.store.load_ballot(ctx.form.ballot_id)?;
        let checks = self.store.quarantine_checks()?;
        let env = TransitionEnv {
            ballot: &ballot,
            checks: &checks,
            actor,
        };

        let (mut next, effects) = machine::apply(&ctx, action, &env).inspect_err(|e| {
            if let TallyError::Integrity(violation) = e {
                warn!("{} aborted: {violation}", action.name());
            }
        })?;

        let expected = ctx.form.version;
        next.form.version = expected + 1;
        self.store.commit_form(&next, expected)?;

        info!(
            "form {} {}: {:?} -> {:?} by {} (version {})",
            next.form.id,
            action.name(),
            ctx.form.form_state,
            next.form.form_state,
            actor.user,
            next.form.version
        );

        Ok(TransitionOutcome {
            form_id: next.form.id,
            previous_state: ctx.form.form_state,
            new_state: next.form.form_state,
            version: next.form.version,
            effects,
        })
    }

    /// Names of the checks that would fire for the form right now.
    pub fn evaluate_quarantine(&self, form_id: &str) -> Result<Vec<String>, TallyError> {
        let ctx = self.store.load_form(form_id)?;
        let checks = self.store.quarantine_checks()?;
        Ok(machine::quarantine_triggers(&ctx, &checks)?)
    }

    pub fn compute_candidate_votes(
        &self,
        ballot_id: u32,
    ) -> Result<BTreeMap<u32, VoteTotal>, TallyError> {
        let ballot = self.store.load_ballot(ballot_id)?;
        let forms = self.store.forms()?;
        versioning::compute_ballot_votes(&ballot, &forms).map_err(|e| {
            warn!("vote totals for ballot {ballot_id} aborted: {e}");
            e.into()
        })
    }

    pub fn find_duplicate_forms(
        &self,
        tally_id: u32,
        ballot_id: Option<u32>,
    ) -> Result<BTreeSet<String>, TallyError> {
        duplicates::find_duplicates(&self.store.forms()?, tally_id, ballot_id)
    }

    /// Barcodes of archived forms on the ballot, for the results export.
    /// Empty for ballots outside the configured special ballots.
    pub fn archived_barcodes(&self, ballot_id: u32) -> Result<Vec<String>, TallyError> {
        if !self.config.is_special_ballot(ballot_id) {
            return Ok(vec![]);
        }
        let mut barcodes: Vec<String> = self
            .store
            .forms()?
            .into_iter()
            .filter(|c| c.form.ballot_id == ballot_id && c.current_state() == FormState::Archived)
            .map(|c| c.form.barcode)
            .collect();
        barcodes.sort();
        Ok(barcodes)
    }

    /// Mark every duplicate on the ballot as reviewed. Returns the forms changed.
    pub fn mark_duplicates_reviewed(
        &self,
        actor: &ActorContext,
        ballot_id: u32,
    ) -> Result<Vec<String>, TallyError> {
        let mut marked = vec![];
        for form_id in self.find_duplicate_forms(actor.tally_id, Some(ballot_id))? {
            let ctx = self.store.load_form(&form_id)?;
            if ctx.form.duplicate_reviewed {
                continue;
            }
            self.commit_transition(ctx, &Action::MarkDuplicateReviewed, actor)?;
            marked.push(form_id);
        }
        Ok(marked)
    }

    /// Send one duplicate form to clearance. Forms that are not duplicates
    /// on their ballot are refused, as are archived forms.
    pub fn send_to_clearance(
        &self,
        actor: &ActorContext,
        form_id: &str,
    ) -> Result<TransitionOutcome, TallyError> {
        let ctx = self.store.load_form(form_id)?;
        let duplicates = self.find_duplicate_forms(actor.tally_id, Some(ctx.form.ballot_id))?;
        if !duplicates.contains(form_id) {
            warn!("form {form_id} is not a duplicate, not sending to clearance");
            return Err(ValidationError::NotADuplicate(form_id.to_string()).into());
        }
        self.commit_transition(ctx, &Action::SendToClearance, actor)
    }

    /// Send every non-archived duplicate on the ballot to clearance.
    pub fn send_all_to_clearance(
        &self,
        actor: &ActorContext,
        ballot_id: u32,
    ) -> Result<ClearanceReport, TallyError> {
        let mut report = ClearanceReport::default();
        for form_id in self.find_duplicate_forms(actor.tally_id, Some(ballot_id))? {
            let ctx = self.store.load_form(&form_id)?;
            match ctx.current_state() {
                FormState::Archived => {
                    warn!("form {form_id} is archived, not sending to clearance");
                    report.skipped_archived.push(form_id);
                }
                FormState::Clearance => report.already_in_clearance.push(form_id),
                _ => {
                    self.commit_transition(ctx, &Action::SendToClearance, actor)?;
                    report.sent.push(form_id);
                }
            }
        }
        Ok(report)
    }
}
