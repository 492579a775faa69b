use super::form::{FormState, ResultForm, TimeStamp};
use super::records::{Audit, CandidateResult, EntryVersion, QualityControl, ReconciliationForm};
use super::versioned::VersionedLog;
use super::error::IntegrityError;
use chrono::Utc;
use log::info;

/// Who is acting, and on which tally. Passed into every workflow call
/// in place of session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub user: String,
    pub tally_id: u32,
}

impl ActorContext {
    pub fn new(user: &str, tally_id: u32) -> Self {
        Self {
            user: user.to_string(),
            tally_id,
        }
    }
}

/// One applied action, kept as the form's audit trail.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct TransitionRecord {
    #[n(0)]
    pub action: String,
    #[n(1)]
    pub user: String,
    #[n(2)]
    pub from: FormState,
    #[n(3)]
    pub to: FormState,
    #[n(4)]
    pub timestamp: TimeStamp<Utc>,
}

/// A result form together with every row it owns. Loaded, changed and
/// committed as one unit.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct FormContext {
    #[n(0)]
    pub form: ResultForm,
    #[n(1)]
    pub results: VersionedLog<CandidateResult>,
    #[n(2)]
    pub reconciliations: VersionedLog<ReconciliationForm>,
    #[n(3)]
    pub quality_controls: VersionedLog<QualityControl>,
    #[n(4)]
    pub audits: VersionedLog<Audit>,
    #[n(5)]
    pub history: Vec<TransitionRecord>,
}

impl FormContext {
    pub fn new(form: ResultForm) -> Self {
        Self {
            form,
            results: VersionedLog::new(),
            reconciliations: VersionedLog::new(),
            quality_controls: VersionedLog::new(),
            audits: VersionedLog::new(),
            history: vec![],
        }
    }

    pub fn form_id(&self) -> &str {
        &self.form.id
    }

    pub fn current_state(&self) -> FormState {
        self.form.form_state
    }

    /// Active results of one entry version, ordered by candidate.
    pub fn active_results(&self, entry: EntryVersion) -> Vec<&CandidateResult> {
        let mut rows: Vec<&CandidateResult> = self
            .results
            .active()
            .filter(|r| r.entry_version == entry)
            .collect();
        rows.sort_by_key(|r| r.candidate_id);
        rows
    }

    pub fn active_result(
        &self,
        candidate_id: u32,
        entry: EntryVersion,
    ) -> Result<Option<&CandidateResult>, IntegrityError> {
        self.results.active_in(&self.form.id, &(candidate_id, entry))
    }

    pub fn active_reconciliation(
        &self,
        entry: EntryVersion,
    ) -> Result<Option<&ReconciliationForm>, IntegrityError> {
        self.reconciliations.active_in(&self.form.id, &entry)
    }

    pub fn active_quality_control(&self) -> Result<Option<&QualityControl>, IntegrityError> {
        self.quality_controls.active_in(&self.form.id, &())
    }

    pub fn active_audit(&self) -> Result<Option<&Audit>, IntegrityError> {
        self.audits.active_in(&self.form.id, &())
    }

    /// Sum of the active final votes, the form's canonical tally.
    /// Saturates at `u64::MAX`.
    pub fn num_votes(&self) -> u64 {
        self.active_results(EntryVersion::Final)
            .iter()
            .fold(0u64, |total, r| total.saturating_add(r.votes))
    }

    /// Every owned log holds at most one active row per slot.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        let id = &self.form.id;
        self.results.check_invariant(id)?;
        self.reconciliations.check_invariant(id)?;
        self.quality_controls.check_invariant(id)?;
        self.audits.check_invariant(id)
    }

    pub fn insert_transition(&mut self, record: TransitionRecord) {
        self.history.push(record);
    }

    pub fn view_history(&self) {
        for record in &self.history {
            info!(
                "{} [{}] {:?} -> {:?} by {} at {}",
                self.form.barcode,
                record.action,
                record.from,
                record.to,
                record.user,
                record.timestamp.to_datetime_utc()
            );
        }
    }
}
