//! Error taxonomy for the result form workflow
use super::form::FormState;

#[derive(thiserror::Error, Debug)]
pub enum TallyError {
    #[error("{action} is not allowed for form {form_id} in state {state:?}: {detail}")]
    IllegalTransition {
        form_id: String,
        state: FormState,
        action: &'static str,
        detail: &'static str,
    },
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("form {form_id} changed since it was loaded: expected version {expected}, found {found}")]
    Conflict {
        form_id: String,
        expected: u64,
        found: u64,
    },
    #[error("Result form not found: {0}")]
    FormNotFound(String),
    #[error("Ballot not found: {0}")]
    BallotNotFound(u32),
    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("Failed to encode record: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("Failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("Failed to generate identifier: {0}")]
    Identifier(#[from] anyhow::Error),
}

impl TallyError {
    /// Whether the caller can fix the request and try again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TallyError::Validation(_) | TallyError::Conflict { .. })
    }
}

/// Inconsistent stored data. Aborts the unit of work, never repaired automatically.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("form {form_id} has {count} active {kind} rows for {slot}")]
    DuplicateActiveRows {
        form_id: String,
        kind: &'static str,
        slot: String,
        count: usize,
    },
    #[error("ballot {ballot_id} has mismatched result counts across candidates: {counts:?}")]
    ResultCountMismatch {
        ballot_id: u32,
        counts: Vec<(u32, usize)>,
    },
    #[error("form {form_id} has no active {entry} result for candidate {candidate_id}")]
    MissingResult {
        form_id: String,
        candidate_id: u32,
        entry: &'static str,
    },
    #[error("vote total for candidate {candidate_id} on ballot {ballot_id} exceeds the counter range")]
    VoteOverflow { ballot_id: u32, candidate_id: u32 },
    #[error("form {form_id} references ballot {expected}, but ballot {found} was supplied")]
    BallotMismatch {
        form_id: String,
        expected: u32,
        found: u32,
    },
}

/// Malformed request payloads. Returned before any mutation begins.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("A reject reason is required")]
    MissingRejectReason,
    #[error("At least one section must be marked incorrect")]
    NoSectionsRejected,
    #[error("Candidate {0} is not on this ballot")]
    UnknownCandidate(u32),
    #[error("Candidate {0} was entered more than once")]
    DuplicateCandidate(u32),
    #[error("No votes were entered for candidate {0}")]
    MissingCandidate(u32),
    #[error("Data entry values differ for candidate {0}; a correction is required")]
    CorrectionRequired(u32),
    #[error("Reconciliation entries differ; a corrected reconciliation is required")]
    ReconciliationCorrectionRequired,
    #[error("Barcode {0} is already registered")]
    DuplicateBarcode(String),
    #[error("Form belongs to tally {form_tally}, actor is working on tally {actor_tally}")]
    WrongTally { form_tally: u32, actor_tally: u32 },
    #[error("Quarantine check {0} already exists and cannot be modified")]
    QuarantineCheckExists(String),
    #[error("Ballot {0} has no candidates")]
    EmptyBallot(u32),
    #[error("Form {0} is not a duplicate on its ballot")]
    NotADuplicate(String),
}
