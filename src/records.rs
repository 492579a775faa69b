//! Rows owned by a result form. They are deactivated, never deleted.
use super::form::TimeStamp;
use super::versioned::Versioned;
use chrono::Utc;

/// Stage marker distinguishing first-pass, second-pass and final data.
#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum EntryVersion {
    #[n(0)]
    DataEntry1,
    #[n(1)]
    DataEntry2,
    #[n(2)]
    Final,
}

impl EntryVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryVersion::DataEntry1 => "data entry 1",
            EntryVersion::DataEntry2 => "data entry 2",
            EntryVersion::Final => "final",
        }
    }
}

/// One vote tally for one candidate on one result form.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CandidateResult {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub candidate_id: u32,
    #[n(2)]
    pub votes: u64,
    #[n(3)]
    pub entry_version: EntryVersion,
    #[n(4)]
    pub active: bool,
    #[n(5)]
    pub user: String,
    #[n(6)]
    pub created: TimeStamp<Utc>,
}

impl CandidateResult {
    pub fn new(
        id: String,
        candidate_id: u32,
        votes: u64,
        entry_version: EntryVersion,
        user: &str,
    ) -> Self {
        Self {
            id,
            candidate_id,
            votes,
            entry_version,
            active: true,
            user: user.to_string(),
            created: TimeStamp::new(),
        }
    }
}

impl Versioned for CandidateResult {
    type Slot = (u32, EntryVersion);
    const KIND: &'static str = "result";

    fn slot(&self) -> Self::Slot {
        (self.candidate_id, self.entry_version)
    }
    fn is_active(&self) -> bool {
        self.active
    }
    fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Physical ballot counts as written on the reconciliation section of the form.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationData {
    #[n(0)]
    pub ballot_number_from: u64,
    #[n(1)]
    pub ballot_number_to: u64,
    #[n(2)]
    pub number_ballots_received: u64,
    #[n(3)]
    pub number_unused_ballots: u64,
    #[n(4)]
    pub number_spoiled_ballots: u64,
    #[n(5)]
    pub number_cancelled_ballots: u64,
    #[n(6)]
    pub number_ballots_outside_box: u64,
    #[n(7)]
    pub number_ballots_inside_box: u64,
    #[n(8)]
    pub number_unstamped_ballots: u64,
    #[n(9)]
    pub number_invalid_votes: u64,
    #[n(10)]
    pub number_ballots_expected: u64,
}

impl ReconciliationData {
    /// Shorthand for the two figures the quarantine checks compare.
    pub fn with_counts(expected: u64, inside_box: u64) -> Self {
        Self {
            number_ballots_expected: expected,
            number_ballots_inside_box: inside_box,
            ..Self::default()
        }
    }
    /// Ballots physically counted from the box
    pub fn ballots_counted(&self) -> u64 {
        self.number_ballots_inside_box
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationForm {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub entry_version: EntryVersion,
    #[n(2)]
    pub data: ReconciliationData,
    #[n(3)]
    pub active: bool,
    #[n(4)]
    pub user: String,
    #[n(5)]
    pub created: TimeStamp<Utc>,
}

impl ReconciliationForm {
    pub fn new(id: String, entry_version: EntryVersion, data: ReconciliationData, user: &str) -> Self {
        Self {
            id,
            entry_version,
            data,
            active: true,
            user: user.to_string(),
            created: TimeStamp::new(),
        }
    }
}

impl Versioned for ReconciliationForm {
    type Slot = EntryVersion;
    const KIND: &'static str = "reconciliation";

    fn slot(&self) -> Self::Slot {
        self.entry_version
    }
    fn is_active(&self) -> bool {
        self.active
    }
    fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Sections of a form a quality control reviewer passes or rejects.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcSection {
    #[n(0)]
    General,
    #[n(1)]
    Reconciliation,
    #[n(2)]
    Women,
}

/// One quality control review cycle.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct QualityControl {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub user: String,
    #[n(2)]
    pub passed_general: Option<bool>,
    #[n(3)]
    pub passed_reconciliation: Option<bool>,
    #[n(4)]
    pub passed_women: Option<bool>,
    #[n(5)]
    pub active: bool,
    #[n(6)]
    pub created: TimeStamp<Utc>,
}

impl QualityControl {
    pub fn new(id: String, user: &str) -> Self {
        Self {
            id,
            user: user.to_string(),
            passed_general: None,
            passed_reconciliation: None,
            passed_women: None,
            active: true,
            created: TimeStamp::new(),
        }
    }
    /// Record an approval. Every section is marked as passed.
    pub fn pass_all(&mut self) {
        self.passed_general = Some(true);
        self.passed_reconciliation = Some(true);
        self.passed_women = Some(true);
    }
    /// Mark one section incorrect. Sections not named are left unreviewed.
    pub fn fail(&mut self, section: QcSection) {
        // a rejection may name several sections, each is failed in turn
        match section {
            QcSection::General => self.passed_general = Some(false),
            QcSection::Reconciliation => self.passed_reconciliation = Some(false),
            QcSection::Women => self.passed_women = Some(false),
        }
    }
}

impl Versioned for QualityControl {
    type Slot = ();
    const KIND: &'static str = "quality control";

    fn slot(&self) -> Self::Slot {}
    fn is_active(&self) -> bool {
        self.active
    }
    fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Raised when quarantine checks fire; active while pending review.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Audit {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub user: String,
    #[n(2)]
    pub quarantine_checks: Vec<String>, // names of the fired checks
    #[n(3)]
    pub active: bool,
    #[n(4)]
    pub created: TimeStamp<Utc>,
}

impl Audit {
    pub fn new(id: String, user: &str, quarantine_checks: Vec<String>) -> Self {
        Self {
            id,
            user: user.to_string(),
            quarantine_checks,
            active: true,
            created: TimeStamp::new(),
        }
    }
}

impl Versioned for Audit {
    type Slot = ();
    const KIND: &'static str = "audit";

    fn slot(&self) -> Self::Slot {}
    fn is_active(&self) -> bool {
        self.active
    }
    fn deactivate(&mut self) {
        self.active = false;
    }
}
