//! Core result form, ballot and timestamp types
use chrono::{DateTime, TimeZone, Utc};

/// Position of a result form in the verification pipeline.
#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum FormState {
    #[n(0)]
    Unsubmitted,
    #[n(1)]
    Intake,
    #[n(2)]
    DataEntry1,
    #[n(3)]
    DataEntry2,
    #[n(4)]
    Correction,
    #[n(5)]
    QualityControl,
    #[n(6)]
    Audit,
    #[n(7)]
    Clearance,
    #[n(8)]
    Archived,
}

impl FormState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FormState::Archived)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    #[n(0)]
    pub id: u32,
    #[n(1)]
    pub full_name: String,
    #[n(2)]
    pub order: u32,
}

/// The race a result form's candidates compete in.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    #[n(0)]
    pub id: u32,
    #[n(1)]
    pub tally_id: u32,
    #[n(2)]
    pub available_for_release: bool,
    #[n(3)]
    pub candidates: Vec<Candidate>,
}

impl Ballot {
    pub fn new(id: u32, tally_id: u32) -> Self {
        Self {
            id,
            tally_id,
            available_for_release: false,
            candidates: vec![],
        }
    }
    pub fn set_available_for_release(mut self, available: bool) -> Self {
        self.available_for_release = available;
        self
    }
    pub fn add_candidate(mut self, id: u32, full_name: &str) -> Self {
        let order = self.candidates.len() as u32 + 1;
        self.candidates.push(Candidate {
            id,
            full_name: full_name.to_string(),
            order,
        });
        self
    }
    pub fn has_candidate(&self, candidate_id: u32) -> bool {
        self.candidates.iter().any(|c| c.id == candidate_id)
    }
}

/// A paper result form. The aggregate root of the workflow.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ResultForm {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub barcode: String,
    #[n(2)]
    pub serial_number: u32,
    #[n(3)]
    pub tally_id: u32,
    #[n(4)]
    pub ballot_id: u32,
    #[n(5)]
    pub center_code: String,
    #[n(6)]
    pub station_number: u32,
    #[n(7)]
    pub registrants: Option<u64>, // registered voters at the station, when known
    #[n(8)]
    pub form_state: FormState,
    #[n(9)]
    pub previous_form_state: Option<FormState>,
    #[n(10)]
    pub rejected_count: u32,
    #[n(11)]
    pub audited_count: u32,
    #[n(12)]
    pub duplicate_reviewed: bool,
    #[n(13)]
    pub skip_quarantine_checks: bool,
    #[n(14)]
    pub reject_reason: Option<String>,
    #[n(15)]
    pub finalized_at: Option<TimeStamp<Utc>>,
    #[n(16)]
    pub version: u64, // bumped on every commit
}

impl ResultForm {
    /// Construct an unsubmitted form, ids are assigned on registration
    pub fn new(barcode: &str, tally_id: u32, ballot_id: u32) -> Self {
        Self {
            id: String::new(),
            barcode: barcode.to_string(),
            serial_number: 0,
            tally_id,
            ballot_id,
            center_code: String::new(),
            station_number: 0,
            registrants: None,
            form_state: FormState::Unsubmitted,
            previous_form_state: None,
            rejected_count: 0,
            audited_count: 0,
            duplicate_reviewed: false,
            skip_quarantine_checks: false,
            reject_reason: None,
            finalized_at: None,
            version: 0,
        }
    }
    pub fn set_serial_number(mut self, serial_number: u32) -> Self {
        self.serial_number = serial_number;
        self
    }
    pub fn set_station(mut self, center_code: &str, station_number: u32) -> Self {
        self.center_code = center_code.to_string();
        self.station_number = station_number;
        self
    }
    pub fn set_registrants(mut self, registrants: u64) -> Self {
        self.registrants = Some(registrants);
        self
    }
    pub fn set_form_state(mut self, state: FormState) -> Self {
        self.form_state = state;
        self
    }
    pub fn set_skip_quarantine_checks(mut self, skip: bool) -> Self {
        self.skip_quarantine_checks = skip;
        self
    }
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }
    /// Move to `next`, remembering where we came from.
    pub(crate) fn advance(&mut self, next: FormState) {
        self.previous_form_state = Some(self.form_state);
        self.form_state = next;
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}
impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}
impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
