//! Persistence for result forms, ballots and quarantine checks.
//!
//! Every record is CBOR encoded under a key prefix. A form is stored together
//! with all the rows it owns, so committing a form is a single write.
use super::context::FormContext;
use super::form::Ballot;
use super::quarantine::QuarantineCheck;
use super::error::{TallyError, ValidationError};
use log::{debug, warn};
use sled::transaction::{ConflictableTransactionError, TransactionError, abort};
use std::sync::Arc;

const FORM_PREFIX: &str = "form/";
const BARCODE_PREFIX: &str = "barcode/";
const BALLOT_PREFIX: &str = "ballot/";
const CHECK_PREFIX: &str = "check/";

fn form_key(form_id: &str) -> String {
    format!("{FORM_PREFIX}{form_id}")
}

fn barcode_key(barcode: &str) -> String {
    format!("{BARCODE_PREFIX}{barcode}")
}

fn ballot_key(ballot_id: u32) -> String {
    format!("{BALLOT_PREFIX}{ballot_id}")
}

fn check_key(name: &str) -> String {
    format!("{CHECK_PREFIX}{name}")
}

/// The persistence interface the workflow consumes.
pub trait EntityStore {
    /// Register a new form. Barcodes are unique.
    fn insert_form(&self, ctx: &FormContext) -> Result<(), TallyError>;
    fn load_form(&self, form_id: &str) -> Result<FormContext, TallyError>;
    fn form_id_for_barcode(&self, barcode: &str) -> Result<Option<String>, TallyError>;
    /// Replace the stored aggregate, provided its version is still
    /// `expected_version`. All or nothing.
    fn commit_form(&self, ctx: &FormContext, expected_version: u64) -> Result<(), TallyError>;
    fn forms(&self) -> Result<Vec<FormContext>, TallyError>;

    fn put_ballot(&self, ballot: &Ballot) -> Result<(), TallyError>;
    fn load_ballot(&self, ballot_id: u32) -> Result<Ballot, TallyError>;

    /// Checks are immutable once created.
    fn insert_quarantine_check(&self, check: &QuarantineCheck) -> Result<(), TallyError>;
    fn quarantine_checks(&self) -> Result<Vec<QuarantineCheck>, TallyError>;
}

pub struct SledStore {
    instance: Arc<sled::Db>,
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }
}

fn flatten(err: TransactionError<TallyError>) -> TallyError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => TallyError::Storage(e),
    }
}

impl EntityStore for SledStore {
    fn insert_form(&self, ctx: &FormContext) -> Result<(), TallyError> {
        let encoded = minicbor::to_vec(ctx)?;
        let form_key = form_key(ctx.form_id());
        let barcode_key = barcode_key(&ctx.form.barcode);

        self.instance
            .transaction(|tx| {
                if tx.get(barcode_key.as_bytes())?.is_some() {
                    return abort(TallyError::from(ValidationError::DuplicateBarcode(
                        ctx.form.barcode.clone(),
                    )));
                }
                tx.insert(barcode_key.as_bytes(), ctx.form_id().as_bytes())?;
                tx.insert(form_key.as_bytes(), encoded.as_slice())?;
                Ok(())
            })
            .map_err(flatten)
    }

    fn load_form(&self, form_id: &str) -> Result<FormContext, TallyError> {
        debug!("loading form {form_id}");
        match self.instance.get(form_key(form_id))? {
            Some(bytes) => Ok(minicbor::decode(&bytes)?),
            None => Err(TallyError::FormNotFound(form_id.to_string())),
        }
    }

    fn form_id_for_barcode(&self, barcode: &str) -> Result<Option<String>, TallyError> {
        Ok(self
            .instance
            .get(barcode_key(barcode))?
            .map(|id| String::from_utf8_lossy(&id).into_owned()))
    }

    fn commit_form(&self, ctx: &FormContext, expected_version: u64) -> Result<(), TallyError> {
        let encoded = minicbor::to_vec(ctx)?;
        let key = form_key(ctx.form_id());

        let result = self.instance.transaction(|tx| {
            let stored = match tx.get(key.as_bytes())? {
                Some(bytes) => bytes,
                None => return abort(TallyError::FormNotFound(ctx.form_id().to_string())),
            };
            let current: FormContext = minicbor::decode(&stored)
                .map_err(|e| ConflictableTransactionError::Abort(TallyError::from(e)))?;
            if current.form.version != expected_version {
                return abort(TallyError::Conflict {
                    form_id: ctx.form_id().to_string(),
                    expected: expected_version,
                    found: current.form.version,
                });
            }
            tx.insert(key.as_bytes(), encoded.as_slice())?;
            Ok(())
        });

        result.map_err(|e| {
            let err = flatten(e);
            if let TallyError::Conflict { .. } = err {
                warn!("{err}");
            }
            err
        })
    }

    fn forms(&self) -> Result<Vec<FormContext>, TallyError> {
        let mut forms = vec![];
        for entry in self.instance.scan_prefix(FORM_PREFIX) {
            let (_, bytes) = entry?;
            forms.push(minicbor::decode(&bytes)?);
        }
        debug!("scanned {} forms", forms.len());
        Ok(forms)
    }

    fn put_ballot(&self, ballot: &Ballot) -> Result<(), TallyError> {
        self.instance
            .insert(ballot_key(ballot.id), minicbor::to_vec(ballot)?)?;
        Ok(())
    }

    fn load_ballot(&self, ballot_id: u32) -> Result<Ballot, TallyError> {
        match self.instance.get(ballot_key(ballot_id))? {
            Some(bytes) => Ok(minicbor::decode(&bytes)?),
            None => Err(TallyError::BallotNotFound(ballot_id)),
        }
    }

    fn insert_quarantine_check(&self, check: &QuarantineCheck) -> Result<(), TallyError> {
        let encoded = minicbor::to_vec(check)?;
        let swapped = self.instance.compare_and_swap(
            check_key(&check.name),
            None as Option<&[u8]>,
            Some(encoded),
        )?;
        swapped
            .map_err(|_| ValidationError::QuarantineCheckExists(check.name.clone()).into())
    }

    fn quarantine_checks(&self) -> Result<Vec<QuarantineCheck>, TallyError> {
        let mut checks = vec![];
        for entry in self.instance.scan_prefix(CHECK_PREFIX) {
            let (_, bytes) = entry?;
            checks.push(minicbor::decode(&bytes)?);
        }
        Ok(checks)
    }
}
