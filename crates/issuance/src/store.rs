use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, Transactional, TransactionalTree};
use sri_einv_core::models::{CreditApplication, DocumentLineItem, DocumentType, ElectronicDocument};
use sri_einv_core::state::DocumentState;
use sri_einv_core::validation::CreditLedger;
use std::path::Path;
use uuid::Uuid;

use crate::error::StoreError;
use crate::sequence::{allocate_in, format_sequence, SequenceAllocator, SequenceKey};

pub const DOCUMENTS_TREE: &str = "documents";
pub const ACCESS_KEYS_TREE: &str = "access_keys";
pub const SEQUENCES_TREE: &str = "sequences";
pub const CREDIT_LEDGERS_TREE: &str = "credit_ledgers";

type TxResult<T> = Result<T, ConflictableTransactionError<StoreError>>;

fn fail(e: impl Into<StoreError>) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(e.into())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Credit note consumption recorded together with the note itself.
#[derive(Debug, Clone)]
pub struct CreditClaim {
    pub source_uuid: Uuid,
    pub application: CreditApplication,
    pub lines: Vec<DocumentLineItem>,
}

/// Issued documents, their access key index, the sequence counters and the
/// credit ledgers of invoices, all in one sled database.
#[derive(Clone)]
pub struct DocumentStore {
    db: sled::Db,
    documents: sled::Tree,
    access_keys: sled::Tree,
    sequences: sled::Tree,
    credit_ledgers: sled::Tree,
}

impl DocumentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            documents: db.open_tree(DOCUMENTS_TREE)?,
            access_keys: db.open_tree(ACCESS_KEYS_TREE)?,
            sequences: db.open_tree(SEQUENCES_TREE)?,
            credit_ledgers: db.open_tree(CREDIT_LEDGERS_TREE)?,
            db,
        })
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn sequences(&self) -> SequenceAllocator {
        SequenceAllocator::new(self.sequences.clone())
    }

    /// Allocates the next sequence for `key`, builds the document from it and
    /// stores it, all in one transaction. `build` may run more than once when
    /// sled retries on conflict.
    pub fn issue<F>(
        &self,
        key: &SequenceKey,
        credit: Option<&CreditClaim>,
        build: F,
    ) -> Result<ElectronicDocument, StoreError>
    where
        F: Fn(&str) -> Result<ElectronicDocument, StoreError>,
    {
        let doc = (
            &self.documents,
            &self.access_keys,
            &self.sequences,
            &self.credit_ledgers,
        )
            .transaction(|(documents, access_keys, sequences, ledgers)| {
                let sequence = allocate_in(sequences, key)?;
                let doc = build(&format_sequence(sequence)).map_err(fail)?;

                let access_key = doc.access_key.as_str();
                if access_keys.get(access_key)?.is_some() {
                    return Err(fail(StoreError::DuplicateAccessKey(access_key.to_string())));
                }
                if let Some(claim) = credit {
                    apply_credit(documents, ledgers, claim, doc.uuid)?;
                }

                documents.insert(doc.uuid.to_string().as_str(), encode(&doc).map_err(fail)?)?;
                access_keys.insert(access_key, doc.uuid.to_string().as_str())?;
                Ok(doc)
            })?;
        Ok(doc)
    }

    /// Overwrites the stored copy after a state change.
    pub fn update(&self, doc: &ElectronicDocument) -> Result<(), StoreError> {
        self.documents
            .insert(doc.uuid.to_string().as_str(), encode(doc)?)?;
        Ok(())
    }

    /// Stores an annulled document and, for credit notes, gives the consumed
    /// quantities back to the source invoice.
    pub fn save_annulment(
        &self,
        doc: &ElectronicDocument,
        release_from: Option<Uuid>,
    ) -> Result<(), StoreError> {
        (&self.documents, &self.credit_ledgers).transaction(|(documents, ledgers)| {
            if let Some(source) = release_from {
                let key = source.to_string();
                if let Some(raw) = ledgers.get(key.as_str())? {
                    let mut ledger: CreditLedger = decode(&raw).map_err(fail)?;
                    if ledger.release(doc.uuid) {
                        ledgers.insert(key.as_str(), encode(&ledger).map_err(fail)?)?;
                    }
                }
            }
            documents.insert(doc.uuid.to_string().as_str(), encode(doc).map_err(fail)?)?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn get(&self, uuid: Uuid) -> Result<Option<ElectronicDocument>, StoreError> {
        self.documents
            .get(uuid.to_string().as_str())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    pub fn by_access_key(&self, access_key: &str) -> Result<Option<ElectronicDocument>, StoreError> {
        let Some(raw) = self.access_keys.get(access_key)? else {
            return Ok(None);
        };
        let Ok(uuid) = Uuid::parse_str(&String::from_utf8_lossy(&raw)) else {
            return Ok(None);
        };
        self.get(uuid)
    }

    pub fn ledger(&self, source_uuid: Uuid) -> Result<Option<CreditLedger>, StoreError> {
        self.credit_ledgers
            .get(source_uuid.to_string().as_str())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// All documents, oldest first.
    pub fn list(&self) -> Result<Vec<ElectronicDocument>, StoreError> {
        let mut out = Vec::new();
        for item in self.documents.iter() {
            let (_k, v) = item?;
            out.push(decode::<ElectronicDocument>(&v)?);
        }
        out.sort_by_key(|d| d.created_at);
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn apply_credit(
    documents: &TransactionalTree,
    ledgers: &TransactionalTree,
    claim: &CreditClaim,
    note_uuid: Uuid,
) -> TxResult<()> {
    let source_key = claim.source_uuid.to_string();
    let raw = documents
        .get(source_key.as_str())?
        .ok_or_else(|| fail(StoreError::SourceUnavailable(claim.source_uuid)))?;
    let source: ElectronicDocument = decode(&raw).map_err(fail)?;
    if source.document_type != DocumentType::Invoice
        || matches!(source.state, DocumentState::Annulled | DocumentState::Rejected)
    {
        return Err(fail(StoreError::SourceUnavailable(claim.source_uuid)));
    }

    let mut ledger = match ledgers.get(source_key.as_str())? {
        Some(raw) => decode::<CreditLedger>(&raw).map_err(fail)?,
        None => CreditLedger::open(source.uuid, &source.payload.lines),
    };
    ledger
        .apply(note_uuid, claim.application, &claim.lines)
        .map_err(fail)?;
    ledgers.insert(source_key.as_str(), encode(&ledger).map_err(fail)?)?;
    Ok(())
}
