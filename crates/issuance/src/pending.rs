use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sri_einv_core::models::{DocumentType, ElectronicDocument};
use sri_einv_core::parsing::payload_digest;
use uuid::Uuid;

use crate::error::StoreError;

/// A document that could not reach the gateway, kept for exact replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDocumentRecord {
    pub uuid: Uuid,
    pub document_type: DocumentType,
    pub access_key: String,
    pub document: ElectronicDocument,
    /// SHA-256 of the payload at the time it was parked.
    pub payload_hash: String,
    pub reason: String,
    pub saved_at: DateTime<Utc>,
}

impl PendingDocumentRecord {
    pub fn new(document: &ElectronicDocument, reason: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self {
            uuid: document.uuid,
            document_type: document.document_type,
            access_key: document.access_key.to_string(),
            payload_hash: payload_digest(&document.payload)?,
            document: document.clone(),
            reason: reason.into(),
            saved_at: Utc::now(),
        })
    }

    /// Fails unless the stored payload still hashes to `payload_hash`.
    pub fn verify(&self) -> Result<(), StoreError> {
        if payload_digest(&self.document.payload)? != self.payload_hash {
            return Err(StoreError::PayloadMismatch(self.uuid));
        }
        Ok(())
    }
}

/// Write-once JSON blobs, one sled tree per document type.
#[derive(Clone)]
pub struct PendingDocumentStore {
    db: sled::Db,
}

pub fn tree_name(document_type: DocumentType) -> String {
    format!("pending/{}", document_type.kind_key())
}

impl PendingDocumentStore {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    fn tree(&self, document_type: DocumentType) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(tree_name(document_type))?)
    }

    /// Stores the record unless one already exists for the same UUID.
    /// Returns whether it was written.
    pub fn save(&self, record: &PendingDocumentRecord) -> Result<bool, StoreError> {
        let tree = self.tree(record.document_type)?;
        let key = record.uuid.to_string();
        let bytes = serde_json::to_vec(record)?;
        let written = tree
            .compare_and_swap(key.as_str(), None::<&[u8]>, Some(bytes))?
            .is_ok();
        if written {
            tree.flush()?;
            tracing::info!(uuid = %record.uuid, doc_type = %record.document_type, "Pending document saved");
        } else {
            tracing::debug!(uuid = %record.uuid, "Pending document already stored");
        }
        Ok(written)
    }

    pub fn load(&self, uuid: Uuid) -> Result<Option<PendingDocumentRecord>, StoreError> {
        let key = uuid.to_string();
        for document_type in DocumentType::ALL {
            if let Some(raw) = self.tree(document_type)?.get(key.as_str())? {
                return Ok(Some(serde_json::from_slice(&raw)?));
            }
        }
        Ok(None)
    }

    /// Drops the record once the gateway confirmed the resubmission.
    pub fn remove(&self, document_type: DocumentType, uuid: Uuid) -> Result<bool, StoreError> {
        let removed = self
            .tree(document_type)?
            .remove(uuid.to_string().as_str())?
            .is_some();
        Ok(removed)
    }

    /// All pending records, oldest first.
    pub fn list(&self) -> Result<Vec<PendingDocumentRecord>, StoreError> {
        let mut out = Vec::new();
        for document_type in DocumentType::ALL {
            for item in self.tree(document_type)?.iter() {
                let (_k, v) = item?;
                out.push(serde_json::from_slice::<PendingDocumentRecord>(&v)?);
            }
        }
        out.sort_by_key(|r| r.saved_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentStore;
    use chrono::NaiveDate;
    use sri_einv_core::access_key::{AccessKeyCodec, KeyInput};
    use sri_einv_core::models::{
        Calculation, DocumentDetail, DocumentPayload, Environment, IssuerInfo,
    };
    use sri_einv_core::state::{ActorContext, DocumentState, StateChange};

    fn document(sequence: &str) -> ElectronicDocument {
        let emission_date = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        let access_key = AccessKeyCodec::default()
            .generate(&KeyInput {
                emission_date,
                document_type: DocumentType::Invoice,
                issuer_ruc: "0992877878001",
                environment: Environment::Test,
                establishment: "001",
                emission_point: "001",
                sequence,
            })
            .unwrap();
        let now = Utc::now();
        ElectronicDocument {
            uuid: Uuid::new_v4(),
            document_type: DocumentType::Invoice,
            issuer_ruc: "0992877878001".into(),
            establishment: "001".into(),
            emission_point: "001".into(),
            sequence: sequence.into(),
            access_key,
            state: DocumentState::PendingGateway,
            environment: Environment::Test,
            emission_date,
            payload: DocumentPayload {
                issuer: IssuerInfo {
                    ruc: "0992877878001".into(),
                    business_name: "Distribuidora del Pacifico".into(),
                    trade_name: None,
                    establishment: "001".into(),
                    emission_point: "001".into(),
                    address: None,
                },
                environment: 1,
                emission_type: 1,
                emission_date,
                version: "1.1.0".into(),
                lines: vec![],
                declared: None,
                payments: vec![],
                additional_info: vec![],
                detail: DocumentDetail::Invoice { buyer: None },
            },
            calculation: Calculation::default(),
            gateway: None,
            annulment_reason: None,
            history: vec![StateChange::new(
                None,
                DocumentState::Created,
                &ActorContext::system(),
                None,
            )],
            created_at: now,
            updated_at: now,
        }
    }

    fn pending_store() -> PendingDocumentStore {
        let store = DocumentStore::temporary().unwrap();
        PendingDocumentStore::new(store.db().clone())
    }

    #[test]
    fn records_are_written_once() {
        let pending = pending_store();
        let doc = document("000000001");
        let first = PendingDocumentRecord::new(&doc, "connection refused").unwrap();
        assert!(pending.save(&first).unwrap());

        let second = PendingDocumentRecord::new(&doc, "timeout").unwrap();
        assert!(!pending.save(&second).unwrap());
        assert_eq!(pending.load(doc.uuid).unwrap().unwrap().reason, "connection refused");
    }

    #[test]
    fn removal_and_listing() {
        let pending = pending_store();
        let a = document("000000001");
        let b = document("000000002");
        pending.save(&PendingDocumentRecord::new(&a, "offline").unwrap()).unwrap();
        pending.save(&PendingDocumentRecord::new(&b, "offline").unwrap()).unwrap();
        assert_eq!(pending.list().unwrap().len(), 2);

        assert!(pending.remove(DocumentType::Invoice, a.uuid).unwrap());
        assert!(!pending.remove(DocumentType::Invoice, a.uuid).unwrap());
        let left = pending.list().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].uuid, b.uuid);
        assert_eq!(tree_name(DocumentType::CreditNote), "pending/notaCredito");
    }

    #[test]
    fn edited_payload_fails_verification() {
        let doc = document("000000001");
        let mut record = PendingDocumentRecord::new(&doc, "offline").unwrap();
        assert_eq!(record.payload_hash.len(), 64);
        assert!(record.verify().is_ok());

        record.document.payload.issuer.business_name = "Otra Razon Social".into();
        assert!(matches!(
            record.verify(),
            Err(StoreError::PayloadMismatch(u)) if u == doc.uuid
        ));
    }
}
