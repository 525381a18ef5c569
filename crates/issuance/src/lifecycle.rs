//! Document issuance pipeline and state machine.
//!
//! `create` runs validate, calculate, allocate sequence, generate access key,
//! persist and submit. Gateway unavailability is not an error: the document
//! is parked in the pending store and reported with a warning.

use chrono::{NaiveDate, Utc};
use gateway::{GatewayClient, GatewayError, GatewayStatus, SubmissionReceipt};
use serde::Serialize;
use sri_einv_core::access_key::{self, AccessKeyCodec, KeyInput};
use sri_einv_core::error::{ValidationCategory, ValidationReport};
use sri_einv_core::models::{
    Calculation, DocumentDetail, DocumentPayload, DocumentType, ElectronicDocument, Environment,
    GatewayVerdict,
};
use sri_einv_core::parsing::payload_digest;
use sri_einv_core::state::{transition, ActorContext, DocumentState, InvalidTransition, StateChange};
use sri_einv_core::tax::{CalculationContext, TaxCalculator, TaxRateCatalog};
use sri_einv_core::validation::{CreditLedger, DocumentValidator};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog};
use crate::error::{LifecycleError, StoreError};
use crate::pending::{PendingDocumentRecord, PendingDocumentStore};
use crate::sequence::{KeyedLocks, SequenceKey};
use crate::store::{CreditClaim, DocumentStore};

pub const MIN_REASON_LEN: usize = 10;
pub const MAX_REASON_LEN: usize = 300;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub numeric_code: String,
    pub apply_default_taxes: bool,
    /// Hard limit on one gateway exchange, probe included.
    pub gateway_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            numeric_code: access_key::DEFAULT_NUMERIC_CODE.to_string(),
            apply_default_taxes: false,
            gateway_timeout: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssueOutcome {
    pub document: ElectronicDocument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReprocessOutcome {
    pub document: ElectronicDocument,
    pub resubmitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

struct Prepared {
    calculation: Calculation,
    credit: Option<CreditClaim>,
    digest: String,
}

fn single_error(category: ValidationCategory, message: String) -> LifecycleError {
    let mut report = ValidationReport::new();
    report.push(category, message);
    LifecycleError::Validation(report)
}

pub struct DocumentLifecycleManager {
    store: DocumentStore,
    pending: PendingDocumentStore,
    gateway: Arc<dyn GatewayClient>,
    calculator: TaxCalculator,
    validator: DocumentValidator,
    codec: AccessKeyCodec,
    settings: LifecycleSettings,
    point_locks: KeyedLocks,
    document_locks: KeyedLocks,
    audit: AuditLog,
    clock: Clock,
}

impl DocumentLifecycleManager {
    pub fn new(
        store: DocumentStore,
        pending: PendingDocumentStore,
        gateway: Arc<dyn GatewayClient>,
        catalog: Arc<dyn TaxRateCatalog>,
        settings: LifecycleSettings,
    ) -> Result<Self, LifecycleError> {
        let codec = AccessKeyCodec::new(&settings.numeric_code)
            .map_err(|e| LifecycleError::InvalidAccessKey(e.to_string()))?;
        Ok(Self {
            store,
            pending,
            gateway,
            calculator: TaxCalculator::new(catalog),
            validator: DocumentValidator::new(settings.apply_default_taxes),
            codec,
            settings,
            point_locks: KeyedLocks::new(),
            document_locks: KeyedLocks::new(),
            audit: AuditLog::disabled(),
            clock: Arc::new(|| chrono::Local::now().date_naive()),
        })
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// Replaces the source of "today" used for the future-date check.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn pending_store(&self) -> &PendingDocumentStore {
        &self.pending
    }

    pub async fn create(
        &self,
        ctx: &ActorContext,
        doc_type: DocumentType,
        payload: DocumentPayload,
    ) -> Result<IssueOutcome, LifecycleError> {
        let prepared = match self.prepare(doc_type, &payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::info!(doc_type = %doc_type, error = %e, "Document refused");
                return Err(e);
            }
        };

        let key = SequenceKey {
            issuer_ruc: payload.issuer.ruc.clone(),
            establishment: payload.issuer.establishment.clone(),
            emission_point: payload.issuer.emission_point.clone(),
            document_type: doc_type,
        };
        let uuid = Uuid::new_v4();

        let doc = {
            let _point = self.point_locks.lock(&key.emission_point_id()).await;
            self.store.issue(&key, prepared.credit.as_ref(), |sequence| {
                self.build_document(uuid, ctx, &payload, &prepared.calculation, sequence)
            })?
        };

        tracing::info!(
            uuid = %doc.uuid,
            access_key = %doc.access_key,
            number = %doc.number(),
            doc_type = %doc_type,
            "Document created"
        );
        self.audit.record(
            &AuditEvent::for_document("document_created", &doc)
                .with_actor(ctx)
                .with_hash(prepared.digest),
        );

        let _doc_lock = self.document_locks.lock(&doc.uuid.to_string()).await;
        self.submit_new(ctx, doc).await
    }

    fn prepare(&self, doc_type: DocumentType, payload: &DocumentPayload) -> Result<Prepared, LifecycleError> {
        if payload.document_type() != doc_type {
            return Err(single_error(
                ValidationCategory::Ambient,
                format!(
                    "payload is a {} but {doc_type} was requested",
                    payload.document_type()
                ),
            ));
        }

        self.validator.validate_basics(payload, (self.clock)())?;

        let ctx = CalculationContext::for_payload(payload, self.settings.apply_default_taxes)
            .ok_or_else(|| {
                single_error(
                    ValidationCategory::Ambient,
                    format!("unknown schema version {}", payload.version),
                )
            })?;
        let calculation = self.calculator.calculate(payload, &ctx)?;
        self.calculator.validate_declared(payload, &calculation)?;
        self.validator.validate_totals(payload, &calculation.totals)?;

        let credit = self.credit_claim(payload)?;
        let digest = payload_digest(payload).map_err(StoreError::from)?;
        Ok(Prepared {
            calculation,
            credit,
            digest,
        })
    }

    /// Resolves the invoice a credit note applies to and checks the ledger
    /// before anything is persisted. The store checks again inside the
    /// issuing transaction.
    fn credit_claim(&self, payload: &DocumentPayload) -> Result<Option<CreditClaim>, LifecycleError> {
        let DocumentDetail::CreditNote {
            modified: Some(modified),
            application,
            ..
        } = &payload.detail
        else {
            return Ok(None);
        };

        let source_key = modified.access_key.as_deref().unwrap_or_default();
        let Some(source) = self.store.by_access_key(source_key)? else {
            return Err(single_error(
                ValidationCategory::Counterparty,
                format!("modified document {source_key} was not issued by this system"),
            ));
        };
        if source.document_type != DocumentType::Invoice
            || matches!(source.state, DocumentState::Annulled | DocumentState::Rejected)
        {
            return Err(single_error(
                ValidationCategory::Counterparty,
                format!(
                    "modified document {} is a {} in state {} and cannot receive credit notes",
                    source.number(),
                    source.document_type,
                    source.state
                ),
            ));
        }
        if source.issuer_ruc != payload.issuer.ruc || source.number() != modified.number {
            return Err(single_error(
                ValidationCategory::Counterparty,
                format!(
                    "modified document reference {} does not match the issued document {}",
                    modified.number,
                    source.number()
                ),
            ));
        }

        let ledger = self
            .store
            .ledger(source.uuid)?
            .unwrap_or_else(|| CreditLedger::open(source.uuid, &source.payload.lines));
        ledger.check(*application, &payload.lines)?;

        Ok(Some(CreditClaim {
            source_uuid: source.uuid,
            application: *application,
            lines: payload.lines.clone(),
        }))
    }

    fn build_document(
        &self,
        uuid: Uuid,
        ctx: &ActorContext,
        payload: &DocumentPayload,
        calculation: &Calculation,
        sequence: &str,
    ) -> Result<ElectronicDocument, StoreError> {
        let environment = Environment::from_code(payload.environment)
            .ok_or_else(|| StoreError::Build(format!("unknown environment {}", payload.environment)))?;
        let document_type = payload.document_type();
        let access_key = self
            .codec
            .generate(&KeyInput {
                emission_date: payload.emission_date,
                document_type,
                issuer_ruc: &payload.issuer.ruc,
                environment,
                establishment: &payload.issuer.establishment,
                emission_point: &payload.issuer.emission_point,
                sequence,
            })
            .map_err(|e| StoreError::Build(e.to_string()))?;

        let now = Utc::now();
        Ok(ElectronicDocument {
            uuid,
            document_type,
            issuer_ruc: payload.issuer.ruc.clone(),
            establishment: payload.issuer.establishment.clone(),
            emission_point: payload.issuer.emission_point.clone(),
            sequence: sequence.to_string(),
            access_key,
            state: DocumentState::Created,
            environment,
            emission_date: payload.emission_date,
            payload: payload.clone(),
            calculation: calculation.clone(),
            gateway: None,
            annulment_reason: None,
            history: vec![StateChange::new(None, DocumentState::Created, ctx, None)],
            created_at: now,
            updated_at: now,
        })
    }

    /// One gateway exchange (probe, then submit) under the hard timeout.
    async fn send(&self, doc: &ElectronicDocument) -> Result<SubmissionReceipt, GatewayError> {
        let value = serde_json::to_value(doc)
            .map_err(|e| GatewayError::Protocol(format!("cannot encode document: {e}")))?;
        let limit = self.settings.gateway_timeout;
        let exchange = async {
            if !self.gateway.is_available().await {
                return Err(GatewayError::Unavailable("reachability probe failed".to_string()));
            }
            self.gateway.submit(doc.document_type, &value).await
        };

        let receipt = match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::Unavailable(format!(
                    "no answer within {} ms",
                    limit.as_millis()
                )))
            }
        };

        if let Some(confirmed) = &receipt.access_key_confirmed {
            if confirmed != doc.access_key.as_str() {
                return Err(GatewayError::Protocol(format!(
                    "gateway confirmed access key {confirmed} for {}",
                    doc.access_key
                )));
            }
        }
        Ok(receipt)
    }

    fn apply_receipt(
        ctx: &ActorContext,
        doc: &mut ElectronicDocument,
        receipt: &SubmissionReceipt,
    ) -> Result<(), InvalidTransition> {
        let (target, status) = match receipt.status {
            GatewayStatus::Authorized => (DocumentState::Authorized, "AUTHORIZED"),
            GatewayStatus::Received => (DocumentState::Sent, "RECEIVED"),
        };
        transition(&mut doc.state, &mut doc.history, target, ctx, receipt.message.clone())?;
        doc.gateway = Some(GatewayVerdict {
            status: status.to_string(),
            authorization_number: receipt.authorization_number.clone(),
            message: receipt.message.clone(),
            received_at: Utc::now(),
        });
        doc.updated_at = Utc::now();
        Ok(())
    }

    fn apply_rejection(
        ctx: &ActorContext,
        doc: &mut ElectronicDocument,
        status: String,
        reason: &str,
    ) -> Result<(), InvalidTransition> {
        if doc.state != DocumentState::Sent {
            transition(&mut doc.state, &mut doc.history, DocumentState::Sent, ctx, None)?;
        }
        transition(
            &mut doc.state,
            &mut doc.history,
            DocumentState::Rejected,
            ctx,
            Some(reason.to_string()),
        )?;
        doc.gateway = Some(GatewayVerdict {
            status,
            authorization_number: None,
            message: Some(reason.to_string()),
            received_at: Utc::now(),
        });
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn submit_new(
        &self,
        ctx: &ActorContext,
        mut doc: ElectronicDocument,
    ) -> Result<IssueOutcome, LifecycleError> {
        match self.send(&doc).await {
            Ok(receipt) => {
                Self::apply_receipt(ctx, &mut doc, &receipt)?;
                self.store.update(&doc)?;
                tracing::info!(uuid = %doc.uuid, state = %doc.state, "Document submitted");
                self.audit
                    .record(&AuditEvent::for_document("document_submitted", &doc).with_actor(ctx));
                Ok(IssueOutcome {
                    document: doc,
                    warning: None,
                })
            }
            Err(GatewayError::Unavailable(reason)) => {
                transition(
                    &mut doc.state,
                    &mut doc.history,
                    DocumentState::PendingGateway,
                    ctx,
                    Some(reason.clone()),
                )?;
                doc.updated_at = Utc::now();
                self.pending
                    .save(&PendingDocumentRecord::new(&doc, reason.clone())?)?;
                self.store.update(&doc)?;
                tracing::warn!(uuid = %doc.uuid, reason = %reason, "Gateway unavailable, document queued");
                self.audit.record(
                    &AuditEvent::for_document("document_pending", &doc)
                        .with_actor(ctx)
                        .with_error(reason.clone()),
                );
                Ok(IssueOutcome {
                    document: doc,
                    warning: Some(format!(
                        "gateway unavailable, document queued for reprocessing: {reason}"
                    )),
                })
            }
            Err(GatewayError::Rejected { status, reason }) => {
                Self::apply_rejection(ctx, &mut doc, status, &reason)?;
                self.store.update(&doc)?;
                tracing::warn!(uuid = %doc.uuid, reason = %reason, "Document rejected by gateway");
                self.audit.record(
                    &AuditEvent::for_document("document_rejected", &doc)
                        .with_actor(ctx)
                        .with_error(reason.clone()),
                );
                Ok(IssueOutcome {
                    document: doc,
                    warning: Some(format!("document rejected by the gateway: {reason}")),
                })
            }
            Err(GatewayError::Protocol(detail)) => {
                tracing::error!(uuid = %doc.uuid, error = %detail, "Gateway protocol error");
                self.audit.record(
                    &AuditEvent::for_document("gateway_protocol_error", &doc)
                        .with_actor(ctx)
                        .with_error(detail.clone()),
                );
                Err(LifecycleError::GatewayProtocol(detail))
            }
        }
    }

    pub async fn annul(
        &self,
        ctx: &ActorContext,
        access_key: &str,
        reason: &str,
    ) -> Result<ElectronicDocument, LifecycleError> {
        let reason = reason.trim();
        let len = reason.chars().count();
        if !(MIN_REASON_LEN..=MAX_REASON_LEN).contains(&len) {
            return Err(LifecycleError::InvalidReason(len));
        }

        let found = self.by_access_key(access_key).await?;
        let _lock = self.document_locks.lock(&found.uuid.to_string()).await;
        let mut doc = self
            .store
            .get(found.uuid)?
            .ok_or_else(|| LifecycleError::NotFound(found.uuid.to_string()))?;

        transition(
            &mut doc.state,
            &mut doc.history,
            DocumentState::Annulled,
            ctx,
            Some(reason.to_string()),
        )?;
        doc.annulment_reason = Some(reason.to_string());
        doc.updated_at = Utc::now();

        let release_from = match &doc.payload.detail {
            DocumentDetail::CreditNote {
                modified: Some(modified),
                ..
            } => match modified.access_key.as_deref() {
                Some(key) => self.store.by_access_key(key)?.map(|source| source.uuid),
                None => None,
            },
            _ => None,
        };
        self.store.save_annulment(&doc, release_from)?;

        tracing::info!(uuid = %doc.uuid, access_key = %doc.access_key, actor = %ctx.user_id, "Document annulled");
        self.audit.record(
            &AuditEvent::for_document("document_annulled", &doc)
                .with_actor(ctx)
                .with_note(reason.to_string()),
        );
        Ok(doc)
    }

    pub async fn reprocess(
        &self,
        ctx: &ActorContext,
        uuid: Uuid,
    ) -> Result<ReprocessOutcome, LifecycleError> {
        let _lock = self.document_locks.lock(&uuid.to_string()).await;
        let record = self
            .pending
            .load(uuid)?
            .ok_or(LifecycleError::NotPending(uuid))?;
        let mut doc = self
            .store
            .get(uuid)?
            .ok_or_else(|| LifecycleError::NotFound(uuid.to_string()))?;
        if doc.state != DocumentState::PendingGateway {
            return Err(InvalidTransition {
                from: doc.state,
                to: DocumentState::Sent,
            }
            .into());
        }
        if let Err(e) = record.verify() {
            tracing::error!(uuid = %uuid, error = %e, "Pending record does not match its payload hash");
            return Err(e.into());
        }

        match self.send(&record.document).await {
            Ok(receipt) => {
                Self::apply_receipt(ctx, &mut doc, &receipt)?;
                self.store.update(&doc)?;
                self.pending.remove(doc.document_type, uuid)?;
                tracing::info!(uuid = %uuid, state = %doc.state, "Pending document resubmitted");
                self.audit
                    .record(&AuditEvent::for_document("document_reprocessed", &doc).with_actor(ctx));
                Ok(ReprocessOutcome {
                    document: doc,
                    resubmitted: true,
                    reason: None,
                })
            }
            Err(e) => {
                tracing::warn!(uuid = %uuid, error = %e, "Reprocessing failed, document stays pending");
                self.audit.record(
                    &AuditEvent::for_document("reprocess_failed", &doc)
                        .with_actor(ctx)
                        .with_error(e.to_string()),
                );
                let reason = match e {
                    GatewayError::Rejected { reason, .. } => reason,
                    other => other.to_string(),
                };
                Ok(ReprocessOutcome {
                    document: doc,
                    resubmitted: false,
                    reason: Some(reason),
                })
            }
        }
    }

    /// Asks the gateway for the authorization result of a SENT document.
    pub async fn refresh_status(
        &self,
        ctx: &ActorContext,
        uuid: Uuid,
    ) -> Result<IssueOutcome, LifecycleError> {
        let _lock = self.document_locks.lock(&uuid.to_string()).await;
        let mut doc = self
            .store
            .get(uuid)?
            .ok_or_else(|| LifecycleError::NotFound(uuid.to_string()))?;
        if doc.state != DocumentState::Sent {
            return Err(InvalidTransition {
                from: doc.state,
                to: DocumentState::Authorized,
            }
            .into());
        }

        let limit = self.settings.gateway_timeout;
        let answer = tokio::time::timeout(limit, self.gateway.status(doc.access_key.as_str()))
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::Unavailable(format!(
                    "no answer within {} ms",
                    limit.as_millis()
                )))
            });

        let warning = match answer {
            Ok(receipt) if receipt.status == GatewayStatus::Authorized => {
                Self::apply_receipt(ctx, &mut doc, &receipt)?;
                self.store.update(&doc)?;
                self.audit
                    .record(&AuditEvent::for_document("document_authorized", &doc).with_actor(ctx));
                None
            }
            Ok(_) => Some("document is still being processed by the gateway".to_string()),
            Err(GatewayError::Rejected { status, reason }) => {
                Self::apply_rejection(ctx, &mut doc, status, &reason)?;
                self.store.update(&doc)?;
                self.audit.record(
                    &AuditEvent::for_document("document_rejected", &doc)
                        .with_actor(ctx)
                        .with_error(reason.clone()),
                );
                Some(format!("document rejected by the gateway: {reason}"))
            }
            Err(GatewayError::Unavailable(reason)) => Some(format!("gateway unavailable: {reason}")),
            Err(GatewayError::Protocol(detail)) => return Err(LifecycleError::GatewayProtocol(detail)),
        };

        tracing::info!(uuid = %uuid, state = %doc.state, "Status refreshed");
        Ok(IssueOutcome {
            document: doc,
            warning,
        })
    }

    pub async fn by_access_key(&self, access_key: &str) -> Result<ElectronicDocument, LifecycleError> {
        if !access_key::validate(access_key) {
            return Err(LifecycleError::MalformedAccessKey(access_key.to_string()));
        }
        self.store
            .by_access_key(access_key)?
            .ok_or_else(|| LifecycleError::NotFound(access_key.to_string()))
    }

    pub async fn get(&self, uuid: Uuid) -> Result<ElectronicDocument, LifecycleError> {
        self.store
            .get(uuid)?
            .ok_or_else(|| LifecycleError::NotFound(uuid.to_string()))
    }

    pub async fn list_pending(&self) -> Result<Vec<PendingDocumentRecord>, LifecycleError> {
        Ok(self.pending.list()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::{MockBehavior, MockGateway};
    use rust_decimal_macros::dec;
    use sri_einv_core::error::CreditNoteError;
    use sri_einv_core::models::{
        Counterparty, CreditApplication, DeclaredTax, DocumentLineItem, IssuerInfo, ModifiedDocument,
        PaymentMethod, ProductType, TaxType,
    };
    use sri_einv_core::tax::InMemoryCatalog;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        date(2024, 5, 2)
    }

    fn actor() -> ActorContext {
        ActorContext::new("cajero-01", Some("10.0.0.7".into()))
    }

    fn manager_with(gw: Arc<MockGateway>, timeout: Duration) -> DocumentLifecycleManager {
        let store = DocumentStore::temporary().unwrap();
        let pending = PendingDocumentStore::new(store.db().clone());
        let settings = LifecycleSettings {
            gateway_timeout: timeout,
            ..Default::default()
        };
        DocumentLifecycleManager::new(
            store,
            pending,
            gw,
            Arc::new(InMemoryCatalog::sri_defaults()),
            settings,
        )
        .unwrap()
        .with_clock(today)
    }

    fn manager(gw: Arc<MockGateway>) -> DocumentLifecycleManager {
        manager_with(gw, Duration::from_secs(2))
    }

    fn buyer() -> Counterparty {
        Counterparty {
            id_type: "04".into(),
            identification: "1790011674001".into(),
            name: "Comercial Andina S.A.".into(),
            address: None,
            email: None,
        }
    }

    fn line(quantity: rust_decimal::Decimal) -> DocumentLineItem {
        DocumentLineItem {
            product_code: "P-1".into(),
            auxiliary_code: None,
            description: "Widget".into(),
            quantity,
            unit_price: dec!(50),
            discount: dec!(0),
            product_type: ProductType::Normal,
            taxes: vec![DeclaredTax {
                tax_type: TaxType::Iva,
                rate_code: "4".into(),
                rate: None,
                taxable_base: None,
                value: None,
            }],
        }
    }

    /// Two widgets at 50.00 plus IVA 15%: 115.00.
    fn invoice() -> DocumentPayload {
        DocumentPayload {
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
            emission_date: today(),
            version: "1.1.0".into(),
            lines: vec![line(dec!(2))],
            declared: None,
            payments: vec![PaymentMethod {
                code: "01".into(),
                amount: dec!(115),
                term: None,
                time_unit: None,
            }],
            additional_info: vec![],
            detail: DocumentDetail::Invoice {
                buyer: Some(buyer()),
            },
        }
    }

    fn credit_note(
        source: &ElectronicDocument,
        application: CreditApplication,
        quantity: rust_decimal::Decimal,
    ) -> DocumentPayload {
        let mut p = invoice();
        p.lines = vec![line(quantity)];
        p.payments.clear();
        p.detail = DocumentDetail::CreditNote {
            buyer: Some(buyer()),
            modified: Some(ModifiedDocument {
                document_type: DocumentType::Invoice,
                number: source.number(),
                access_key: Some(source.access_key.to_string()),
                emission_date: source.emission_date,
            }),
            application,
            reason: "Devolucion de mercaderia".into(),
        };
        p
    }

    async fn issue_invoice(m: &DocumentLifecycleManager) -> ElectronicDocument {
        m.create(&actor(), DocumentType::Invoice, invoice())
            .await
            .unwrap()
            .document
    }

    #[tokio::test]
    async fn authorized_invoice_is_numbered_and_indexed() {
        let gw = MockGateway::authorizing();
        let m = manager(gw.clone());

        let out = m.create(&actor(), DocumentType::Invoice, invoice()).await.unwrap();
        let doc = out.document;
        assert!(out.warning.is_none());
        assert_eq!(doc.state, DocumentState::Authorized);
        assert_eq!(doc.number(), "001-001-000000001");
        assert_eq!(doc.totals().grand_total, dec!(115));
        assert!(access_key::validate(doc.access_key.as_str()));
        let verdict = doc.gateway.as_ref().unwrap();
        assert_eq!(verdict.authorization_number.as_ref().map(String::len), Some(37));

        let states: Vec<_> = doc.history.iter().map(|h| h.to).collect();
        assert_eq!(states, vec![DocumentState::Created, DocumentState::Authorized]);

        let found = m.by_access_key(doc.access_key.as_str()).await.unwrap();
        assert_eq!(found.uuid, doc.uuid);
        assert_eq!(gw.submissions().len(), 1);
        assert!(gw.submissions()[0].envelope.get("factura").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_never_repeats_a_sequence() {
        let m = Arc::new(manager(MockGateway::authorizing()));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let m = Arc::clone(&m);
            handles.push(tokio::spawn(async move {
                m.create(&actor(), DocumentType::Invoice, invoice())
                    .await
                    .unwrap()
                    .document
                    .sequence
            }));
        }
        let mut sequences = Vec::new();
        for h in handles {
            sequences.push(h.await.unwrap());
        }
        sequences.sort();
        let expected: Vec<String> = (1..=20).map(|n| format!("{n:09}")).collect();
        assert_eq!(sequences, expected);
    }

    #[tokio::test]
    async fn refused_payload_consumes_no_sequence() {
        let m = manager(MockGateway::authorizing());
        let mut bad = invoice();
        bad.payments[0].amount = dec!(100);
        let err = m
            .create(&actor(), DocumentType::Invoice, bad)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 422);

        let doc = issue_invoice(&m).await;
        assert_eq!(doc.sequence, "000000001");
    }

    #[tokio::test]
    async fn requested_type_must_match_payload() {
        let m = manager(MockGateway::authorizing());
        let err = m
            .create(&actor(), DocumentType::CreditNote, invoice())
            .await
            .unwrap_err();
        match err {
            LifecycleError::Validation(report) => assert!(report.has(ValidationCategory::Ambient)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn final_consumer_invoice_above_cap_is_refused() {
        let m = manager(MockGateway::authorizing());
        let mut p = invoice();
        p.detail = DocumentDetail::Invoice {
            buyer: Some(Counterparty {
                id_type: "07".into(),
                identification: "9999999999999".into(),
                name: "Consumidor final".into(),
                address: None,
                email: None,
            }),
        };
        let err = m.create(&actor(), DocumentType::Invoice, p).await.unwrap_err();
        match err {
            LifecycleError::Validation(report) => assert!(report.has(ValidationCategory::Totals)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unavailable_gateway_parks_document_until_reprocessed() {
        let gw = MockGateway::authorizing();
        gw.set_available(false);
        let m = manager(gw.clone());

        let out = m.create(&actor(), DocumentType::Invoice, invoice()).await.unwrap();
        assert_eq!(out.document.state, DocumentState::PendingGateway);
        assert!(out.warning.unwrap().contains("queued"));
        let uuid = out.document.uuid;

        let pending = m.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].access_key, out.document.access_key.to_string());

        let retry = m.reprocess(&actor(), uuid).await.unwrap();
        assert!(!retry.resubmitted);
        assert!(retry.reason.is_some());
        assert_eq!(retry.document.state, DocumentState::PendingGateway);
        assert_eq!(m.list_pending().await.unwrap().len(), 1);

        gw.set_available(true);
        let done = m.reprocess(&actor(), uuid).await.unwrap();
        assert!(done.resubmitted);
        assert_eq!(done.document.state, DocumentState::Authorized);
        assert_eq!(
            gw.submissions()[0].envelope["factura"]["access_key"],
            serde_json::json!(out.document.access_key.to_string())
        );
        assert!(m.list_pending().await.unwrap().is_empty());

        assert!(matches!(
            m.reprocess(&actor(), uuid).await,
            Err(LifecycleError::NotPending(u)) if u == uuid
        ));
    }

    #[tokio::test]
    async fn rejected_reprocess_keeps_the_pending_record() {
        let gw = MockGateway::authorizing();
        gw.set_available(false);
        let m = manager(gw.clone());
        let doc = issue_invoice(&m).await;

        gw.set_available(true);
        gw.push(MockBehavior::Reject("CLAVE ACCESO REGISTRADA".into()));
        let out = m.reprocess(&actor(), doc.uuid).await.unwrap();
        assert!(!out.resubmitted);
        assert_eq!(out.reason.as_deref(), Some("CLAVE ACCESO REGISTRADA"));
        assert_eq!(m.get(doc.uuid).await.unwrap().state, DocumentState::PendingGateway);
        assert_eq!(m.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn edited_pending_payload_is_not_replayed() {
        let gw = MockGateway::authorizing();
        gw.set_available(false);
        let m = manager(gw.clone());
        let doc = issue_invoice(&m).await;

        let mut record = m.pending_store().load(doc.uuid).unwrap().unwrap();
        record.document.payload.lines[0].unit_price = dec!(1);
        m.store()
            .db()
            .open_tree(crate::pending::tree_name(DocumentType::Invoice))
            .unwrap()
            .insert(doc.uuid.to_string().as_str(), serde_json::to_vec(&record).unwrap())
            .unwrap();

        gw.set_available(true);
        let err = m.reprocess(&actor(), doc.uuid).await.unwrap_err();
        assert!(matches!(err, LifecycleError::PendingMismatch(u) if u == doc.uuid));
        assert_eq!(err.status_code(), 500);
        assert!(gw.submissions().is_empty());
        assert_eq!(m.get(doc.uuid).await.unwrap().state, DocumentState::PendingGateway);
        assert_eq!(m.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_gateway_times_out_into_pending() {
        let gw = MockGateway::with_latency(MockBehavior::Authorize, Duration::from_secs(5));
        let m = manager_with(gw, Duration::from_millis(100));

        let out = m.create(&actor(), DocumentType::Invoice, invoice()).await.unwrap();
        assert_eq!(out.document.state, DocumentState::PendingGateway);
        assert!(out.warning.unwrap().contains("no answer within 100 ms"));
    }

    #[tokio::test]
    async fn rejection_is_recorded_with_warning() {
        let gw = MockGateway::authorizing();
        gw.push(MockBehavior::Reject("ERROR SECUENCIAL REGISTRADO".into()));
        let m = manager(gw);

        let out = m.create(&actor(), DocumentType::Invoice, invoice()).await.unwrap();
        assert_eq!(out.document.state, DocumentState::Rejected);
        assert!(out.warning.unwrap().contains("ERROR SECUENCIAL REGISTRADO"));
        let states: Vec<_> = out.document.history.iter().map(|h| h.to).collect();
        assert_eq!(
            states,
            vec![DocumentState::Created, DocumentState::Sent, DocumentState::Rejected]
        );
        assert_eq!(out.document.gateway.unwrap().status, "DEVUELTA");
    }

    #[tokio::test]
    async fn protocol_error_leaves_document_created() {
        let gw = MockGateway::authorizing();
        gw.push(MockBehavior::Protocol("unexpected element".into()));
        let m = manager(gw);

        let err = m
            .create(&actor(), DocumentType::Invoice, invoice())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
        let stored = m.store().list().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, DocumentState::Created);
    }

    #[tokio::test]
    async fn received_document_is_authorized_on_refresh() {
        let gw = MockGateway::authorizing();
        gw.push(MockBehavior::Receive);
        let m = manager(gw.clone());

        let doc = issue_invoice(&m).await;
        assert_eq!(doc.state, DocumentState::Sent);
        assert!(matches!(
            m.annul(&actor(), doc.access_key.as_str(), "Error en datos del comprador")
                .await,
            Err(LifecycleError::InvalidTransition(_))
        ));
        assert_eq!(m.get(doc.uuid).await.unwrap().state, DocumentState::Sent);

        gw.push_status(MockBehavior::Receive);
        let still = m.refresh_status(&actor(), doc.uuid).await.unwrap();
        assert_eq!(still.document.state, DocumentState::Sent);
        assert!(still.warning.is_some());

        let done = m.refresh_status(&actor(), doc.uuid).await.unwrap();
        assert_eq!(done.document.state, DocumentState::Authorized);
        assert!(matches!(
            m.refresh_status(&actor(), doc.uuid).await,
            Err(LifecycleError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn annulment_rules() {
        let gw = MockGateway::authorizing();
        let m = manager(gw.clone());
        let doc = issue_invoice(&m).await;
        let key = doc.access_key.to_string();

        assert!(matches!(
            m.annul(&actor(), &key, "corto").await,
            Err(LifecycleError::InvalidReason(5))
        ));
        let annulled = m
            .annul(&actor(), &key, "Error en datos del comprador")
            .await
            .unwrap();
        assert_eq!(annulled.state, DocumentState::Annulled);
        assert_eq!(
            annulled.annulment_reason.as_deref(),
            Some("Error en datos del comprador")
        );
        assert_eq!(annulled.history.last().unwrap().actor, "cajero-01");

        let again = m
            .annul(&actor(), &key, "Error en datos del comprador")
            .await
            .unwrap_err();
        assert!(matches!(again, LifecycleError::InvalidTransition(_)));
        assert_eq!(again.status_code(), 422);

        gw.set_available(false);
        let parked = issue_invoice(&m).await;
        assert!(matches!(
            m.annul(&actor(), parked.access_key.as_str(), "Cliente desiste de la compra")
                .await,
            Err(LifecycleError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn lookup_distinguishes_malformed_and_unknown_keys() {
        let m = manager(MockGateway::authorizing());
        let malformed = m.by_access_key("123").await.unwrap_err();
        assert_eq!(malformed.status_code(), 400);

        let unknown = AccessKeyCodec::default()
            .generate(&KeyInput {
                emission_date: today(),
                document_type: DocumentType::Invoice,
                issuer_ruc: "0992877878001",
                environment: Environment::Test,
                establishment: "001",
                emission_point: "001",
                sequence: "000000999",
            })
            .unwrap();
        let missing = m.by_access_key(unknown.as_str()).await.unwrap_err();
        assert_eq!(missing.status_code(), 404);
    }

    #[tokio::test]
    async fn total_credit_note_after_partial_is_refused() {
        let m = manager(MockGateway::authorizing());
        let source = issue_invoice(&m).await;

        let partial = m
            .create(
                &actor(),
                DocumentType::CreditNote,
                credit_note(&source, CreditApplication::Partial, dec!(1)),
            )
            .await
            .unwrap()
            .document;
        assert_eq!(partial.state, DocumentState::Authorized);
        assert_eq!(
            m.store().ledger(source.uuid).unwrap().unwrap().available_quantity("P-1"),
            dec!(1)
        );

        let total = m
            .create(
                &actor(),
                DocumentType::CreditNote,
                credit_note(&source, CreditApplication::Total, dec!(2)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            total,
            LifecycleError::CreditNote(CreditNoteError::PartialNotesExist(1))
        ));
        assert_eq!(m.store().list().unwrap().len(), 2);

        let excess = m
            .create(
                &actor(),
                DocumentType::CreditNote,
                credit_note(&source, CreditApplication::Partial, dec!(2)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            excess,
            LifecycleError::CreditNote(CreditNoteError::QuantityExceeded { .. })
        ));

        // Annulling the partial note gives the quantity back.
        m.annul(&actor(), partial.access_key.as_str(), "Nota emitida por error")
            .await
            .unwrap();
        let total = m
            .create(
                &actor(),
                DocumentType::CreditNote,
                credit_note(&source, CreditApplication::Total, dec!(2)),
            )
            .await
            .unwrap();
        assert_eq!(total.document.state, DocumentState::Authorized);
    }

    #[tokio::test]
    async fn credit_note_needs_a_live_source_invoice() {
        let m = manager(MockGateway::authorizing());
        let source = issue_invoice(&m).await;
        m.annul(&actor(), source.access_key.as_str(), "Factura emitida por error")
            .await
            .unwrap();

        let err = m
            .create(
                &actor(),
                DocumentType::CreditNote,
                credit_note(&source, CreditApplication::Partial, dec!(1)),
            )
            .await
            .unwrap_err();
        match err {
            LifecycleError::Validation(report) => {
                assert!(report.has(ValidationCategory::Counterparty))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
