use sri_einv_core::error::{CreditNoteError, TaxError, ValidationReport};
use sri_einv_core::parsing::PayloadError;
use sri_einv_core::state::InvalidTransition;
use thiserror::Error;
use uuid::Uuid;

/// Failures of the sled-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("sequence exhausted for {key}")]
    SequenceExhausted { key: String },
    #[error("corrupt counter for {0}")]
    CorruptCounter(String),
    #[error(transparent)]
    CreditNote(#[from] CreditNoteError),
    #[error("source document {0} cannot receive credit notes")]
    SourceUnavailable(Uuid),
    #[error("access key {0} already issued")]
    DuplicateAccessKey(String),
    #[error("document build failed: {0}")]
    Build(String),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("pending record {0} no longer matches its payload hash")]
    PayloadMismatch(Uuid),
}

impl From<sled::transaction::TransactionError<StoreError>> for StoreError {
    fn from(e: sled::transaction::TransactionError<StoreError>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(err) => StoreError::Sled(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationReport),
    #[error(transparent)]
    Tax(#[from] TaxError),
    #[error(transparent)]
    CreditNote(#[from] CreditNoteError),
    #[error("sequence exhausted for {key}; operator intervention required")]
    SequenceExhausted { key: String },
    #[error("malformed access key: {0}")]
    MalformedAccessKey(String),
    #[error("invalid access key input: {0}")]
    InvalidAccessKey(String),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("annulment reason must be 10 to 300 characters, got {0}")]
    InvalidReason(usize),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document {0} has no pending record")]
    NotPending(Uuid),
    #[error("gateway protocol error: {0}")]
    GatewayProtocol(String),
    #[error("pending record {0} no longer matches its payload hash")]
    PendingMismatch(Uuid),
    #[error("storage error: {0}")]
    Storage(String),
}

impl LifecycleError {
    /// HTTP-equivalent status for the response envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            LifecycleError::Validation(_)
            | LifecycleError::Tax(_)
            | LifecycleError::CreditNote(_)
            | LifecycleError::InvalidAccessKey(_)
            | LifecycleError::InvalidTransition(_)
            | LifecycleError::InvalidReason(_) => 422,
            LifecycleError::MalformedAccessKey(_) => 400,
            LifecycleError::NotFound(_) => 404,
            LifecycleError::NotPending(_) => 409,
            LifecycleError::SequenceExhausted { .. }
            | LifecycleError::GatewayProtocol(_)
            | LifecycleError::PendingMismatch(_)
            | LifecycleError::Storage(_) => 500,
        }
    }

    /// Short machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::Validation(_) => "validation_error",
            LifecycleError::Tax(TaxError::InvalidTax { .. }) => "invalid_tax",
            LifecycleError::Tax(TaxError::TaxMismatch(_)) => "tax_mismatch",
            LifecycleError::Tax(TaxError::TaxCoherence { .. }) => "tax_coherence",
            LifecycleError::Tax(TaxError::CatalogUnavailable(_)) => "catalog_unavailable",
            LifecycleError::Tax(TaxError::AmountOutOfRange(_)) => "amount_out_of_range",
            LifecycleError::CreditNote(_) => "credit_note_error",
            LifecycleError::SequenceExhausted { .. } => "sequence_exhausted",
            LifecycleError::MalformedAccessKey(_) | LifecycleError::InvalidAccessKey(_) => {
                "invalid_access_key"
            }
            LifecycleError::InvalidTransition(_) => "invalid_state_transition",
            LifecycleError::InvalidReason(_) => "invalid_reason",
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::NotPending(_) => "not_pending",
            LifecycleError::GatewayProtocol(_) => "gateway_protocol_error",
            LifecycleError::PendingMismatch(_) => "pending_record_mismatch",
            LifecycleError::Storage(_) => "storage_error",
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CreditNote(inner) => LifecycleError::CreditNote(inner),
            StoreError::SequenceExhausted { key } => LifecycleError::SequenceExhausted { key },
            StoreError::Build(reason) => LifecycleError::InvalidAccessKey(reason),
            StoreError::SourceUnavailable(uuid) => {
                let mut report = ValidationReport::new();
                report.push(
                    sri_einv_core::error::ValidationCategory::Counterparty,
                    format!("source document {uuid} cannot receive credit notes"),
                );
                LifecycleError::Validation(report)
            }
            StoreError::PayloadMismatch(uuid) => LifecycleError::PendingMismatch(uuid),
            other => LifecycleError::Storage(other.to_string()),
        }
    }
}
