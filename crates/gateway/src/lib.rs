use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sri_einv_core::models::DocumentType;
use thiserror::Error;

pub mod mock;
pub mod response;
pub mod retry;
pub mod soap;

pub use mock::{MockBehavior, MockGateway};
pub use response::GatewayResponse;
pub use retry::RetryPolicy;
pub use soap::{SoapConfig, SriSoapClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayStatus {
    /// Accepted for processing, authorization still to come.
    Received,
    Authorized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub status: GatewayStatus,
    pub access_key_confirmed: Option<String>,
    pub authorization_number: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Never reached the gateway, or it answered with a transient failure.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    /// Well-formed negative answer; never retried.
    #[error("gateway rejected the document ({status}): {reason}")]
    Rejected { status: String, reason: String },
    #[error("gateway protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Reachability probe. Never fails, answers false instead.
    async fn is_available(&self) -> bool;

    async fn submit(
        &self,
        document_type: DocumentType,
        document: &serde_json::Value,
    ) -> Result<SubmissionReceipt, GatewayError>;

    async fn status(&self, access_key: &str) -> Result<SubmissionReceipt, GatewayError>;
}

/// `{ "<kindKey>": <document> }`
pub fn build_envelope(document_type: DocumentType, document: &serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(document_type.kind_key().to_string(), document.clone());
    serde_json::Value::Object(map)
}
