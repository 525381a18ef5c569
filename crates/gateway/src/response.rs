use serde::Deserialize;

use crate::{GatewayError, GatewayStatus, SubmissionReceipt};

/// JSON carried in the result element of a gateway answer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub status: String,
    #[serde(default)]
    pub access_key_confirmed: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub authorization_number: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl GatewayResponse {
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(raw)
            .map_err(|e| GatewayError::Protocol(format!("unreadable gateway answer: {e}")))
    }

    pub fn into_receipt(self) -> Result<SubmissionReceipt, GatewayError> {
        let normalized = self.status.trim().to_uppercase();
        let status = match normalized.as_str() {
            "RECIBIDA" | "RECEIVED" | "EN PROCESO" | "PROCESSING" | "SENT" => GatewayStatus::Received,
            "AUTORIZADO" | "AUTHORIZED" => GatewayStatus::Authorized,
            "DEVUELTA" | "RECHAZADO" | "RECHAZADA" | "NO AUTORIZADO" | "REJECTED" => {
                return Err(GatewayError::Rejected {
                    status: normalized,
                    reason: self
                        .rejection_reason
                        .or(self.message)
                        .unwrap_or_else(|| "no reason given".to_string()),
                })
            }
            _ => {
                return Err(GatewayError::Protocol(format!(
                    "unknown gateway status '{}'",
                    self.status
                )))
            }
        };
        Ok(SubmissionReceipt {
            status,
            access_key_confirmed: self.access_key_confirmed,
            authorization_number: self.authorization_number,
            message: self.message,
        })
    }
}

pub fn interpret(raw: &str) -> Result<SubmissionReceipt, GatewayError> {
    GatewayResponse::parse(raw)?.into_receipt()
}
