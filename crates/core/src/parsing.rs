use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{DocumentPayload, DocumentType};

pub fn compute_sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let bytes = hasher.finalize();
    hex::encode(bytes)
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload is a {found} but {expected} was requested")]
    TypeMismatch {
        expected: DocumentType,
        found: DocumentType,
    },
}

pub fn parse_payload(json: &str) -> Result<DocumentPayload, PayloadError> {
    Ok(serde_json::from_str(json)?)
}

/// Parses a payload and checks its `detail.type` against the requested type.
pub fn parse_payload_as(expected: DocumentType, json: &str) -> Result<DocumentPayload, PayloadError> {
    let payload = parse_payload(json)?;
    let found = payload.document_type();
    if found != expected {
        return Err(PayloadError::TypeMismatch { expected, found });
    }
    Ok(payload)
}

/// SHA-256 of the canonical JSON form, recorded in the audit trail.
pub fn payload_digest(payload: &DocumentPayload) -> Result<String, PayloadError> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(compute_sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVOICE: &str = r#"{
        "issuer": {
            "ruc": "0992877878001",
            "business_name": "Distribuidora del Pacifico",
            "establishment": "001",
            "emission_point": "001"
        },
        "environment": 1,
        "emission_date": "2024-05-02",
        "lines": [{
            "product_code": "P-1",
            "description": "Widget",
            "quantity": "2",
            "unit_price": "50.00",
            "taxes": [{"tax_type": "iva", "rate_code": "4"}]
        }],
        "payments": [{"code": "01", "amount": "115.00"}],
        "detail": {
            "type": "invoice",
            "buyer": {"id_type": "04", "identification": "1790011674001", "name": "Comercial Andina"}
        }
    }"#;

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            compute_sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn parses_invoice_with_defaults() {
        let p = parse_payload(INVOICE).unwrap();
        assert_eq!(p.document_type(), DocumentType::Invoice);
        assert_eq!(p.emission_type, 1);
        assert_eq!(p.version, "1.1.0");
        assert_eq!(p.lines[0].discount, rust_decimal::Decimal::ZERO);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let err = parse_payload_as(DocumentType::CreditNote, INVOICE).unwrap_err();
        assert!(matches!(err, PayloadError::TypeMismatch { .. }));
    }

    #[test]
    fn digest_ignores_whitespace_of_the_source() {
        let a = parse_payload(INVOICE).unwrap();
        let compact: serde_json::Value = serde_json::from_str(INVOICE).unwrap();
        let b = parse_payload(&compact.to_string()).unwrap();
        assert_eq!(payload_digest(&a).unwrap(), payload_digest(&b).unwrap());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(parse_payload("{"), Err(PayloadError::Malformed(_))));
    }
}
