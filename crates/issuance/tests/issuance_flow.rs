use gateway::{GatewayClient, MockBehavior, MockGateway};
use issuance::{AuditEvent, IssuanceOptions};
use rust_decimal::Decimal;
use sri_einv_core::models::DocumentType;
use sri_einv_core::parsing::parse_payload;
use sri_einv_core::state::{ActorContext, DocumentState};
use std::sync::Arc;

const INVOICE: &str = r#"{
    "issuer": {
        "ruc": "0992877878001",
        "business_name": "Distribuidora del Pacifico",
        "establishment": "001",
        "emission_point": "002"
    },
    "environment": 1,
    "emission_date": "2024-05-02",
    "version": "1.1.0",
    "lines": [{
        "product_code": "P-1",
        "description": "Widget",
        "quantity": "2",
        "unit_price": "50",
        "taxes": [{"tax_type": "iva", "rate_code": "4"}]
    }],
    "payments": [{"code": "01", "amount": "115"}],
    "detail": {
        "type": "invoice",
        "buyer": {"id_type": "04", "identification": "1790011674001", "name": "Comercial Andina S.A."}
    }
}"#;

const RETENTION: &str = r#"{
    "issuer": {
        "ruc": "0992877878001",
        "business_name": "Distribuidora del Pacifico",
        "establishment": "001",
        "emission_point": "002"
    },
    "environment": 1,
    "emission_date": "2024-05-02",
    "version": "1.0.0",
    "detail": {
        "type": "retention",
        "subject": {"id_type": "04", "identification": "1790011674001", "name": "Comercial Andina S.A."},
        "fiscal_period": "05/2024",
        "withholdings": [{
            "tax_type": "renta",
            "retention_code": "303",
            "taxable_base": "100",
            "support": {"document_type": "01", "number": "001-001-000000123", "emission_date": "2024-05-01"}
        }]
    }
}"#;

fn options(dir: &tempfile::TempDir) -> IssuanceOptions {
    let mut options = IssuanceOptions::new(dir.path().join("store"));
    options.audit_path = Some(dir.path().join("audit.jsonl"));
    options
}

#[tokio::test]
async fn issues_documents_through_the_on_disk_stack() {
    let dir = tempfile::tempdir().unwrap();
    let gw = MockGateway::authorizing();
    let client: Arc<dyn GatewayClient> = gw.clone();
    let manager = issuance::open(&options(&dir), client).unwrap();
    let actor = ActorContext::new("cajero-01", None);

    let invoice = manager
        .create(&actor, DocumentType::Invoice, parse_payload(INVOICE).unwrap())
        .await
        .unwrap()
        .document;
    assert_eq!(invoice.state, DocumentState::Authorized);
    assert_eq!(invoice.number(), "001-002-000000001");

    let retention = manager
        .create(&actor, DocumentType::Retention, parse_payload(RETENTION).unwrap())
        .await
        .unwrap()
        .document;
    // Counters are kept per document type.
    assert_eq!(retention.sequence, "000000001");
    assert_eq!(retention.calculation.withholdings[0].value, Decimal::from(10));
    assert_eq!(
        retention.totals().grand_total,
        retention.calculation.withholdings[0].value
    );
    assert_eq!(&retention.access_key.as_str()[8..10], "07");

    let submitted: Vec<_> = gw.submissions().iter().map(|s| s.document_type).collect();
    assert_eq!(submitted, vec![DocumentType::Invoice, DocumentType::Retention]);

    let audit = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
    let events: Vec<AuditEvent> = audit
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let created = events
        .iter()
        .filter(|e| e.event_type == "document_created")
        .count();
    assert_eq!(created, 2);
    assert!(events.iter().all(|e| e.actor.as_deref() == Some("cajero-01")));
    assert!(events
        .iter()
        .filter(|e| e.event_type == "document_created")
        .all(|e| e.payload_hash.as_ref().map(String::len) == Some(64)));
}

#[tokio::test]
async fn pending_documents_are_listed_and_resubmitted() {
    let dir = tempfile::tempdir().unwrap();
    let gw = MockGateway::new(MockBehavior::Unavailable);
    let client: Arc<dyn GatewayClient> = gw.clone();
    let manager = issuance::open(&options(&dir), client).unwrap();
    let actor = ActorContext::system();

    let out = manager
        .create(&actor, DocumentType::Invoice, parse_payload(INVOICE).unwrap())
        .await
        .unwrap();
    assert_eq!(out.document.state, DocumentState::PendingGateway);
    assert!(out.warning.is_some());

    let pending = manager.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].document_type, DocumentType::Invoice);

    gw.set_fallback(MockBehavior::Receive);
    let retried = manager.reprocess(&actor, out.document.uuid).await.unwrap();
    assert!(retried.resubmitted);
    assert_eq!(retried.document.state, DocumentState::Sent);
    assert!(manager.list_pending().await.unwrap().is_empty());

    gw.push_status(MockBehavior::Authorize);
    let refreshed = manager
        .refresh_status(&actor, out.document.uuid)
        .await
        .unwrap();
    assert_eq!(refreshed.document.state, DocumentState::Authorized);
    assert!(refreshed
        .document
        .gateway
        .and_then(|g| g.authorization_number)
        .is_some());
}
