use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::access_key::AccessKey;
use crate::state::{DocumentState, StateChange};

/// SRI document kinds, each carrying its two-digit code in the access key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    PurchaseLiquidation,
    CreditNote,
    DebitNote,
    Waybill,
    Retention,
}

impl DocumentType {
    pub const ALL: [DocumentType; 6] = [
        DocumentType::Invoice,
        DocumentType::PurchaseLiquidation,
        DocumentType::CreditNote,
        DocumentType::DebitNote,
        DocumentType::Waybill,
        DocumentType::Retention,
    ];

    pub fn code(self) -> &'static str {
        match self {
            DocumentType::Invoice => "01",
            DocumentType::PurchaseLiquidation => "03",
            DocumentType::CreditNote => "04",
            DocumentType::DebitNote => "05",
            DocumentType::Waybill => "06",
            DocumentType::Retention => "07",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Key under which the gateway expects the document object.
    pub fn kind_key(self) -> &'static str {
        match self {
            DocumentType::Invoice => "factura",
            DocumentType::PurchaseLiquidation => "liquidacionCompra",
            DocumentType::CreditNote => "notaCredito",
            DocumentType::DebitNote => "notaDebito",
            DocumentType::Waybill => "guiaRemision",
            DocumentType::Retention => "comprobanteRetencion",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::Invoice => "invoice",
            DocumentType::PurchaseLiquidation => "purchase_liquidation",
            DocumentType::CreditNote => "credit_note",
            DocumentType::DebitNote => "debit_note",
            DocumentType::Waybill => "waybill",
            DocumentType::Retention => "retention",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.code() == s)
            .ok_or_else(|| format!("unknown document type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Test,
    Production,
}

impl Environment {
    pub fn code(self) -> u8 {
        match self {
            Environment::Test => 1,
            Environment::Production => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Environment::Test),
            2 => Some(Environment::Production),
            _ => None,
        }
    }
}

/// XML schema version declared by the payload. Drives quantity and unit
/// price precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "1.0.0")]
    V1_0_0,
    #[serde(rename = "1.1.0")]
    V1_1_0,
}

impl SchemaVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "1.0.0" => Some(SchemaVersion::V1_0_0),
            "1.1.0" => Some(SchemaVersion::V1_1_0),
            _ => None,
        }
    }

    /// Decimal places allowed for quantity and unit price.
    pub fn precision(self) -> u32 {
        match self {
            SchemaVersion::V1_0_0 => 2,
            SchemaVersion::V1_1_0 => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SchemaVersion::V1_0_0 => "1.0.0",
            SchemaVersion::V1_1_0 => "1.1.0",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    #[default]
    Normal,
    Medicine,
    Export,
    Construction,
    IceGoods,
    PlasticBottle,
    Exempt,
    NotSubject,
}

/// Sales taxes (IVA, ICE, IRBPNR) and the withholding taxes used by
/// retention receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaxType {
    #[serde(rename = "iva")]
    Iva,
    #[serde(rename = "ice")]
    Ice,
    #[serde(rename = "irbpnr")]
    Irbpnr,
    #[serde(rename = "renta")]
    WithholdingRenta,
    #[serde(rename = "iva_retention")]
    WithholdingIva,
    #[serde(rename = "isd")]
    WithholdingIsd,
}

impl TaxType {
    pub fn sri_code(self) -> &'static str {
        match self {
            TaxType::Iva => "2",
            TaxType::Ice => "3",
            TaxType::Irbpnr => "5",
            TaxType::WithholdingRenta => "1",
            TaxType::WithholdingIva => "2",
            TaxType::WithholdingIsd => "6",
        }
    }

    pub fn is_withholding(self) -> bool {
        matches!(
            self,
            TaxType::WithholdingRenta | TaxType::WithholdingIva | TaxType::WithholdingIsd
        )
    }
}

impl fmt::Display for TaxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaxType::Iva => "IVA",
            TaxType::Ice => "ICE",
            TaxType::Irbpnr => "IRBPNR",
            TaxType::WithholdingRenta => "RENTA",
            TaxType::WithholdingIva => "IVA-RET",
            TaxType::WithholdingIsd => "ISD",
        };
        f.write_str(name)
    }
}

/// A tax entry as declared by the caller on a line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredTax {
    pub tax_type: TaxType,
    pub rate_code: String,
    #[serde(default)]
    pub rate: Option<Decimal>,
    #[serde(default)]
    pub taxable_base: Option<Decimal>,
    #[serde(default)]
    pub value: Option<Decimal>,
}

/// A computed tax entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLine {
    pub tax_type: TaxType,
    pub rate_code: String,
    pub rate: Decimal,
    pub taxable_base: Decimal,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentLineItem {
    pub product_code: String,
    #[serde(default)]
    pub auxiliary_code: Option<String>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub product_type: ProductType,
    #[serde(default)]
    pub taxes: Vec<DeclaredTax>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuerInfo {
    pub ruc: String,
    pub business_name: String,
    #[serde(default)]
    pub trade_name: Option<String>,
    pub establishment: String,
    pub emission_point: String,
    #[serde(default)]
    pub address: Option<String>,
}

/// Buyer, supplier or withholding subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counterparty {
    pub id_type: String,
    pub identification: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Counterparty {
    pub fn is_final_consumer(&self) -> bool {
        self.id_type == FINAL_CONSUMER_ID_TYPE
    }
}

pub const FINAL_CONSUMER_ID_TYPE: &str = "07";
pub const FINAL_CONSUMER_IDENTIFICATION: &str = "9999999999999";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredTaxTotal {
    pub tax_type: TaxType,
    pub rate_code: String,
    pub taxable_base: Decimal,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeclaredTotals {
    #[serde(default)]
    pub subtotal: Option<Decimal>,
    #[serde(default)]
    pub total_discount: Option<Decimal>,
    #[serde(default)]
    pub total_tax: Option<Decimal>,
    #[serde(default)]
    pub grand_total: Option<Decimal>,
    #[serde(default)]
    pub taxes: Vec<DeclaredTaxTotal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub code: String,
    pub amount: Decimal,
    #[serde(default)]
    pub term: Option<u32>,
    #[serde(default)]
    pub time_unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalField {
    pub name: String,
    pub value: String,
}

/// Reference to the document a credit or debit note modifies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedDocument {
    pub document_type: DocumentType,
    pub number: String,
    #[serde(default)]
    pub access_key: Option<String>,
    pub emission_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditApplication {
    Total,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportDocument {
    pub document_type: String,
    pub number: String,
    pub emission_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithholdingLine {
    pub tax_type: TaxType,
    pub retention_code: String,
    pub taxable_base: Decimal,
    #[serde(default)]
    pub percentage: Option<Decimal>,
    #[serde(default)]
    pub value: Option<Decimal>,
    pub support: SupportDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transporter {
    pub id_type: String,
    pub identification: String,
    pub name: String,
    pub plate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaybillItem {
    pub product_code: String,
    pub description: String,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consignee {
    pub identification: String,
    pub name: String,
    pub destination_address: String,
    pub reason: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub items: Vec<WaybillItem>,
}

/// Per-type part of a payload. Required nested objects are optional here so
/// that their absence surfaces as a validation error, not a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentDetail {
    Invoice {
        buyer: Option<Counterparty>,
    },
    PurchaseLiquidation {
        supplier: Option<Counterparty>,
    },
    CreditNote {
        buyer: Option<Counterparty>,
        modified: Option<ModifiedDocument>,
        application: CreditApplication,
        #[serde(default)]
        reason: String,
    },
    DebitNote {
        buyer: Option<Counterparty>,
        modified: Option<ModifiedDocument>,
    },
    Waybill {
        transporter: Option<Transporter>,
        #[serde(default)]
        departure_address: String,
        transport_start: NaiveDate,
        transport_end: NaiveDate,
        #[serde(default)]
        consignees: Vec<Consignee>,
    },
    Retention {
        subject: Option<Counterparty>,
        #[serde(default)]
        fiscal_period: String,
        #[serde(default)]
        withholdings: Vec<WithholdingLine>,
    },
}

impl DocumentDetail {
    pub fn document_type(&self) -> DocumentType {
        match self {
            DocumentDetail::Invoice { .. } => DocumentType::Invoice,
            DocumentDetail::PurchaseLiquidation { .. } => DocumentType::PurchaseLiquidation,
            DocumentDetail::CreditNote { .. } => DocumentType::CreditNote,
            DocumentDetail::DebitNote { .. } => DocumentType::DebitNote,
            DocumentDetail::Waybill { .. } => DocumentType::Waybill,
            DocumentDetail::Retention { .. } => DocumentType::Retention,
        }
    }

    /// Buyer, supplier or subject, whichever the document type carries.
    pub fn counterparty(&self) -> Option<&Counterparty> {
        match self {
            DocumentDetail::Invoice { buyer }
            | DocumentDetail::CreditNote { buyer, .. }
            | DocumentDetail::DebitNote { buyer, .. } => buyer.as_ref(),
            DocumentDetail::PurchaseLiquidation { supplier } => supplier.as_ref(),
            DocumentDetail::Retention { subject, .. } => subject.as_ref(),
            DocumentDetail::Waybill { .. } => None,
        }
    }
}

fn default_emission_type() -> u8 {
    1
}

fn default_version() -> String {
    SchemaVersion::V1_1_0.as_str().to_string()
}

/// Inbound document as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub issuer: IssuerInfo,
    pub environment: u8,
    #[serde(default = "default_emission_type")]
    pub emission_type: u8,
    pub emission_date: NaiveDate,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub lines: Vec<DocumentLineItem>,
    #[serde(default)]
    pub declared: Option<DeclaredTotals>,
    #[serde(default)]
    pub payments: Vec<PaymentMethod>,
    #[serde(default)]
    pub additional_info: Vec<AdditionalField>,
    pub detail: DocumentDetail,
}

impl DocumentPayload {
    pub fn document_type(&self) -> DocumentType {
        self.detail.document_type()
    }

    pub fn schema_version(&self) -> Option<SchemaVersion> {
        SchemaVersion::parse(&self.version)
    }
}

/// Computed taxes of one line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineTaxes {
    pub product_code: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub gross: Decimal,
    pub discount: Decimal,
    pub taxable_base: Decimal,
    pub tax_lines: Vec<TaxLine>,
    pub line_total_tax: Decimal,
}

impl LineTaxes {
    pub fn line_total(&self) -> Decimal {
        self.taxable_base + self.line_total_tax
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxTotal {
    pub tax_type: TaxType,
    pub rate_code: String,
    pub rate: Decimal,
    pub taxable_base: Decimal,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DocumentTotals {
    pub subtotal: Decimal,
    pub total_discount: Decimal,
    pub total_tax: Decimal,
    pub grand_total: Decimal,
    pub tax_totals: Vec<TaxTotal>,
}

/// Result of running the tax calculator over a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Calculation {
    pub lines: Vec<LineTaxes>,
    pub withholdings: Vec<TaxLine>,
    pub totals: DocumentTotals,
}

/// Last verdict received from the SRI gateway for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayVerdict {
    pub status: String,
    #[serde(default)]
    pub authorization_number: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// A persisted electronic document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectronicDocument {
    pub uuid: Uuid,
    pub document_type: DocumentType,
    pub issuer_ruc: String,
    pub establishment: String,
    pub emission_point: String,
    pub sequence: String,
    pub access_key: AccessKey,
    pub state: DocumentState,
    pub environment: Environment,
    pub emission_date: NaiveDate,
    pub payload: DocumentPayload,
    pub calculation: Calculation,
    #[serde(default)]
    pub gateway: Option<GatewayVerdict>,
    #[serde(default)]
    pub annulment_reason: Option<String>,
    pub history: Vec<StateChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ElectronicDocument {
    /// Printed document number, e.g. `001-002-000000123`.
    pub fn number(&self) -> String {
        format!(
            "{}-{}-{}",
            self.establishment, self.emission_point, self.sequence
        )
    }

    pub fn totals(&self) -> &DocumentTotals {
        &self.calculation.totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_codes_round_trip() {
        for t in DocumentType::ALL {
            assert_eq!(DocumentType::from_code(t.code()), Some(t));
            assert_eq!(t.as_str().parse::<DocumentType>(), Ok(t));
        }
        assert_eq!(DocumentType::from_code("02"), None);
    }

    #[test]
    fn schema_precision_depends_on_version() {
        assert_eq!(SchemaVersion::V1_0_0.precision(), 2);
        assert_eq!(SchemaVersion::V1_1_0.precision(), 6);
        assert_eq!(SchemaVersion::parse("2.0.0"), None);
    }

    #[test]
    fn payload_parses_with_defaults() {
        let json = r#"{
            "issuer": {"ruc": "0992877878001", "business_name": "ACME", "establishment": "001", "emission_point": "001"},
            "environment": 1,
            "emission_date": "2024-05-02",
            "lines": [{"product_code": "P1", "description": "Item", "quantity": "2", "unit_price": "100"}],
            "detail": {"type": "invoice", "buyer": null}
        }"#;
        let payload: DocumentPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.emission_type, 1);
        assert_eq!(payload.version, "1.1.0");
        assert_eq!(payload.document_type(), DocumentType::Invoice);
        assert_eq!(payload.lines[0].product_type, ProductType::Normal);
        assert!(payload.detail.counterparty().is_none());
    }
}
