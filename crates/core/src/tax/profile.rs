//! Per document type configuration shared by the calculator and validator.

use crate::models::{DocumentType, ProductType, SchemaVersion, TaxType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaxScheme {
    /// Line items carrying sales taxes.
    Sales,
    /// Withholding lines on a retention receipt.
    Withholding,
    /// No monetary content (waybills).
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentProfile {
    pub document_type: DocumentType,
    pub allowed_versions: &'static [SchemaVersion],
    pub scheme: TaxScheme,
    /// Whether the product-type required/prohibited tax tables apply.
    pub enforce_coherence: bool,
    pub requires_payments: bool,
    pub requires_modified_document: bool,
}

const BOTH_VERSIONS: &[SchemaVersion] = &[SchemaVersion::V1_0_0, SchemaVersion::V1_1_0];
const LEGACY_ONLY: &[SchemaVersion] = &[SchemaVersion::V1_0_0];

static PROFILES: [DocumentProfile; 6] = [
    DocumentProfile {
        document_type: DocumentType::Invoice,
        allowed_versions: BOTH_VERSIONS,
        scheme: TaxScheme::Sales,
        enforce_coherence: true,
        requires_payments: true,
        requires_modified_document: false,
    },
    DocumentProfile {
        document_type: DocumentType::PurchaseLiquidation,
        allowed_versions: BOTH_VERSIONS,
        scheme: TaxScheme::Sales,
        enforce_coherence: true,
        requires_payments: true,
        requires_modified_document: false,
    },
    DocumentProfile {
        document_type: DocumentType::CreditNote,
        allowed_versions: BOTH_VERSIONS,
        scheme: TaxScheme::Sales,
        enforce_coherence: true,
        requires_payments: false,
        requires_modified_document: true,
    },
    DocumentProfile {
        document_type: DocumentType::DebitNote,
        allowed_versions: LEGACY_ONLY,
        scheme: TaxScheme::Sales,
        enforce_coherence: false,
        requires_payments: false,
        requires_modified_document: true,
    },
    DocumentProfile {
        document_type: DocumentType::Waybill,
        allowed_versions: BOTH_VERSIONS,
        scheme: TaxScheme::None,
        enforce_coherence: false,
        requires_payments: false,
        requires_modified_document: false,
    },
    DocumentProfile {
        document_type: DocumentType::Retention,
        allowed_versions: LEGACY_ONLY,
        scheme: TaxScheme::Withholding,
        enforce_coherence: false,
        requires_payments: false,
        requires_modified_document: false,
    },
];

pub fn profile_for(document_type: DocumentType) -> &'static DocumentProfile {
    PROFILES
        .iter()
        .find(|p| p.document_type == document_type)
        .unwrap_or(&PROFILES[0])
}

impl DocumentProfile {
    pub fn allows_version(&self, version: SchemaVersion) -> bool {
        self.allowed_versions.contains(&version)
    }

    /// IVA rate code applied when the caller asks for computed defaults.
    pub fn default_rate(&self, product_type: ProductType) -> Option<(TaxType, &'static str)> {
        if self.scheme != TaxScheme::Sales {
            return None;
        }
        let code = match product_type {
            ProductType::Normal | ProductType::IceGoods | ProductType::PlasticBottle => "4",
            ProductType::Medicine | ProductType::Export => "0",
            ProductType::Construction => "5",
            ProductType::Exempt => "7",
            ProductType::NotSubject => "6",
        };
        Some((TaxType::Iva, code))
    }
}
