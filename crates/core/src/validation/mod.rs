mod coherence;
pub mod credit_note;
mod rules;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::error::{TaxError, ValidationCategory, ValidationReport};
use crate::models::{DeclaredTax, DocumentDetail, DocumentPayload, DocumentTotals, ProductType};
use crate::money::within_tolerance;
use crate::tax::profile_for;

pub use coherence::{check_tax_coherence, coherence_rule, CoherenceRule, TaxRequirement};
pub use credit_note::{AppliedCreditNote, CreditLedger};
pub use rules::{is_document_number, MAX_INPUT_SCALE};

/// Highest grand total an invoice to a final consumer may carry.
pub fn final_consumer_cap() -> Decimal {
    Decimal::new(5000, 2)
}

const PAYMENT_CODES: [&str; 8] = ["01", "15", "16", "17", "18", "19", "20", "21"];

/// Structural and business checks on inbound payloads. Failures are collected
/// per category instead of stopping at the first one.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentValidator {
    /// Lines without declared taxes get product-type defaults later, so
    /// coherence is not checked on them.
    pub apply_default_taxes: bool,
}

impl DocumentValidator {
    pub fn new(apply_default_taxes: bool) -> Self {
        Self { apply_default_taxes }
    }

    pub fn validate_basics(
        &self,
        payload: &DocumentPayload,
        today: NaiveDate,
    ) -> Result<(), ValidationReport> {
        let mut report = ValidationReport::new();
        let checks = [
            (ValidationCategory::Ambient, rules::ambient_checks(payload)),
            (ValidationCategory::Dates, rules::date_checks(payload, today)),
            (ValidationCategory::Counterparty, rules::counterparty_checks(payload)),
            (
                ValidationCategory::Lines,
                rules::line_checks(payload, self.apply_default_taxes),
            ),
        ];
        for (category, result) in checks {
            if let Err(errs) = result {
                for e in errs {
                    report.push(category, e);
                }
            }
        }
        report.into_result()
    }

    pub fn validate_tax_coherence(
        &self,
        product_type: ProductType,
        taxes: &[DeclaredTax],
    ) -> Result<(), TaxError> {
        check_tax_coherence(product_type, taxes)
    }

    /// Checks that need the computed totals.
    pub fn validate_totals(
        &self,
        payload: &DocumentPayload,
        totals: &DocumentTotals,
    ) -> Result<(), ValidationReport> {
        let mut report = ValidationReport::new();
        let profile = profile_for(payload.document_type());

        if profile.requires_payments && payload.payments.is_empty() {
            report.push(ValidationCategory::Totals, "at least one payment method is mandatory");
        }
        for p in &payload.payments {
            if !PAYMENT_CODES.contains(&p.code.as_str()) {
                report.push(
                    ValidationCategory::Totals,
                    format!("payment method code {} is unknown", p.code),
                );
            }
            if p.amount < Decimal::ZERO {
                report.push(ValidationCategory::Totals, "payment amount cannot be negative");
            }
        }
        if !payload.payments.is_empty() {
            let paid = payload
                .payments
                .iter()
                .try_fold(Decimal::ZERO, |acc, p| acc.checked_add(p.amount));
            match paid {
                None => report.push(ValidationCategory::Totals, "payment amounts out of range"),
                Some(paid) if !within_tolerance(paid, totals.grand_total) => report.push(
                    ValidationCategory::Totals,
                    format!(
                        "payments add up to {paid}, grand total is {}",
                        totals.grand_total
                    ),
                ),
                Some(_) => {}
            }
        }

        if let DocumentDetail::Invoice { buyer: Some(buyer) } = &payload.detail {
            let cap = final_consumer_cap();
            if buyer.is_final_consumer() && totals.grand_total > cap {
                report.push(
                    ValidationCategory::Totals,
                    format!(
                        "invoices to a final consumer cannot exceed {cap}, got {}",
                        totals.grand_total
                    ),
                );
            }
        }

        report.into_result()
    }
}

/// Basic checks with default options.
pub fn validate(payload: &DocumentPayload, today: NaiveDate) -> Result<(), ValidationReport> {
    DocumentValidator::default().validate_basics(payload, today)
}
