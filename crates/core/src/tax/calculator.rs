//! Tax computation shared by every document type.
//!
//! A single calculator serves all types; what differs per type lives in
//! [`DocumentProfile`](super::profile::DocumentProfile): which tax scheme
//! applies and which default rates are offered.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::catalog::{RateKind, TaxRate, TaxRateCatalog};
use super::profile::{profile_for, TaxScheme};
use crate::error::{Discrepancy, TaxError};
use crate::models::{
    Calculation, DeclaredTax, DeclaredTotals, DocumentDetail, DocumentLineItem, DocumentPayload,
    DocumentTotals, DocumentType, LineTaxes, ProductType, SchemaVersion, TaxLine, TaxTotal,
    TaxType, WithholdingLine,
};
use crate::money::{checked_percentage_of, percentage_of, round_money, round_to, within_tolerance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalculationContext {
    pub document_type: DocumentType,
    pub version: SchemaVersion,
    /// Date used to pick vigent rates, normally the emission date.
    pub as_of: NaiveDate,
    pub apply_default_taxes: bool,
}

impl CalculationContext {
    /// `None` when the payload declares an unknown schema version.
    pub fn for_payload(payload: &DocumentPayload, apply_default_taxes: bool) -> Option<Self> {
        Some(Self {
            document_type: payload.document_type(),
            version: payload.schema_version()?,
            as_of: payload.emission_date,
            apply_default_taxes,
        })
    }
}

#[derive(Clone)]
pub struct TaxCalculator {
    catalog: Arc<dyn TaxRateCatalog>,
}

impl TaxCalculator {
    pub fn new(catalog: Arc<dyn TaxRateCatalog>) -> Self {
        Self { catalog }
    }

    fn lookup(
        &self,
        tax_type: TaxType,
        rate_code: &str,
        product_type: ProductType,
        ctx: &CalculationContext,
    ) -> Result<TaxRate, TaxError> {
        let invalid = |reason: String| TaxError::InvalidTax {
            tax_type,
            rate_code: rate_code.to_string(),
            reason,
        };
        let rate = self
            .catalog
            .find_vigent_rate(tax_type, rate_code, ctx.as_of)
            .map_err(|e| TaxError::CatalogUnavailable(e.to_string()))?
            .ok_or_else(|| invalid(format!("no active rate vigent on {}", ctx.as_of)))?;
        rate.check_conditions(product_type, ctx.document_type)
            .map_err(invalid)?;
        Ok(rate)
    }

    /// IVA default for the product type, used only when `apply_default_taxes`
    /// is set and the line declares nothing.
    pub fn default_tax_lines(
        &self,
        product_type: ProductType,
        ctx: &CalculationContext,
    ) -> Vec<DeclaredTax> {
        profile_for(ctx.document_type)
            .default_rate(product_type)
            .map(|(tax_type, code)| DeclaredTax {
                tax_type,
                rate_code: code.to_string(),
                rate: None,
                taxable_base: None,
                value: None,
            })
            .into_iter()
            .collect()
    }

    pub fn calculate_line_taxes(
        &self,
        line: &DocumentLineItem,
        ctx: &CalculationContext,
    ) -> Result<LineTaxes, TaxError> {
        // Precision is applied to the inputs, before the base is computed.
        let precision = ctx.version.precision();
        let quantity = round_to(line.quantity, precision);
        let unit_price = round_to(line.unit_price, precision);
        let discount = round_money(line.discount);
        let out_of_range = || TaxError::AmountOutOfRange(format!("line {}", line.product_code));
        let gross = round_money(quantity.checked_mul(unit_price).ok_or_else(out_of_range)?);
        let taxable_base = gross - discount;

        let declared: Cow<'_, [DeclaredTax]> = if line.taxes.is_empty() && ctx.apply_default_taxes {
            Cow::Owned(self.default_tax_lines(line.product_type, ctx))
        } else {
            Cow::Borrowed(line.taxes.as_slice())
        };

        if let Some(tax) = declared.iter().find(|t| t.tax_type.is_withholding()) {
            return Err(TaxError::InvalidTax {
                tax_type: tax.tax_type,
                rate_code: tax.rate_code.clone(),
                reason: "withholding tax declared on a sales line".into(),
            });
        }

        // IVA is levied on the base plus any ICE of the same line, so ICE and
        // IRBPNR are resolved first.
        let mut computed: Vec<Option<TaxLine>> = vec![None; declared.len()];
        let mut ice_value = Decimal::ZERO;
        for iva_pass in [false, true] {
            for (i, tax) in declared.iter().enumerate() {
                if (tax.tax_type == TaxType::Iva) != iva_pass {
                    continue;
                }
                let rate = self.lookup(tax.tax_type, &tax.rate_code, line.product_type, ctx)?;
                let base = if tax.tax_type == TaxType::Iva {
                    taxable_base.checked_add(ice_value).ok_or_else(out_of_range)?
                } else {
                    taxable_base
                };
                let value = match rate.kind {
                    RateKind::Percentage { rate } => {
                        checked_percentage_of(base, rate).ok_or_else(out_of_range)?
                    }
                    RateKind::Specific { amount_per_unit } => {
                        round_money(amount_per_unit.checked_mul(quantity).ok_or_else(out_of_range)?)
                    }
                };
                if tax.tax_type == TaxType::Ice {
                    ice_value = ice_value.checked_add(value).ok_or_else(out_of_range)?;
                }
                computed[i] = Some(TaxLine {
                    tax_type: tax.tax_type,
                    rate_code: tax.rate_code.clone(),
                    rate: rate.percentage(),
                    taxable_base: base,
                    value,
                });
            }
        }

        let tax_lines: Vec<TaxLine> = computed.into_iter().flatten().collect();
        let line_total_tax = tax_lines
            .iter()
            .try_fold(Decimal::ZERO, |acc, t| acc.checked_add(t.value))
            .ok_or_else(out_of_range)?;
        Ok(LineTaxes {
            product_code: line.product_code.clone(),
            quantity,
            unit_price,
            gross,
            discount,
            taxable_base,
            tax_lines,
            line_total_tax,
        })
    }

    pub fn calculate_document_totals(&self, lines: &[LineTaxes]) -> DocumentTotals {
        let subtotal: Decimal = lines.iter().map(|l| l.gross).sum();
        let total_discount: Decimal = lines.iter().map(|l| l.discount).sum();
        let tax_totals = group_tax_lines(lines.iter().flat_map(|l| l.tax_lines.iter()));
        let total_tax: Decimal = tax_totals.iter().map(|t| t.value).sum();
        DocumentTotals {
            subtotal,
            total_discount,
            total_tax,
            grand_total: subtotal - total_discount + total_tax,
            tax_totals,
        }
    }

    pub fn calculate_withholdings(
        &self,
        withholdings: &[WithholdingLine],
        ctx: &CalculationContext,
    ) -> Result<Vec<TaxLine>, TaxError> {
        withholdings
            .iter()
            .map(|w| {
                if !w.tax_type.is_withholding() {
                    return Err(TaxError::InvalidTax {
                        tax_type: w.tax_type,
                        rate_code: w.retention_code.clone(),
                        reason: "sales tax declared on a withholding line".into(),
                    });
                }
                let rate = self.lookup(w.tax_type, &w.retention_code, ProductType::Normal, ctx)?;
                let base = round_money(w.taxable_base);
                Ok(TaxLine {
                    tax_type: w.tax_type,
                    rate_code: w.retention_code.clone(),
                    rate: rate.percentage(),
                    taxable_base: base,
                    value: percentage_of(base, rate.percentage()),
                })
            })
            .collect()
    }

    /// Withheld amounts are reported as the document's tax and grand total.
    pub fn withholding_totals(&self, withholdings: &[TaxLine]) -> DocumentTotals {
        let tax_totals = group_tax_lines(withholdings.iter());
        let total_tax: Decimal = tax_totals.iter().map(|t| t.value).sum();
        DocumentTotals {
            subtotal: Decimal::ZERO,
            total_discount: Decimal::ZERO,
            total_tax,
            grand_total: total_tax,
            tax_totals,
        }
    }

    pub fn calculate(
        &self,
        payload: &DocumentPayload,
        ctx: &CalculationContext,
    ) -> Result<Calculation, TaxError> {
        match profile_for(ctx.document_type).scheme {
            TaxScheme::Sales => {
                let lines = payload
                    .lines
                    .iter()
                    .map(|line| self.calculate_line_taxes(line, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                // Every grouped total is bounded by this sum.
                let overall = lines
                    .iter()
                    .try_fold(Decimal::ZERO, |acc, l| acc.checked_add(l.gross)?.checked_add(l.line_total_tax));
                if overall.is_none() {
                    return Err(TaxError::AmountOutOfRange("document totals".into()));
                }
                let totals = self.calculate_document_totals(&lines);
                Ok(Calculation {
                    lines,
                    withholdings: Vec::new(),
                    totals,
                })
            }
            TaxScheme::Withholding => {
                let declared: &[WithholdingLine] = match &payload.detail {
                    DocumentDetail::Retention { withholdings, .. } => withholdings.as_slice(),
                    _ => &[],
                };
                let withholdings = self.calculate_withholdings(declared, ctx)?;
                let totals = self.withholding_totals(&withholdings);
                Ok(Calculation {
                    lines: Vec::new(),
                    withholdings,
                    totals,
                })
            }
            TaxScheme::None => Ok(Calculation::default()),
        }
    }

    /// Compares every declared amount of the payload (line taxes, withholdings
    /// and document totals) with the computed ones.
    pub fn validate_declared(
        &self,
        payload: &DocumentPayload,
        calculation: &Calculation,
    ) -> Result<(), TaxError> {
        let mut discrepancies = Vec::new();

        for (i, (line, computed)) in payload.lines.iter().zip(&calculation.lines).enumerate() {
            for tax in &line.taxes {
                let field = format!("lines[{i}].{}:{}", tax.tax_type, tax.rate_code);
                let Some(found) = computed
                    .tax_lines
                    .iter()
                    .find(|t| t.tax_type == tax.tax_type && t.rate_code == tax.rate_code)
                else {
                    discrepancies.push(Discrepancy {
                        field,
                        declared: tax.value.unwrap_or(Decimal::ZERO),
                        computed: None,
                    });
                    continue;
                };
                compare(&mut discrepancies, format!("{field}.rate"), tax.rate, found.rate);
                compare(
                    &mut discrepancies,
                    format!("{field}.taxable_base"),
                    tax.taxable_base,
                    found.taxable_base,
                );
                compare(&mut discrepancies, format!("{field}.value"), tax.value, found.value);
            }
        }

        if let DocumentDetail::Retention { withholdings, .. } = &payload.detail {
            for (i, (declared, computed)) in withholdings.iter().zip(&calculation.withholdings).enumerate() {
                let field = format!("withholdings[{i}]");
                compare(&mut discrepancies, format!("{field}.percentage"), declared.percentage, computed.rate);
                compare(&mut discrepancies, format!("{field}.value"), declared.value, computed.value);
            }
        }

        if let Some(declared) = &payload.declared {
            discrepancies.extend(totals_discrepancies(declared, &calculation.totals));
        }

        if discrepancies.is_empty() {
            Ok(())
        } else {
            Err(TaxError::TaxMismatch(discrepancies))
        }
    }
}

fn compare(out: &mut Vec<Discrepancy>, field: String, declared: Option<Decimal>, computed: Decimal) {
    if let Some(declared) = declared {
        if !within_tolerance(declared, computed) {
            out.push(Discrepancy {
                field,
                declared,
                computed: Some(computed),
            });
        }
    }
}

fn group_tax_lines<'a>(lines: impl Iterator<Item = &'a TaxLine>) -> Vec<TaxTotal> {
    let mut grouped: BTreeMap<(TaxType, String), TaxTotal> = BTreeMap::new();
    for line in lines {
        let entry = grouped
            .entry((line.tax_type, line.rate_code.clone()))
            .or_insert_with(|| TaxTotal {
                tax_type: line.tax_type,
                rate_code: line.rate_code.clone(),
                rate: line.rate,
                taxable_base: Decimal::ZERO,
                value: Decimal::ZERO,
            });
        entry.taxable_base += line.taxable_base;
        entry.value += line.value;
    }
    grouped.into_values().collect()
}

fn totals_discrepancies(declared: &DeclaredTotals, computed: &DocumentTotals) -> Vec<Discrepancy> {
    let mut out = Vec::new();
    compare(&mut out, "totals.subtotal".into(), declared.subtotal, computed.subtotal);
    compare(
        &mut out,
        "totals.total_discount".into(),
        declared.total_discount,
        computed.total_discount,
    );
    compare(&mut out, "totals.total_tax".into(), declared.total_tax, computed.total_tax);
    compare(&mut out, "totals.grand_total".into(), declared.grand_total, computed.grand_total);

    for tax in &declared.taxes {
        let field = format!("totals.{}:{}", tax.tax_type, tax.rate_code);
        match computed
            .tax_totals
            .iter()
            .find(|t| t.tax_type == tax.tax_type && t.rate_code == tax.rate_code)
        {
            Some(found) => {
                compare(&mut out, format!("{field}.taxable_base"), Some(tax.taxable_base), found.taxable_base);
                compare(&mut out, format!("{field}.value"), Some(tax.value), found.value);
            }
            None => out.push(Discrepancy {
                field,
                declared: tax.value,
                computed: None,
            }),
        }
    }
    out
}

/// Fails with `TaxMismatch` when a declared total differs from the computed
/// one by more than a cent, or names a tax that was never computed.
pub fn validate_declared_against_computed(
    declared: &DeclaredTotals,
    computed: &DocumentTotals,
) -> Result<(), TaxError> {
    let discrepancies = totals_discrepancies(declared, computed);
    if discrepancies.is_empty() {
        Ok(())
    } else {
        Err(TaxError::TaxMismatch(discrepancies))
    }
}
