use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use crate::access_key;
use crate::models::{
    Counterparty, DocumentDetail, DocumentPayload, DocumentType, Environment, ModifiedDocument,
    SchemaVersion, FINAL_CONSUMER_IDENTIFICATION,
};
use crate::tax::{profile_for, TaxScheme};

use super::coherence::check_tax_coherence;

/// Highest scale accepted for quantities and unit prices in any schema version.
pub const MAX_INPUT_SCALE: u32 = 6;
const MAX_ADDITIONAL_FIELDS: usize = 15;
const MAX_FIELD_LEN: usize = 300;
const ID_TYPES: [&str; 5] = ["04", "05", "06", "07", "08"];

fn finish(errs: Vec<String>) -> Result<(), Vec<String>> {
    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

fn is_digits(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_digit())
}

/// `001-001-000000001`
pub fn is_document_number(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    matches!(parts.as_slice(), [e, p, s] if is_digits(e, 3) && is_digits(p, 3) && is_digits(s, 9))
}

pub fn ambient_checks(payload: &DocumentPayload) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    let doc_type = payload.document_type();

    if Environment::from_code(payload.environment).is_none() {
        errs.push(format!(
            "environment must be 1 (test) or 2 (production), got {}",
            payload.environment
        ));
    }
    if payload.emission_type != 1 {
        errs.push(format!(
            "emission type must be 1 (normal); contingency emission is not supported, got {}",
            payload.emission_type
        ));
    }

    let issuer = &payload.issuer;
    if !is_digits(&issuer.ruc, 13) {
        errs.push("issuer RUC must be 13 digits".to_string());
    }
    if issuer.business_name.trim().is_empty() {
        errs.push("issuer business name is mandatory".to_string());
    }
    if !is_digits(&issuer.establishment, 3) || issuer.establishment == "000" {
        errs.push("establishment must be 3 digits between 001 and 999".to_string());
    }
    if !is_digits(&issuer.emission_point, 3) || issuer.emission_point == "000" {
        errs.push("emission point must be 3 digits between 001 and 999".to_string());
    }

    match SchemaVersion::parse(&payload.version) {
        None => errs.push(format!("unknown schema version {}", payload.version)),
        Some(v) if !profile_for(doc_type).allows_version(v) => errs.push(format!(
            "schema version {} is not accepted for {}",
            v.as_str(),
            doc_type
        )),
        Some(_) => {}
    }

    if payload.additional_info.len() > MAX_ADDITIONAL_FIELDS {
        errs.push(format!(
            "at most {MAX_ADDITIONAL_FIELDS} additional fields are allowed"
        ));
    }
    for field in &payload.additional_info {
        if field.name.trim().is_empty() {
            errs.push("additional field name is mandatory".to_string());
        }
        if field.value.chars().count() > MAX_FIELD_LEN {
            errs.push(format!("additional field {} exceeds {MAX_FIELD_LEN} characters", field.name));
        }
    }

    finish(errs)
}

fn parse_fiscal_period(raw: &str) -> Option<(i32, u32)> {
    let (month, year) = raw.split_once('/')?;
    if !is_digits(month, 2) || !is_digits(year, 4) {
        return None;
    }
    let month: u32 = month.parse().ok()?;
    let year: i32 = year.parse().ok()?;
    (1..=12).contains(&month).then_some((year, month))
}

pub fn date_checks(payload: &DocumentPayload, today: NaiveDate) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    let emitted = payload.emission_date;

    if emitted > today {
        errs.push(format!("emission date {emitted} is in the future"));
    }

    match &payload.detail {
        DocumentDetail::CreditNote {
            modified: Some(modified),
            ..
        }
        | DocumentDetail::DebitNote {
            modified: Some(modified),
            ..
        } => {
            if modified.emission_date > emitted {
                errs.push(format!(
                    "modified document date {} is after the emission date {emitted}",
                    modified.emission_date
                ));
            }
        }
        DocumentDetail::Waybill {
            transport_start,
            transport_end,
            ..
        } => {
            if transport_start > transport_end {
                errs.push(format!(
                    "transport start {transport_start} is after transport end {transport_end}"
                ));
            }
        }
        DocumentDetail::Retention {
            fiscal_period,
            withholdings,
            ..
        } => {
            match parse_fiscal_period(fiscal_period) {
                None => errs.push(format!("fiscal period '{fiscal_period}' must be MM/YYYY")),
                Some(period) if period > (emitted.year(), emitted.month()) => {
                    errs.push(format!("fiscal period {fiscal_period} is after the emission month"))
                }
                Some(_) => {}
            }
            for (i, w) in withholdings.iter().enumerate() {
                if w.support.emission_date > emitted {
                    errs.push(format!(
                        "withholding {}: support document date {} is after the emission date",
                        i + 1,
                        w.support.emission_date
                    ));
                }
            }
        }
        _ => {}
    }

    finish(errs)
}

fn check_counterparty(role: &str, party: &Counterparty, errs: &mut Vec<String>) {
    if !ID_TYPES.contains(&party.id_type.as_str()) {
        errs.push(format!("{role} identification type {} is unknown", party.id_type));
        return;
    }
    match party.id_type.as_str() {
        "04" if !is_digits(&party.identification, 13) => {
            errs.push(format!("{role} RUC must be 13 digits"))
        }
        "05" if !is_digits(&party.identification, 10) => {
            errs.push(format!("{role} cedula must be 10 digits"))
        }
        "07" if party.identification != FINAL_CONSUMER_IDENTIFICATION => errs.push(format!(
            "{role} final consumer identification must be {FINAL_CONSUMER_IDENTIFICATION}"
        )),
        _ if party.identification.trim().is_empty() => {
            errs.push(format!("{role} identification is mandatory"))
        }
        _ => {}
    }
    if party.name.trim().is_empty() {
        errs.push(format!("{role} name is mandatory"));
    }
}

fn check_modified(modified: &ModifiedDocument, needs_key: bool, errs: &mut Vec<String>) {
    if modified.document_type != DocumentType::Invoice {
        errs.push(format!(
            "modified document must be an invoice, got {}",
            modified.document_type
        ));
    }
    if !is_document_number(&modified.number) {
        errs.push(format!(
            "modified document number '{}' must be NNN-NNN-NNNNNNNNN",
            modified.number
        ));
    }
    match modified.access_key.as_deref() {
        Some(key) if !access_key::validate(key) => {
            errs.push("modified document access key is invalid".to_string())
        }
        None if needs_key => errs.push("modified document access key is mandatory".to_string()),
        _ => {}
    }
}

/// Type-specific nested objects.
pub fn counterparty_checks(payload: &DocumentPayload) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();

    match &payload.detail {
        DocumentDetail::Invoice { buyer } => match buyer {
            Some(b) => check_counterparty("buyer", b, &mut errs),
            None => errs.push("buyer is mandatory".to_string()),
        },
        DocumentDetail::PurchaseLiquidation { supplier } => match supplier {
            Some(s) if s.is_final_consumer() => {
                errs.push("supplier cannot be a final consumer".to_string())
            }
            Some(s) => check_counterparty("supplier", s, &mut errs),
            None => errs.push("supplier is mandatory".to_string()),
        },
        DocumentDetail::CreditNote {
            buyer,
            modified,
            reason,
            ..
        } => {
            match buyer {
                Some(b) => check_counterparty("buyer", b, &mut errs),
                None => errs.push("buyer is mandatory".to_string()),
            }
            match modified {
                Some(m) => check_modified(m, true, &mut errs),
                None => errs.push("modified document reference is mandatory".to_string()),
            }
            if reason.trim().is_empty() {
                errs.push("credit note reason is mandatory".to_string());
            } else if reason.chars().count() > MAX_FIELD_LEN {
                errs.push(format!("credit note reason exceeds {MAX_FIELD_LEN} characters"));
            }
        }
        DocumentDetail::DebitNote { buyer, modified } => {
            match buyer {
                Some(b) => check_counterparty("buyer", b, &mut errs),
                None => errs.push("buyer is mandatory".to_string()),
            }
            match modified {
                Some(m) => check_modified(m, false, &mut errs),
                None => errs.push("modified document reference is mandatory".to_string()),
            }
        }
        DocumentDetail::Waybill {
            transporter,
            departure_address,
            consignees,
            ..
        } => {
            match transporter {
                Some(t) => {
                    if t.identification.trim().is_empty() || t.name.trim().is_empty() {
                        errs.push("transporter identification and name are mandatory".to_string());
                    }
                    if t.plate.trim().is_empty() {
                        errs.push("transporter plate is mandatory".to_string());
                    }
                }
                None => errs.push("transporter is mandatory".to_string()),
            }
            if departure_address.trim().is_empty() {
                errs.push("departure address is mandatory".to_string());
            }
            if consignees.is_empty() {
                errs.push("at least one consignee is mandatory".to_string());
            }
            for (i, c) in consignees.iter().enumerate() {
                if c.identification.trim().is_empty() || c.name.trim().is_empty() {
                    errs.push(format!("consignee {}: identification and name are mandatory", i + 1));
                }
                if c.destination_address.trim().is_empty() {
                    errs.push(format!("consignee {}: destination address is mandatory", i + 1));
                }
            }
        }
        DocumentDetail::Retention { subject, .. } => match subject {
            Some(s) if s.is_final_consumer() => {
                errs.push("withholding subject cannot be a final consumer".to_string())
            }
            Some(s) => check_counterparty("subject", s, &mut errs),
            None => errs.push("withholding subject is mandatory".to_string()),
        },
    }

    finish(errs)
}

fn check_scale(label: &str, name: &str, value: Decimal, errs: &mut Vec<String>) {
    if value.normalize().scale() > MAX_INPUT_SCALE {
        errs.push(format!("{label}: {name} has more than {MAX_INPUT_SCALE} decimals"));
    }
}

/// Line items, withholdings or waybill items depending on the document scheme.
pub fn line_checks(payload: &DocumentPayload, apply_default_taxes: bool) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    let profile = profile_for(payload.document_type());

    match profile.scheme {
        TaxScheme::Sales => {
            if payload.lines.is_empty() {
                errs.push("at least one line item is mandatory".to_string());
            }
            for (i, line) in payload.lines.iter().enumerate() {
                let label = format!("line {}", i + 1);
                if line.product_code.trim().is_empty() {
                    errs.push(format!("{label}: product code is mandatory"));
                }
                if line.description.trim().is_empty() {
                    errs.push(format!("{label}: description is mandatory"));
                }
                if line.quantity <= Decimal::ZERO {
                    errs.push(format!("{label}: quantity must be positive"));
                }
                if line.unit_price < Decimal::ZERO {
                    errs.push(format!("{label}: unit price cannot be negative"));
                }
                let gross = line.quantity.checked_mul(line.unit_price);
                if gross.is_none() {
                    errs.push(format!("{label}: amount out of range"));
                }
                if line.discount < Decimal::ZERO {
                    errs.push(format!("{label}: discount cannot be negative"));
                } else if matches!(gross, Some(g) if line.discount > g) {
                    errs.push(format!("{label}: discount exceeds the gross amount"));
                }
                check_scale(&label, "quantity", line.quantity, &mut errs);
                check_scale(&label, "unit price", line.unit_price, &mut errs);

                let mut seen = Vec::new();
                for tax in &line.taxes {
                    if tax.tax_type.is_withholding() {
                        errs.push(format!("{label}: {} is not a sales tax", tax.tax_type));
                    }
                    if seen.contains(&tax.tax_type) {
                        errs.push(format!("{label}: {} declared more than once", tax.tax_type));
                    }
                    seen.push(tax.tax_type);
                }

                let skip_coherence = apply_default_taxes && line.taxes.is_empty();
                if profile.enforce_coherence && !skip_coherence {
                    if let Err(e) = check_tax_coherence(line.product_type, &line.taxes) {
                        errs.push(format!("{label}: {e}"));
                    }
                }
            }
        }
        TaxScheme::Withholding => {
            if let DocumentDetail::Retention { withholdings, .. } = &payload.detail {
                if withholdings.is_empty() {
                    errs.push("at least one withholding is mandatory".to_string());
                }
                for (i, w) in withholdings.iter().enumerate() {
                    let label = format!("withholding {}", i + 1);
                    if !w.tax_type.is_withholding() {
                        errs.push(format!("{label}: {} is not a withholding tax", w.tax_type));
                    }
                    if w.taxable_base < Decimal::ZERO {
                        errs.push(format!("{label}: taxable base cannot be negative"));
                    }
                    if matches!(w.percentage, Some(p) if p < Decimal::ZERO) {
                        errs.push(format!("{label}: percentage cannot be negative"));
                    }
                    if !is_document_number(&w.support.number) {
                        errs.push(format!("{label}: support document number must be NNN-NNN-NNNNNNNNN"));
                    }
                }
            }
            if !payload.lines.is_empty() {
                errs.push("retentions carry withholdings, not line items".to_string());
            }
        }
        TaxScheme::None => {
            if let DocumentDetail::Waybill { consignees, .. } = &payload.detail {
                for (i, c) in consignees.iter().enumerate() {
                    if c.items.is_empty() {
                        errs.push(format!("consignee {}: at least one item is mandatory", i + 1));
                    }
                    for (j, item) in c.items.iter().enumerate() {
                        if item.quantity <= Decimal::ZERO {
                            errs.push(format!(
                                "consignee {} item {}: quantity must be positive",
                                i + 1,
                                j + 1
                            ));
                        }
                        check_scale(
                            &format!("consignee {} item {}", i + 1, j + 1),
                            "quantity",
                            item.quantity,
                            &mut errs,
                        );
                    }
                }
            }
        }
    }

    finish(errs)
}
