use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::models::{ProductType, TaxType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessKeyError {
    #[error("invalid access key input `{field}`: {reason}")]
    InvalidInput { field: &'static str, reason: String },
    #[error("invalid access key: {0}")]
    InvalidAccessKey(String),
}

/// One discrepancy between a declared amount and its computed counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub field: String,
    pub declared: Decimal,
    #[serde(default)]
    pub computed: Option<Decimal>,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.computed {
            Some(computed) => write!(
                f,
                "{}: declared {} computed {}",
                self.field, self.declared, computed
            ),
            None => write!(f, "{}: declared {} has no computed counterpart", self.field, self.declared),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaxError {
    #[error("invalid tax {tax_type} rate code {rate_code}: {reason}")]
    InvalidTax {
        tax_type: TaxType,
        rate_code: String,
        reason: String,
    },
    #[error("declared taxes do not match computed values: {}", join(.0))]
    TaxMismatch(Vec<Discrepancy>),
    #[error("tax combination not allowed for {product_type:?}: missing [{}], prohibited [{}]", join_names(.missing), join_names(.prohibited))]
    TaxCoherence {
        product_type: ProductType,
        missing: Vec<String>,
        prohibited: Vec<String>,
    },
    #[error("tax-rate catalog unavailable: {0}")]
    CatalogUnavailable(String),
    #[error("amount out of range in {0}")]
    AmountOutOfRange(String),
}

fn join_names(items: &[String]) -> String {
    items.join(", ")
}

fn join(items: &[Discrepancy]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCategory {
    Ambient,
    Dates,
    Counterparty,
    Lines,
    Totals,
}

/// Every validation failure of a payload, grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: BTreeMap<ValidationCategory, Vec<String>>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, category: ValidationCategory, message: impl Into<String>) {
        self.errors.entry(category).or_default().push(message.into());
    }

    pub fn merge(&mut self, other: ValidationReport) {
        for (category, messages) in other.errors {
            self.errors.entry(category).or_default().extend(messages);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.errors.values().map(Vec::len).sum()
    }

    pub fn messages(&self, category: ValidationCategory) -> &[String] {
        self.errors.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has(&self, category: ValidationCategory) -> bool {
        !self.messages(category).is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationReport> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.len())?;
        for (category, messages) in &self.errors {
            if !messages.is_empty() {
                write!(f, "; {:?}: {}", category, messages.join(", "))?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CreditNoteError {
    #[error("source invoice already has a TOTAL credit note")]
    TotalAlreadyApplied,
    #[error("TOTAL credit note not allowed: {0} partial note(s) already applied")]
    PartialNotesExist(usize),
    #[error("no line with product code {0} on the source invoice")]
    UnknownSourceLine(String),
    #[error("credit quantity {requested} for {product_code} exceeds available {available}")]
    QuantityExceeded {
        product_code: String,
        requested: Decimal,
        available: Decimal,
    },
}
