//! Credit applied against a source invoice.
//!
//! A ledger is opened from the invoice lines and tracks, per product code,
//! the quantity that partial credit notes may still return. Annulling a note
//! gives its quantities back.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::CreditNoteError;
use crate::models::{CreditApplication, DocumentLineItem};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedCreditNote {
    pub note_uuid: Uuid,
    pub application: CreditApplication,
    pub quantities: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub annulled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditLedger {
    pub source_uuid: Uuid,
    pub notes: Vec<AppliedCreditNote>,
    pub available: BTreeMap<String, Decimal>,
}

fn quantities_by_code(lines: &[DocumentLineItem]) -> BTreeMap<String, Decimal> {
    let mut out: BTreeMap<String, Decimal> = BTreeMap::new();
    for line in lines {
        *out.entry(line.product_code.clone()).or_default() += line.quantity;
    }
    out
}

impl CreditLedger {
    pub fn open(source_uuid: Uuid, source_lines: &[DocumentLineItem]) -> Self {
        Self {
            source_uuid,
            notes: Vec::new(),
            available: quantities_by_code(source_lines),
        }
    }

    fn live(&self) -> impl Iterator<Item = &AppliedCreditNote> {
        self.notes.iter().filter(|n| !n.annulled)
    }

    pub fn available_quantity(&self, product_code: &str) -> Decimal {
        self.available.get(product_code).copied().unwrap_or_default()
    }

    /// Quantities the note would consume, or the rule it breaks.
    pub fn check(
        &self,
        application: CreditApplication,
        lines: &[DocumentLineItem],
    ) -> Result<BTreeMap<String, Decimal>, CreditNoteError> {
        if self
            .live()
            .any(|n| n.application == CreditApplication::Total)
        {
            return Err(CreditNoteError::TotalAlreadyApplied);
        }

        match application {
            CreditApplication::Total => {
                let partials = self.live().count();
                if partials > 0 {
                    return Err(CreditNoteError::PartialNotesExist(partials));
                }
                Ok(self.available.clone())
            }
            CreditApplication::Partial => {
                let requested = quantities_by_code(lines);
                for (code, qty) in &requested {
                    let Some(available) = self.available.get(code) else {
                        return Err(CreditNoteError::UnknownSourceLine(code.clone()));
                    };
                    if qty > available {
                        return Err(CreditNoteError::QuantityExceeded {
                            product_code: code.clone(),
                            requested: *qty,
                            available: *available,
                        });
                    }
                }
                Ok(requested)
            }
        }
    }

    pub fn apply(
        &mut self,
        note_uuid: Uuid,
        application: CreditApplication,
        lines: &[DocumentLineItem],
    ) -> Result<(), CreditNoteError> {
        let quantities = self.check(application, lines)?;
        for (code, qty) in &quantities {
            if let Some(available) = self.available.get_mut(code) {
                *available -= *qty;
            }
        }
        self.notes.push(AppliedCreditNote {
            note_uuid,
            application,
            quantities,
            annulled: false,
        });
        Ok(())
    }

    /// Marks the note annulled and restores its quantities. False when the
    /// note is unknown or already annulled.
    pub fn release(&mut self, note_uuid: Uuid) -> bool {
        let Some(note) = self
            .notes
            .iter_mut()
            .find(|n| n.note_uuid == note_uuid && !n.annulled)
        else {
            return false;
        };
        note.annulled = true;
        for (code, qty) in &note.quantities {
            *self.available.entry(code.clone()).or_default() += *qty;
        }
        true
    }
}
