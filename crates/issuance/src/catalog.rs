use chrono::NaiveDate;
use sri_einv_core::models::TaxType;
use sri_einv_core::tax::catalog::{select_vigent, sri_default_rates};
use sri_einv_core::tax::{CatalogError, TaxRate, TaxRateCatalog};

use crate::error::StoreError;

pub const TAX_RATES_TREE: &str = "tax_rates";

/// Tax-rate records persisted in the `tax_rates` tree, keyed
/// `TYPE/code/valid_from`.
#[derive(Clone)]
pub struct SledTaxRateCatalog {
    tree: sled::Tree,
}

fn prefix(tax_type: TaxType, rate_code: &str) -> String {
    format!("{tax_type}/{rate_code}/")
}

fn record_key(rate: &TaxRate) -> String {
    format!("{}{}", prefix(rate.tax_type, &rate.rate_code), rate.valid_from)
}

impl SledTaxRateCatalog {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree(TAX_RATES_TREE)?,
        })
    }

    pub fn upsert(&self, rate: &TaxRate) -> Result<(), StoreError> {
        self.tree
            .insert(record_key(rate).as_str(), serde_json::to_vec(rate)?)?;
        Ok(())
    }

    /// Loads the built-in SRI table when the tree is empty. Returns how many
    /// records were written.
    pub fn seed_defaults(&self) -> Result<usize, StoreError> {
        if !self.tree.is_empty() {
            return Ok(0);
        }
        let rates = sri_default_rates();
        for rate in &rates {
            self.upsert(rate)?;
        }
        tracing::info!(count = rates.len(), "Seeded tax-rate catalog");
        Ok(rates.len())
    }

    pub fn all(&self) -> Result<Vec<TaxRate>, StoreError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_k, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}

impl TaxRateCatalog for SledTaxRateCatalog {
    fn find_vigent_rate(
        &self,
        tax_type: TaxType,
        rate_code: &str,
        as_of: NaiveDate,
    ) -> Result<Option<TaxRate>, CatalogError> {
        let mut candidates = Vec::new();
        for item in self.tree.scan_prefix(prefix(tax_type, rate_code)) {
            let (_k, v) = item.map_err(|e| CatalogError::Storage(e.to_string()))?;
            let rate: TaxRate =
                serde_json::from_slice(&v).map_err(|e| CatalogError::Storage(e.to_string()))?;
            candidates.push(rate);
        }
        Ok(select_vigent(&candidates, as_of))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sri_einv_core::tax::RateKind;

    fn catalog() -> SledTaxRateCatalog {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledTaxRateCatalog::open(&db).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn seeded_rates_resolve_by_date() {
        let c = catalog();
        assert!(c.seed_defaults().unwrap() > 0);
        assert_eq!(c.seed_defaults().unwrap(), 0);

        let fifteen = c
            .find_vigent_rate(TaxType::Iva, "4", date(2024, 5, 2))
            .unwrap()
            .unwrap();
        assert_eq!(fifteen.percentage(), dec!(15));
        assert!(c
            .find_vigent_rate(TaxType::Iva, "2", date(2024, 5, 2))
            .unwrap()
            .is_none());
        assert!(c
            .find_vigent_rate(TaxType::Iva, "2", date(2023, 11, 20))
            .unwrap()
            .is_some());
    }

    #[test]
    fn prefix_does_not_leak_between_codes() {
        let c = catalog();
        c.seed_defaults().unwrap();
        // "3" must not match "3031" or "3610"
        let r = c
            .find_vigent_rate(TaxType::Ice, "3", date(2024, 5, 2))
            .unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn newer_record_wins() {
        let c = catalog();
        let mut rate = sri_default_rates()
            .into_iter()
            .find(|r| r.tax_type == TaxType::WithholdingRenta && r.rate_code == "303")
            .unwrap();
        c.upsert(&rate).unwrap();
        rate.valid_from = date(2025, 1, 1);
        rate.kind = RateKind::Percentage { rate: dec!(12) };
        c.upsert(&rate).unwrap();

        let found = c
            .find_vigent_rate(TaxType::WithholdingRenta, "303", date(2025, 2, 1))
            .unwrap()
            .unwrap();
        assert_eq!(found.percentage(), dec!(12));
        assert_eq!(c.all().unwrap().len(), 2);
    }
}
