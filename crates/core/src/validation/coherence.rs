//! Required and prohibited taxes per product type.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::error::TaxError;
use crate::models::{DeclaredTax, ProductType, TaxType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxRequirement {
    pub tax_type: TaxType,
    /// Accepted rate codes; empty accepts any.
    pub rate_codes: &'static [&'static str],
}

impl TaxRequirement {
    fn satisfied_by(&self, tax: &DeclaredTax) -> bool {
        tax.tax_type == self.tax_type
            && (self.rate_codes.is_empty() || self.rate_codes.contains(&tax.rate_code.as_str()))
    }

    fn describe(&self) -> String {
        if self.rate_codes.is_empty() {
            self.tax_type.to_string()
        } else {
            format!("{} ({})", self.tax_type, self.rate_codes.join("|"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoherenceRule {
    pub required: Vec<TaxRequirement>,
    pub prohibited: Vec<TaxType>,
}

const STANDARD_IVA: &[&str] = &["2", "3", "4"];

fn iva(codes: &'static [&'static str]) -> TaxRequirement {
    TaxRequirement {
        tax_type: TaxType::Iva,
        rate_codes: codes,
    }
}

fn any(tax_type: TaxType) -> TaxRequirement {
    TaxRequirement {
        tax_type,
        rate_codes: &[],
    }
}

static RULES: Lazy<HashMap<ProductType, CoherenceRule>> = Lazy::new(|| {
    let plain = |required: TaxRequirement| CoherenceRule {
        required: vec![required],
        prohibited: vec![TaxType::Ice, TaxType::Irbpnr],
    };
    HashMap::from([
        (ProductType::Normal, plain(iva(STANDARD_IVA))),
        (ProductType::Medicine, plain(iva(&["0"]))),
        (ProductType::Export, plain(iva(&["0"]))),
        (ProductType::Construction, plain(iva(&["5"]))),
        (ProductType::Exempt, plain(iva(&["7"]))),
        (ProductType::NotSubject, plain(iva(&["6"]))),
        (
            ProductType::IceGoods,
            CoherenceRule {
                required: vec![iva(STANDARD_IVA), any(TaxType::Ice)],
                prohibited: vec![TaxType::Irbpnr],
            },
        ),
        (
            ProductType::PlasticBottle,
            CoherenceRule {
                required: vec![iva(STANDARD_IVA), any(TaxType::Irbpnr)],
                prohibited: vec![TaxType::Ice],
            },
        ),
    ])
});

pub fn coherence_rule(product_type: ProductType) -> Option<&'static CoherenceRule> {
    RULES.get(&product_type)
}

/// Fails when a required tax is missing or a prohibited one is present.
pub fn check_tax_coherence(product_type: ProductType, taxes: &[DeclaredTax]) -> Result<(), TaxError> {
    let Some(rule) = coherence_rule(product_type) else {
        return Ok(());
    };

    let missing: Vec<String> = rule
        .required
        .iter()
        .filter(|req| !taxes.iter().any(|t| req.satisfied_by(t)))
        .map(TaxRequirement::describe)
        .collect();

    let mut prohibited: Vec<String> = taxes
        .iter()
        .filter(|t| rule.prohibited.contains(&t.tax_type))
        .map(|t| t.tax_type.to_string())
        .collect();
    prohibited.dedup();

    if missing.is_empty() && prohibited.is_empty() {
        Ok(())
    } else {
        Err(TaxError::TaxCoherence {
            product_type,
            missing,
            prohibited,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tax(tax_type: TaxType, code: &str) -> DeclaredTax {
        DeclaredTax {
            tax_type,
            rate_code: code.into(),
            rate: None,
            taxable_base: None,
            value: None,
        }
    }

    #[test]
    fn normal_products_need_standard_iva() {
        assert!(check_tax_coherence(ProductType::Normal, &[tax(TaxType::Iva, "4")]).is_ok());
        let err = check_tax_coherence(ProductType::Normal, &[tax(TaxType::Iva, "0")]).unwrap_err();
        let TaxError::TaxCoherence { missing, prohibited, .. } = err else {
            panic!("unexpected error");
        };
        assert_eq!(missing.len(), 1);
        assert!(prohibited.is_empty());
    }

    #[test]
    fn normal_products_forbid_ice_and_irbpnr() {
        let err = check_tax_coherence(
            ProductType::Normal,
            &[tax(TaxType::Iva, "4"), tax(TaxType::Ice, "3610"), tax(TaxType::Irbpnr, "5001")],
        )
        .unwrap_err();
        let TaxError::TaxCoherence { missing, prohibited, .. } = err else {
            panic!("unexpected error");
        };
        assert!(missing.is_empty());
        assert_eq!(prohibited, vec!["ICE".to_string(), "IRBPNR".to_string()]);
    }

    #[test]
    fn exports_require_zero_rate() {
        assert!(check_tax_coherence(ProductType::Export, &[tax(TaxType::Iva, "0")]).is_ok());
        assert!(check_tax_coherence(ProductType::Export, &[tax(TaxType::Iva, "4")]).is_err());
    }

    #[test]
    fn ice_goods_require_ice() {
        assert!(check_tax_coherence(ProductType::IceGoods, &[tax(TaxType::Iva, "4")]).is_err());
        assert!(check_tax_coherence(
            ProductType::IceGoods,
            &[tax(TaxType::Iva, "4"), tax(TaxType::Ice, "3031")]
        )
        .is_ok());
    }
}
