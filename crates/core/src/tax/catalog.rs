//! Tax-rate catalog: tax type / rate code records with vigency windows.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::models::{DocumentType, ProductType, TaxType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateKind {
    Percentage { rate: Decimal },
    Specific { amount_per_unit: Decimal },
}

/// Eligibility conditions attached to a rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum RateCondition {
    ProductTypes { allowed: Vec<ProductType> },
    DocumentTypes { allowed: Vec<DocumentType> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRate {
    pub tax_type: TaxType,
    pub rate_code: String,
    pub description: String,
    pub kind: RateKind,
    pub valid_from: NaiveDate,
    #[serde(default)]
    pub valid_to: Option<NaiveDate>,
    pub active: bool,
    #[serde(default)]
    pub conditions: Vec<RateCondition>,
}

impl TaxRate {
    pub fn is_vigent(&self, as_of: NaiveDate) -> bool {
        self.active
            && self.valid_from <= as_of
            && self.valid_to.map_or(true, |end| as_of <= end)
    }

    /// Percentage rate, zero for specific rates.
    pub fn percentage(&self) -> Decimal {
        match self.kind {
            RateKind::Percentage { rate } => rate,
            RateKind::Specific { .. } => Decimal::ZERO,
        }
    }

    pub fn check_conditions(
        &self,
        product_type: ProductType,
        document_type: DocumentType,
    ) -> Result<(), String> {
        for condition in &self.conditions {
            match condition {
                RateCondition::ProductTypes { allowed } if !allowed.contains(&product_type) => {
                    return Err(format!("rate not applicable to product type {product_type:?}"));
                }
                RateCondition::DocumentTypes { allowed } if !allowed.contains(&document_type) => {
                    return Err(format!("rate not applicable to {document_type}"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("catalog storage error: {0}")]
    Storage(String),
}

pub trait TaxRateCatalog: Send + Sync {
    fn find_vigent_rate(
        &self,
        tax_type: TaxType,
        rate_code: &str,
        as_of: NaiveDate,
    ) -> Result<Option<TaxRate>, CatalogError>;
}

impl<T: TaxRateCatalog + ?Sized> TaxRateCatalog for Arc<T> {
    fn find_vigent_rate(
        &self,
        tax_type: TaxType,
        rate_code: &str,
        as_of: NaiveDate,
    ) -> Result<Option<TaxRate>, CatalogError> {
        (**self).find_vigent_rate(tax_type, rate_code, as_of)
    }
}

/// Picks the most recent vigent record among `candidates`.
pub fn select_vigent<'a>(
    candidates: impl IntoIterator<Item = &'a TaxRate>,
    as_of: NaiveDate,
) -> Option<TaxRate> {
    candidates
        .into_iter()
        .filter(|r| r.is_vigent(as_of))
        .max_by_key(|r| r.valid_from)
        .cloned()
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    rates: Vec<TaxRate>,
}

impl InMemoryCatalog {
    pub fn new(rates: Vec<TaxRate>) -> Self {
        Self { rates }
    }

    /// The SRI tables in force for the supported document types.
    pub fn sri_defaults() -> Self {
        Self::new(sri_default_rates())
    }

    pub fn insert(&mut self, rate: TaxRate) {
        self.rates.push(rate);
    }

    pub fn rates(&self) -> &[TaxRate] {
        &self.rates
    }
}

impl TaxRateCatalog for InMemoryCatalog {
    fn find_vigent_rate(
        &self,
        tax_type: TaxType,
        rate_code: &str,
        as_of: NaiveDate,
    ) -> Result<Option<TaxRate>, CatalogError> {
        Ok(select_vigent(
            self.rates
                .iter()
                .filter(|r| r.tax_type == tax_type && r.rate_code == rate_code),
            as_of,
        ))
    }
}

type CacheKey = (TaxType, String, NaiveDate);

/// Read-through cache with an explicit time to live.
pub struct CachedCatalog<C> {
    inner: C,
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, (Instant, Option<TaxRate>)>>,
}

impl<C: TaxRateCatalog> CachedCatalog<C> {
    pub fn new(inner: C, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, (Instant, Option<TaxRate>)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn invalidate(&self) {
        self.entries().clear();
    }

    /// Entries held, expired ones included until the next miss.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: TaxRateCatalog> TaxRateCatalog for CachedCatalog<C> {
    fn find_vigent_rate(
        &self,
        tax_type: TaxType,
        rate_code: &str,
        as_of: NaiveDate,
    ) -> Result<Option<TaxRate>, CatalogError> {
        let key = (tax_type, rate_code.to_string(), as_of);
        if let Some((stored_at, rate)) = self.entries().get(&key) {
            if stored_at.elapsed() < self.ttl {
                return Ok(rate.clone());
            }
        }

        let rate = self.inner.find_vigent_rate(tax_type, rate_code, as_of)?;
        let mut entries = self.entries();
        // Misses sweep whatever has expired, so dated keys do not pile up.
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < self.ttl);
        entries.insert(key, (Instant::now(), rate.clone()));
        Ok(rate)
    }
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}

fn pct(
    tax_type: TaxType,
    code: &str,
    description: &str,
    rate: Decimal,
    valid_from: NaiveDate,
    valid_to: Option<NaiveDate>,
) -> TaxRate {
    TaxRate {
        tax_type,
        rate_code: code.to_string(),
        description: description.to_string(),
        kind: RateKind::Percentage { rate },
        valid_from,
        valid_to,
        active: true,
        conditions: Vec::new(),
    }
}

fn with_products(mut rate: TaxRate, allowed: &[ProductType]) -> TaxRate {
    rate.conditions.push(RateCondition::ProductTypes {
        allowed: allowed.to_vec(),
    });
    rate
}

fn for_retentions(mut rate: TaxRate) -> TaxRate {
    rate.conditions.push(RateCondition::DocumentTypes {
        allowed: vec![DocumentType::Retention],
    });
    rate
}

pub fn sri_default_rates() -> Vec<TaxRate> {
    let epoch = day(2000, 1, 1);
    let iva15 = day(2024, 4, 1);
    let d = |units: i64, scale: u32| Decimal::new(units, scale);

    let mut rates = vec![
        pct(TaxType::Iva, "0", "IVA 0%", Decimal::ZERO, epoch, None),
        pct(TaxType::Iva, "2", "IVA 12%", d(12, 0), epoch, Some(day(2024, 3, 31))),
        pct(
            TaxType::Iva,
            "3",
            "IVA 14%",
            d(14, 0),
            day(2016, 6, 1),
            Some(day(2017, 5, 31)),
        ),
        pct(TaxType::Iva, "4", "IVA 15%", d(15, 0), iva15, None),
        with_products(
            pct(TaxType::Iva, "5", "IVA 5%", d(5, 0), iva15, None),
            &[ProductType::Construction],
        ),
        pct(TaxType::Iva, "6", "No objeto de impuesto", Decimal::ZERO, epoch, None),
        pct(TaxType::Iva, "7", "Exento de IVA", Decimal::ZERO, epoch, None),
        with_products(
            pct(TaxType::Ice, "3031", "ICE bebidas alcoholicas", d(75, 0), epoch, None),
            &[ProductType::IceGoods],
        ),
        with_products(
            pct(TaxType::Ice, "3610", "ICE perfumes y aguas de tocador", d(20, 0), epoch, None),
            &[ProductType::IceGoods],
        ),
        with_products(
            TaxRate {
                tax_type: TaxType::Ice,
                rate_code: "3011".into(),
                description: "ICE cigarrillos rubios".into(),
                kind: RateKind::Specific {
                    amount_per_unit: d(16, 2),
                },
                valid_from: epoch,
                valid_to: None,
                active: true,
                conditions: Vec::new(),
            },
            &[ProductType::IceGoods],
        ),
        with_products(
            TaxRate {
                tax_type: TaxType::Irbpnr,
                rate_code: "5001".into(),
                description: "Botellas plasticas no retornables".into(),
                kind: RateKind::Specific {
                    amount_per_unit: d(2, 2),
                },
                valid_from: epoch,
                valid_to: None,
                active: true,
                conditions: Vec::new(),
            },
            &[ProductType::PlasticBottle],
        ),
    ];

    let withholdings = [
        (TaxType::WithholdingRenta, "303", "Honorarios profesionales", d(10, 0)),
        (TaxType::WithholdingRenta, "304", "Servicios predomina el intelecto", d(8, 0)),
        (TaxType::WithholdingRenta, "312", "Transferencia de bienes muebles", d(175, 2)),
        (TaxType::WithholdingRenta, "332", "Pagos no sujetos a retencion", Decimal::ZERO),
        (TaxType::WithholdingRenta, "343", "Otras retenciones aplicables el 1%", d(1, 0)),
        (TaxType::WithholdingIva, "9", "Retencion IVA 10%", d(10, 0)),
        (TaxType::WithholdingIva, "10", "Retencion IVA 20%", d(20, 0)),
        (TaxType::WithholdingIva, "1", "Retencion IVA 30%", d(30, 0)),
        (TaxType::WithholdingIva, "11", "Retencion IVA 50%", d(50, 0)),
        (TaxType::WithholdingIva, "2", "Retencion IVA 70%", d(70, 0)),
        (TaxType::WithholdingIva, "3", "Retencion IVA 100%", d(100, 0)),
        (TaxType::WithholdingIsd, "4580", "Impuesto a la salida de divisas", d(5, 0)),
    ];
    rates.extend(withholdings.into_iter().map(|(tax_type, code, description, rate)| {
        for_retentions(pct(tax_type, code, description, rate, epoch, None))
    }));
    rates
}
