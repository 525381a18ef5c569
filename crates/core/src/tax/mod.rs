pub mod calculator;
pub mod catalog;
pub mod profile;

pub use calculator::{validate_declared_against_computed, CalculationContext, TaxCalculator};
pub use catalog::{
    CachedCatalog, CatalogError, InMemoryCatalog, RateCondition, RateKind, TaxRate, TaxRateCatalog,
};
pub use profile::{profile_for, DocumentProfile, TaxScheme};
