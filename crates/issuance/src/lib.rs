pub mod audit;
pub mod catalog;
pub mod error;
pub mod lifecycle;
pub mod pending;
pub mod response;
pub mod sequence;
pub mod store;

use anyhow::{Context, Result};
use gateway::GatewayClient;
use sri_einv_core::tax::CachedCatalog;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use audit::{AuditEvent, AuditLog};
pub use catalog::SledTaxRateCatalog;
pub use error::{LifecycleError, StoreError};
pub use lifecycle::{DocumentLifecycleManager, IssueOutcome, LifecycleSettings, ReprocessOutcome};
pub use pending::{PendingDocumentRecord, PendingDocumentStore};
pub use response::{ApiResponse, ErrorBody};
pub use sequence::{KeyedLockGuard, KeyedLocks, SequenceAllocator, SequenceKey};
pub use store::{CreditClaim, DocumentStore};

/// Everything needed to open the issuance pipeline on disk.
#[derive(Debug, Clone)]
pub struct IssuanceOptions {
    pub db_path: PathBuf,
    pub audit_path: Option<PathBuf>,
    pub catalog_ttl: Duration,
    pub settings: LifecycleSettings,
}

impl IssuanceOptions {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            audit_path: None,
            catalog_ttl: Duration::from_secs(3600),
            settings: LifecycleSettings::default(),
        }
    }
}

/// Opens the sled database, seeds the tax-rate catalog on first use and wires
/// the manager to `gateway`.
pub fn open(options: &IssuanceOptions, gateway: Arc<dyn GatewayClient>) -> Result<DocumentLifecycleManager> {
    let db = open_db(&options.db_path)?;
    let store = DocumentStore::from_db(db.clone())?;
    let pending = PendingDocumentStore::new(db.clone());

    let rates = SledTaxRateCatalog::open(&db)?;
    rates.seed_defaults()?;
    let catalog = Arc::new(CachedCatalog::new(rates, options.catalog_ttl));

    let audit = match &options.audit_path {
        Some(path) => AuditLog::new(path.clone()),
        None => AuditLog::disabled(),
    };

    let manager = DocumentLifecycleManager::new(store, pending, gateway, catalog, options.settings.clone())?
        .with_audit(audit);
    tracing::info!(path = %options.db_path.display(), "Issuance store opened");
    Ok(manager)
}

fn open_db(path: &Path) -> Result<sled::Db> {
    sled::open(path).with_context(|| format!("cannot open document store at {}", path.display()))
}
