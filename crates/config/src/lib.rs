use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "sri-einvoice";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub issuance: IssuanceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_kind")]
    pub kind: String, // "mock" | "soap"
    pub reception_url: String,
    pub authorization_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Upper bound for one submission, probe included.
    pub hard_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            kind: default_gateway_kind(),
            reception_url: "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline".to_string(),
            authorization_url: "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline".to_string(),
            connect_timeout_ms: 1500,
            request_timeout_ms: 5000,
            hard_timeout_ms: 6000,
            retry_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_gateway_kind() -> String {
    "mock".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    #[serde(default)]
    pub audit_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".sri_einv_store"),
            audit_path: Some(PathBuf::from("sri_einv_audit.jsonl")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub cache_ttl_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 3600 }
    }
}

impl CatalogConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuanceConfig {
    pub numeric_code: String,
    #[serde(default)]
    pub apply_default_taxes: bool,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            numeric_code: "12345678".to_string(),
            apply_default_taxes: false,
        }
    }
}

impl AppConfig {
    /// Rejects values the pipeline cannot start with.
    pub fn check(&self) -> Result<()> {
        match self.gateway.kind.as_str() {
            "mock" | "soap" => {}
            other => bail!("unknown gateway kind '{other}', expected mock or soap"),
        }
        if self.gateway.hard_timeout_ms == 0 {
            bail!("gateway.hard_timeout_ms must be positive");
        }
        let code = &self.issuance.numeric_code;
        if code.is_empty() || code.len() > 8 || !code.chars().all(|c| c.is_ascii_digit()) {
            bail!("issuance.numeric_code must be 1 to 8 digits, got '{code}'");
        }
        Ok(())
    }
}

pub fn load() -> Result<AppConfig> {
    let cfg: AppConfig = confy::load(APP_NAME, None).context("Failed to load app config")?;
    cfg.check()?;
    Ok(cfg)
}

pub fn store(cfg: &AppConfig) -> Result<()> {
    confy::store(APP_NAME, None, cfg).context("Failed to store app config")?;
    Ok(())
}

/// Loads from an explicit file, writing the defaults there if it is missing.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    let cfg: AppConfig = confy::load_path(path)
        .with_context(|| format!("Failed to load app config from {}", path.display()))?;
    cfg.check()?;
    Ok(cfg)
}

pub fn store_to(path: &Path, cfg: &AppConfig) -> Result<()> {
    confy::store_path(path, cfg)
        .with_context(|| format!("Failed to store app config to {}", path.display()))?;
    Ok(())
}
