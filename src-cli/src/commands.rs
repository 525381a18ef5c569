use anyhow::{Context, Result};
use config::AppConfig;
use issuance::{ApiResponse, DocumentLifecycleManager, ErrorBody};
use serde::Serialize;
use sri_einv_core::access_key;
use sri_einv_core::models::DocumentType;
use sri_einv_core::parsing::{parse_payload, parse_payload_as, PayloadError};
use sri_einv_core::state::ActorContext;
use sri_einv_core::validation;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

/// Rendered response envelope plus whether the command succeeded.
pub struct Output {
    pub success: bool,
    pub body: serde_json::Value,
}

fn render<T: Serialize>(resp: ApiResponse<T>) -> Result<Output> {
    Ok(Output {
        success: resp.success,
        body: serde_json::to_value(&resp)?,
    })
}

fn refused<T>(status: u16, kind: &'static str, detail: String) -> ApiResponse<T> {
    ApiResponse {
        success: false,
        status,
        data: None,
        message: None,
        error: Some(ErrorBody {
            kind,
            detail,
            errors: None,
        }),
        warning: None,
    }
}

fn payload_refused<T>(err: PayloadError) -> ApiResponse<T> {
    match err {
        PayloadError::Malformed(e) => refused(400, "malformed_payload", e.to_string()),
        e @ PayloadError::TypeMismatch { .. } => refused(422, "type_mismatch", e.to_string()),
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// `*.json` files under `dir`, in path order.
pub fn collect_payloads(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    let mut result = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() {
            let p = entry.path();
            if let Some(ext) = p.extension().and_then(|e| e.to_str()) {
                if ext.eq_ignore_ascii_case("json") {
                    result.push(p.to_path_buf());
                }
            }
        }
    }
    result.sort();
    Ok(result)
}

pub async fn create(
    manager: &DocumentLifecycleManager,
    actor: &ActorContext,
    doc_type: DocumentType,
    path: &Path,
) -> Result<Output> {
    let json = read_file(path)?;
    let payload = match parse_payload_as(doc_type, &json) {
        Ok(p) => p,
        Err(e) => return render(payload_refused::<()>(e)),
    };
    let resp = match manager.create(actor, doc_type, payload).await {
        Ok(out) => ApiResponse::created(out.document, out.warning),
        Err(e) => ApiResponse::failure(&e),
    };
    tracing::info!(path = %path.display(), success = resp.success, "Payload processed");
    render(resp)
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItem {
    fn failed(path: &Path, error: String) -> Self {
        Self {
            path: path.display().to_string(),
            success: false,
            uuid: None,
            access_key: None,
            state: None,
            warning: None,
            error: Some(error),
        }
    }
}

/// Issues each payload in turn; the document type comes from the payload.
pub async fn create_batch(
    manager: &DocumentLifecycleManager,
    actor: &ActorContext,
    dir: &Path,
) -> Result<Output> {
    let mut items = Vec::new();
    for path in collect_payloads(dir)? {
        let json = read_file(&path)?;
        let payload = match parse_payload(&json) {
            Ok(p) => p,
            Err(e) => {
                items.push(BatchItem::failed(&path, e.to_string()));
                continue;
            }
        };
        let item = match manager.create(actor, payload.document_type(), payload).await {
            Ok(out) => BatchItem {
                path: path.display().to_string(),
                success: true,
                uuid: Some(out.document.uuid),
                access_key: Some(out.document.access_key.to_string()),
                state: Some(out.document.state.to_string()),
                warning: out.warning,
                error: None,
            },
            Err(e) => BatchItem::failed(&path, e.to_string()),
        };
        tracing::info!(path = %path.display(), success = item.success, "Payload processed");
        items.push(item);
    }

    let issued = items.iter().filter(|i| i.success).count();
    let total = items.len();
    let message = format!("{issued} of {total} payload(s) issued");
    let resp = ApiResponse::ok(items).with_message(message);
    Ok(Output {
        success: issued == total,
        ..render(resp)?
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub path: String,
    pub valid: bool,
    pub errors: serde_json::Value,
}

pub fn validate_files(paths: &[PathBuf]) -> Result<Output> {
    let today = chrono::Local::now().date_naive();
    let mut out = Vec::new();
    for p in paths {
        let json = read_file(p)?;
        let errors = match parse_payload(&json) {
            Ok(payload) => match validation::validate(&payload, today) {
                Ok(()) => serde_json::Value::Null,
                Err(report) => serde_json::to_value(&report.errors)?,
            },
            Err(e) => serde_json::json!({ "payload": [e.to_string()] }),
        };
        out.push(ValidationResult {
            path: p.display().to_string(),
            valid: errors.is_null(),
            errors,
        });
    }
    let all_valid = out.iter().all(|r| r.valid);
    Ok(Output {
        success: all_valid,
        ..render(ApiResponse::ok(out))?
    })
}

pub async fn show(manager: &DocumentLifecycleManager, access_key: &str) -> Result<Output> {
    render(ApiResponse::from_result(manager.by_access_key(access_key).await))
}

pub async fn annul(
    manager: &DocumentLifecycleManager,
    actor: &ActorContext,
    access_key: &str,
    reason: &str,
) -> Result<Output> {
    let resp = match manager.annul(actor, access_key, reason).await {
        Ok(doc) => ApiResponse::ok(doc).with_message("document annulled"),
        Err(e) => ApiResponse::failure(&e),
    };
    render(resp)
}

pub async fn reprocess(
    manager: &DocumentLifecycleManager,
    actor: &ActorContext,
    uuid: Uuid,
) -> Result<Output> {
    render(ApiResponse::from_result(manager.reprocess(actor, uuid).await))
}

pub async fn refresh(
    manager: &DocumentLifecycleManager,
    actor: &ActorContext,
    uuid: Uuid,
) -> Result<Output> {
    let resp = match manager.refresh_status(actor, uuid).await {
        Ok(out) => {
            let mut resp = ApiResponse::ok(out.document);
            resp.warning = out.warning;
            resp
        }
        Err(e) => ApiResponse::failure(&e),
    };
    render(resp)
}

pub async fn pending(manager: &DocumentLifecycleManager) -> Result<Output> {
    render(ApiResponse::from_result(manager.list_pending().await))
}

pub fn validate_key(key: &str) -> Result<Output> {
    let valid = access_key::validate(key);
    let resp = ApiResponse::ok(serde_json::json!({ "access_key": key, "valid": valid }));
    Ok(Output {
        success: valid,
        ..render(resp)?
    })
}

pub fn decode_key(key: &str) -> Result<Output> {
    match access_key::decode(key) {
        Ok(fields) => render(ApiResponse::ok(fields)),
        Err(e) => render(refused::<()>(400, "invalid_access_key", e.to_string())),
    }
}

pub fn show_config(cfg: &AppConfig) -> Result<Output> {
    render(ApiResponse::ok(cfg))
}
