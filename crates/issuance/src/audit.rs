use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sri_einv_core::models::ElectronicDocument;
use sri_einv_core::state::ActorContext;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    pub document_uuid: String,
    pub access_key: Option<String>,
    pub state: String,
    pub actor: Option<String>,
    pub ip: Option<String>,
    pub payload_hash: Option<String>,
    pub error: Option<String>,
    pub note: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str, document_uuid: &str, state: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            document_uuid: document_uuid.to_string(),
            access_key: None,
            state: state.to_string(),
            actor: None,
            ip: None,
            payload_hash: None,
            error: None,
            note: None,
        }
    }

    pub fn for_document(event_type: &str, doc: &ElectronicDocument) -> Self {
        Self::new(event_type, &doc.uuid.to_string(), doc.state.as_str())
            .with_access_key(doc.access_key.to_string())
    }

    pub fn with_access_key(mut self, access_key: String) -> Self {
        self.access_key = Some(access_key);
        self
    }

    pub fn with_actor(mut self, actor: &ActorContext) -> Self {
        self.actor = Some(actor.user_id.clone());
        self.ip = actor.ip.clone();
        self
    }

    pub fn with_hash(mut self, hash: String) -> Self {
        self.payload_hash = Some(hash);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.note = Some(note);
        self
    }
}

/// Append-only JSONL sink. Without a path events only go to tracing.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Audit failures never abort the operation being audited.
    pub fn record(&self, event: &AuditEvent) {
        let Some(path) = &self.path else {
            tracing::debug!(event_type = %event.event_type, uuid = %event.document_uuid, "Audit event");
            return;
        };
        if let Err(e) = write_audit_event(path, event) {
            tracing::warn!(error = %e, path = %path.display(), "Failed to write audit event");
        }
    }
}

pub fn write_audit_event(path: &Path, event: &AuditEvent) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    let json = serde_json::to_string(event)?;
    writeln!(file, "{}", json)?;
    tracing::debug!(event_type=%event.event_type, uuid=%event.document_uuid, "Audit event written");
    Ok(())
}
