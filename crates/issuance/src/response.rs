use serde::Serialize;

use crate::error::LifecycleError;

/// `{success, data?, message?, error?, warning?}` with the HTTP-equivalent
/// status alongside.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip)]
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            status: 200,
            data: Some(data),
            message: None,
            error: None,
            warning: None,
        }
    }

    pub fn created(data: T, warning: Option<String>) -> Self {
        Self {
            status: 201,
            warning,
            ..Self::ok(data)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn failure(err: &LifecycleError) -> Self {
        // Validation reports keep their per-category structure.
        let errors = match err {
            LifecycleError::Validation(report) => serde_json::to_value(&report.errors).ok(),
            _ => None,
        };
        Self {
            success: false,
            status: err.status_code(),
            data: None,
            message: None,
            error: Some(ErrorBody {
                kind: err.kind(),
                detail: err.to_string(),
                errors,
            }),
            warning: None,
        }
    }

    pub fn from_result(result: Result<T, LifecycleError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failure(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sri_einv_core::error::{ValidationCategory, ValidationReport};

    #[test]
    fn success_omits_empty_fields() {
        let r = ApiResponse::created(json!({"uuid": "x"}), None);
        assert_eq!(r.status, 201);
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            json!({"success": true, "data": {"uuid": "x"}})
        );
    }

    #[test]
    fn validation_failure_keeps_categories() {
        let mut report = ValidationReport::new();
        report.push(ValidationCategory::Dates, "emission date 2030-01-01 is in the future");
        let r: ApiResponse<()> = ApiResponse::failure(&LifecycleError::Validation(report));
        assert_eq!(r.status, 422);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["success"], json!(false));
        assert_eq!(v["error"]["kind"], json!("validation_error"));
        assert!(v["error"]["errors"].is_object());
    }
}
