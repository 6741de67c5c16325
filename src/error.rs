/// Dispatch error taxonomy
///
/// Every failure a trigger can produce maps to one of these variants, each
/// carrying the HTTP status it is reported with.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The compiled program could not be loaded
    #[error("Failed to execute code")]
    LoadFailure { version_id: String, details: String },

    /// The program does not expose the requested entry function
    #[error("Function '{entry}' not found in executable")]
    EntryNotFound { entry: String, status: StatusCode },

    /// The program ran and failed, or the remote executor reported a failure
    #[error("{message}")]
    RuntimeFailure {
        message: String,
        details: Option<String>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid ID: {0}")]
    InvalidIdentifier(String),
}

impl DispatchError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::RuntimeFailure {
            message: message.into(),
            details: None,
        }
    }

    pub fn runtime_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::RuntimeFailure {
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::LoadFailure { .. } | Self::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            Self::EntryNotFound { status, .. } => *status,
            Self::RuntimeFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoadFailure { .. } => "load_failure",
            Self::EntryNotFound { .. } => "entry_not_found",
            Self::RuntimeFailure { .. } => "runtime_failure",
            Self::NotFound(_) => "not_found",
            Self::InvalidIdentifier(_) => "invalid_identifier",
        }
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            Self::LoadFailure { details, .. } => Some(details),
            Self::RuntimeFailure { details, .. } => details.as_deref(),
            _ => None,
        }
    }

    /// JSON body reported to callers: `{"error", "kind", "details"?}`
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let Some(details) = self.details() {
            body["details"] = Value::String(details.to_string());
        }
        body
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_not_found_names_the_entry() {
        let err = DispatchError::EntryNotFound {
            entry: "execute_with_resume".into(),
            status: StatusCode::BAD_REQUEST,
        };
        let body = err.to_body().to_string();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(body.contains("execute_with_resume"));
        assert!(body.contains("not found"));
    }

    #[test]
    fn details_only_present_when_known() {
        let bare = DispatchError::runtime("No valid HttpResponse node found");
        assert!(bare.to_body().get("details").is_none());
        assert_eq!(bare.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let load = DispatchError::LoadFailure {
            version_id: "v1".into(),
            details: "interface version 2 unsupported".into(),
        };
        assert_eq!(load.to_body()["details"], "interface version 2 unsupported");
        assert_eq!(load.to_body()["error"], "Failed to execute code");
    }
}
