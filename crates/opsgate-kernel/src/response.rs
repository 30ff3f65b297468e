//! Response envelope returned by the intent router.
//!
//! Per-operation failures never escape the router as raw errors; they are
//! folded into a [`Response`] whose [`ErrorInfo`] says *what kind* of failure
//! happened (denied, needs confirmation, downstream failure, ...), so callers
//! can branch without parsing messages.

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    DuplicateIntent,
    NotFound,
    PermissionDenied,
    ApprovalRequired,
    Validation,
    Capability,
    Timeout,
    InvalidGraph,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Structured error carried by responses and workflow reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Whether a retry might succeed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
    /// Kind-specific extras (risk tier, missing fields, available intents).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            transient: false,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<&KernelError> for ErrorInfo {
    fn from(err: &KernelError) -> Self {
        let details = match err {
            KernelError::ApprovalRequired {
                tier,
                justification_required,
                ..
            } => Some(serde_json::json!({
                "risk_tier": tier,
                "justification_required": justification_required,
            })),
            KernelError::Validation { missing, .. } => {
                Some(serde_json::json!({ "missing": missing }))
            }
            KernelError::Capability { capability, .. } => {
                Some(serde_json::json!({ "capability": capability }))
            }
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            transient: err.is_transient(),
            details,
        }
    }
}

/// Outcome of a single routed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub latency_ms: u64,
    /// Name of the capability that handled (or would have handled) the
    /// intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

impl Response {
    pub fn ok(result: serde_json::Value, latency_ms: u64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            latency_ms,
            capability: None,
        }
    }

    pub fn failed(error: ErrorInfo, latency_ms: u64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            latency_ms,
            capability: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_transient_failure(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.transient)
    }
}
