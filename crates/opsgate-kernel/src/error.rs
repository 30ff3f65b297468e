//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every fallible public API in this crate.
//! Each variant carries enough context for callers to decide how to handle
//! the failure without inspecting opaque strings.
//!
//! Capabilities report their own failures through [`CapabilityError`], which
//! carries the transient/permanent classification the workflow scheduler uses
//! to decide whether a retry is worthwhile.

use serde::{Deserialize, Serialize};

use crate::policy::RiskTier;
use crate::response::ErrorKind;

/// Unified error type for the OpsGate kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Startup errors -----------------------------------------------------
    /// Malformed policy, unknown risk tier, or other configuration mistake.
    /// Always fatal at startup.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// A second capability tried to claim an intent that is already bound.
    #[error("intent `{intent}` already bound to `{existing}`, refused for `{incoming}`")]
    DuplicateIntent {
        intent: String,
        existing: String,
        incoming: String,
    },

    // -- Authorization errors -----------------------------------------------
    /// No policy matches the intent.  The gate treats this as a denial.
    #[error("no policy matches intent: {intent}")]
    PolicyNotFound { intent: String },

    /// The actor's roles do not satisfy the policy.
    #[error("permission denied for `{actor}` on `{intent}`: {reason}")]
    PermissionDenied {
        actor: String,
        intent: String,
        reason: String,
    },

    /// The risk tier demands an approval that the context does not carry.
    #[error("intent `{intent}` ({tier}) requires approval")]
    ApprovalRequired {
        intent: String,
        tier: RiskTier,
        justification_required: bool,
    },

    // -- Dispatch errors ----------------------------------------------------
    /// No capability is bound to the intent.
    #[error("no capability registered for intent: {intent}")]
    NotFound { intent: String },

    /// Required parameters are missing.
    #[error("invalid parameters for `{intent}`: missing {}", .missing.join(", "))]
    Validation {
        intent: String,
        missing: Vec<String>,
    },

    /// The capability failed.
    #[error("capability `{capability}` failed: {source}")]
    Capability {
        capability: String,
        #[source]
        source: CapabilityError,
    },

    /// A dispatch or confirmation deadline elapsed.
    #[error("timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Shorthand for a [`KernelError::Configuration`].
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// The serializable kind reported in response envelopes.
    ///
    /// A missing policy is reported as a permission denial (deny by default).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::DuplicateIntent { .. } => ErrorKind::DuplicateIntent,
            Self::PolicyNotFound { .. } | Self::PermissionDenied { .. } => {
                ErrorKind::PermissionDenied
            }
            Self::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Capability { source, .. } => match source {
                CapabilityError::InvalidInput(_) => ErrorKind::Validation,
                _ => ErrorKind::Capability,
            },
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Capability { source, .. } if source.is_transient())
    }
}

/// Failure reported by a capability implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "class", content = "message", rename_all = "snake_case")]
pub enum CapabilityError {
    /// The parameters were present but semantically invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The downstream system failed in a way that may clear up on retry
    /// (throttling, connection reset, 5xx).
    #[error("transient failure: {0}")]
    Transient(String),

    /// The downstream system rejected the operation for good.
    #[error("operation failed: {0}")]
    Permanent(String),
}

impl CapabilityError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
