//! Workflow engine error types.
//!
//! Only structural problems surface through [`WorkflowError`]: a malformed
//! task graph, a bad configuration, or a startup failure in the kernel.
//! Per-task failures never do; they end up in the
//! [`WorkflowReport`](crate::report::WorkflowReport).

use std::path::PathBuf;

/// Unified error type for the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    // -- Graph errors --------------------------------------------------------
    /// The task graph is empty, cyclic, or references unknown tasks.
    #[error("invalid workflow graph: {reason}")]
    InvalidGraph { reason: String },

    // -- Configuration -------------------------------------------------------
    /// Engine configuration is missing or out of range.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// A configuration file could not be read.
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the kernel crate.
    #[error("kernel error: {0}")]
    Kernel(#[from] opsgate_kernel::KernelError),

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization failed.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl WorkflowError {
    pub fn invalid_graph(reason: impl Into<String>) -> Self {
        Self::InvalidGraph {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the workflow crate.
pub type Result<T> = std::result::Result<T, WorkflowError>;
