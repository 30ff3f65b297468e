//! OpsGate kernel.
//!
//! The request path shared by every OpsGate front end:
//!
//! - **[`policy`]** -- Intent-pattern policy table (exact, namespace
//!   prefix, catch-all) mapping each intent to roles and a risk tier.
//! - **[`auth`]** -- Authorization gate: one decision and one audit record
//!   per check.
//! - **[`audit`]** -- Structured audit records and pluggable sinks, with a
//!   non-blocking buffered emitter.
//! - **[`capability`]** -- The trait external collaborators implement.
//! - **[`registry`]** -- Concurrent intent -> capability bindings built on
//!   [`dashmap::DashMap`].
//! - **[`router`]** -- Resolve, authorize, validate, invoke; every outcome is
//!   folded into a [`Response`].
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod audit;
pub mod auth;
pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod policy;
pub mod registry;
pub mod response;
pub mod router;

// Re-export the most commonly used types at the crate root for convenience.
pub use audit::{
    AuditEmitter, AuditOutcome, AuditRecord, AuditSink, AuditSinkError, FanoutAuditSink,
    MemoryAuditSink, TracingAuditSink,
};
pub use auth::{AuthDecision, AuthorizationGate, DenialReason};
pub use capability::{Capability, FieldSpec, IntentSpec, Params};
pub use config::{AuthorizationConfig, CapabilityToggle, KernelConfig, PolicyConfig};
pub use context::RequestContext;
pub use error::{CapabilityError, KernelError, Result};
pub use policy::{Policy, PolicyRegistry, RiskTier};
pub use registry::{Binding, CapabilityRegistry};
pub use response::{ErrorInfo, ErrorKind, Response};
pub use router::IntentRouter;
