//! Audit emitter and sinks.
//!
//! Every authorization decision and every terminal task transition produces
//! an [`AuditRecord`].  Records are handed to an [`AuditEmitter`], which
//! forwards them to a pluggable [`AuditSink`].  Emission never fails from the
//! caller's point of view: sink errors (and sink panics) are logged locally
//! and swallowed.
//!
//! Two emitter modes are available:
//!
//! - **Direct** ([`AuditEmitter::new`]) -- the sink is invoked inline.  Sinks
//!   must therefore be cheap and non-blocking (the bundled ones are).
//! - **Buffered** ([`AuditEmitter::buffered`]) -- records go through an
//!   unbounded [`tokio::sync::mpsc`] channel to a background forwarder task,
//!   so a slow sink never holds up the router or scheduler.  Call
//!   [`AuditEmitter::flush`] to wait until everything queued so far has
//!   reached the sink.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::{KernelError, Result};
use crate::policy::RiskTier;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Outcome recorded in an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    ApprovalRequired,
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::ApprovalRequired => "approval_required",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor: String,
    pub intent: String,
    /// `None` when no policy matched the intent.
    pub risk_tier: Option<RiskTier>,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub details: BTreeMap<String, serde_json::Value>,
}

impl AuditRecord {
    pub fn new(
        context: &RequestContext,
        intent: impl Into<String>,
        risk_tier: Option<RiskTier>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            actor: context.actor.clone(),
            intent: intent.into(),
            risk_tier,
            outcome,
            timestamp: Utc::now(),
            correlation_id: context.correlation_id.clone(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(serde_json::Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Failure reported by a sink.  Never propagated past the emitter.
#[derive(Debug, thiserror::Error)]
#[error("audit sink `{sink}` failed: {reason}")]
pub struct AuditSinkError {
    pub sink: String,
    pub reason: String,
}

/// Destination for audit records.  Must tolerate concurrent calls.
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    fn emit(&self, record: &AuditRecord) -> std::result::Result<(), AuditSinkError>;
}

/// Lock-free in-memory sink, handy for tests and for embedding applications
/// that ship records elsewhere in batches.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: SegQueue<AuditRecord>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every record collected so far, oldest first.
    pub fn drain(&self) -> Vec<AuditRecord> {
        let mut out = Vec::with_capacity(self.records.len());
        while let Some(record) = self.records.pop() {
            out.push(record);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &str {
        "memory"
    }

    fn emit(&self, record: &AuditRecord) -> std::result::Result<(), AuditSinkError> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Writes each record as a structured `tracing` event on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn emit(&self, record: &AuditRecord) -> std::result::Result<(), AuditSinkError> {
        let details = serde_json::to_string(&record.details).map_err(|e| AuditSinkError {
            sink: self.name().to_string(),
            reason: e.to_string(),
        })?;
        let tier = record.risk_tier.map(|t| t.as_str()).unwrap_or("none");

        if record.outcome == AuditOutcome::Success {
            tracing::info!(
                target: "audit",
                record_id = %record.id,
                actor = %record.actor,
                intent = %record.intent,
                tier,
                outcome = %record.outcome,
                correlation_id = %record.correlation_id,
                details = %details,
                "AUDIT"
            );
        } else {
            tracing::warn!(
                target: "audit",
                record_id = %record.id,
                actor = %record.actor,
                intent = %record.intent,
                tier,
                outcome = %record.outcome,
                correlation_id = %record.correlation_id,
                details = %details,
                "AUDIT"
            );
        }
        Ok(())
    }
}

/// Forwards every record to each inner sink; one failing sink does not stop
/// the others.
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn name(&self) -> &str {
        "fanout"
    }

    fn emit(&self, record: &AuditRecord) -> std::result::Result<(), AuditSinkError> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.emit(record) {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AuditSinkError {
                sink: self.name().to_string(),
                reason: failures.join("; "),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

enum Command {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

enum Mode {
    Direct(Arc<dyn AuditSink>),
    Buffered(mpsc::UnboundedSender<Command>),
}

/// Fire-and-forget front end to an [`AuditSink`].
///
/// Cheaply cloneable; every clone feeds the same sink.
#[derive(Clone)]
pub struct AuditEmitter {
    mode: Arc<Mode>,
}

impl AuditEmitter {
    /// Emitter that calls `sink` inline.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            mode: Arc::new(Mode::Direct(sink)),
        }
    }

    /// Emitter backed by a background forwarder task.
    ///
    /// Fails with [`KernelError::Configuration`] outside a tokio runtime.
    pub fn buffered(sink: Arc<dyn AuditSink>) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            KernelError::config(format!("buffered audit needs a tokio runtime: {e}"))
        })?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        runtime.spawn(async move {
            tracing::debug!(sink = %sink.name(), "audit forwarder started");
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Record(record) => deliver(sink.as_ref(), &record),
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!(sink = %sink.name(), "audit forwarder stopped");
        });
        Ok(Self {
            mode: Arc::new(Mode::Buffered(tx)),
        })
    }

    /// Hand a record to the sink.  Never fails and never blocks on the sink
    /// in buffered mode.
    pub fn emit(&self, record: AuditRecord) {
        match self.mode.as_ref() {
            Mode::Direct(sink) => deliver(sink.as_ref(), &record),
            Mode::Buffered(tx) => {
                if let Err(mpsc::error::SendError(Command::Record(lost))) =
                    tx.send(Command::Record(record))
                {
                    // Forwarder is gone (runtime shutting down); keep the
                    // record in the local log rather than dropping it.
                    tracing::error!(
                        target: "audit",
                        record_id = %lost.id,
                        actor = %lost.actor,
                        intent = %lost.intent,
                        outcome = %lost.outcome,
                        correlation_id = %lost.correlation_id,
                        "audit forwarder unavailable, record logged locally"
                    );
                }
            }
        }
    }

    /// Wait until every record emitted before this call has reached the
    /// sink.  Returns immediately in direct mode.
    pub async fn flush(&self) {
        if let Mode::Buffered(tx) = self.mode.as_ref() {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(Command::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }
}

impl Default for AuditEmitter {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}

impl std::fmt::Debug for AuditEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode.as_ref() {
            Mode::Direct(_) => "direct",
            Mode::Buffered(_) => "buffered",
        };
        f.debug_struct("AuditEmitter").field("mode", &mode).finish()
    }
}

fn deliver(sink: &dyn AuditSink, record: &AuditRecord) {
    match catch_unwind(AssertUnwindSafe(|| sink.emit(record))) {
        Ok(Ok(())) => {
            tracing::trace!(record_id = %record.id, sink = %sink.name(), "audit record delivered");
        }
        Ok(Err(e)) => {
            tracing::warn!(record_id = %record.id, error = %e, "audit sink rejected record");
        }
        Err(_) => {
            tracing::error!(record_id = %record.id, sink = %sink.name(), "audit sink panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
