//! Confirmation channel: human-in-the-loop approval checkpoints.
//!
//! The scheduler suspends a task at its checkpoint and asks a
//! [`ConfirmationBackend`] for a yes/no answer.  Three backends ship with the
//! crate:
//!
//! - [`CallbackBackend`] -- answers in-process through an async closure.
//! - [`QueuedBackend`] -- parks the request until someone replies through the
//!   paired [`ConfirmationInbox`] (a chat bot, webhook handler, ...).
//! - [`DenyAllBackend`] -- refuses everything; the default when nothing is
//!   configured.
//!
//! [`ConfirmationChannel`] wraps a backend with a timeout.  A timeout, a
//! backend panic, or a dropped reply all count as a denial.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use opsgate_kernel::{RequestContext, RiskTier};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// What the approver is being asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub workflow_id: String,
    pub task_id: String,
    pub intent: String,
    pub tier: RiskTier,
    /// Rendered, risk-appropriate prompt text.
    pub prompt: String,
}

/// How a confirmation wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Approved,
    Denied,
    TimedOut,
}

impl ConfirmationOutcome {
    pub fn is_approved(self) -> bool {
        self == Self::Approved
    }
}

/// An approver's answer.
///
/// The justification is what the approver recorded with an approval (a
/// ticket number, a reason).  It is the only way a checkpoint can satisfy a
/// policy that demands a justification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

impl ConfirmationDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            justification: None,
        }
    }

    pub fn approve_with(justification: impl Into<String>) -> Self {
        Self {
            approved: true,
            justification: Some(justification.into()),
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }
}

impl From<bool> for ConfirmationDecision {
    fn from(approved: bool) -> Self {
        Self {
            approved,
            justification: None,
        }
    }
}

/// How a checkpoint ended, plus the approver's justification when approved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub outcome: ConfirmationOutcome,
    pub justification: Option<String>,
}

impl Confirmation {
    fn without_justification(outcome: ConfirmationOutcome) -> Self {
        Self {
            outcome,
            justification: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.outcome.is_approved()
    }
}

/// A source of approval decisions.
#[async_trait]
pub trait ConfirmationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Ask for approval.  `true` means approved.
    async fn request_confirmation(
        &self,
        request: &ConfirmationRequest,
        context: &RequestContext,
    ) -> bool;

    /// Ask for approval and collect the approver's justification.  Backends
    /// that cannot carry one answer through
    /// [`ConfirmationBackend::request_confirmation`].
    async fn decide(
        &self,
        request: &ConfirmationRequest,
        context: &RequestContext,
    ) -> ConfirmationDecision {
        self.request_confirmation(request, context).await.into()
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Refuses every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllBackend;

#[async_trait]
impl ConfirmationBackend for DenyAllBackend {
    fn name(&self) -> &str {
        "deny_all"
    }

    async fn request_confirmation(&self, request: &ConfirmationRequest, _: &RequestContext) -> bool {
        tracing::info!(task_id = %request.task_id, intent = %request.intent, "confirmation auto-denied");
        false
    }
}

type Callback = dyn Fn(ConfirmationRequest) -> BoxFuture<'static, bool> + Send + Sync;

/// Answers through an in-process async closure.
#[derive(Clone)]
pub struct CallbackBackend {
    callback: Arc<Callback>,
}

impl CallbackBackend {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(ConfirmationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            callback: Arc::new(move |request| callback(request).boxed()),
        }
    }

    /// Synchronous decision function.
    pub fn from_fn<F>(decide: F) -> Self
    where
        F: Fn(&ConfirmationRequest) -> bool + Send + Sync + 'static,
    {
        Self::new(move |request| {
            let answer = decide(&request);
            async move { answer }
        })
    }

    pub fn approve_all() -> Self {
        Self::from_fn(|_| true)
    }
}

impl std::fmt::Debug for CallbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl ConfirmationBackend for CallbackBackend {
    fn name(&self) -> &str {
        "callback"
    }

    async fn request_confirmation(&self, request: &ConfirmationRequest, _: &RequestContext) -> bool {
        (self.callback)(request.clone()).await
    }
}

/// A parked confirmation waiting for an out-of-band reply.
///
/// Dropping it without replying counts as a denial.
#[derive(Debug)]
pub struct PendingConfirmation {
    pub request: ConfirmationRequest,
    pub actor: String,
    pub correlation_id: String,
    reply: oneshot::Sender<ConfirmationDecision>,
}

impl PendingConfirmation {
    pub fn approve(self) {
        self.respond_with(ConfirmationDecision::approve());
    }

    /// Approve and record why, e.g. the incident ticket number.
    pub fn approve_with_justification(self, justification: impl Into<String>) {
        self.respond_with(ConfirmationDecision::approve_with(justification));
    }

    pub fn deny(self) {
        self.respond_with(ConfirmationDecision::deny());
    }

    pub fn respond(self, approved: bool) {
        self.respond_with(approved.into());
    }

    pub fn respond_with(self, decision: ConfirmationDecision) {
        if self.reply.send(decision).is_err() {
            tracing::debug!(task_id = %self.request.task_id, "confirmation reply arrived after the wait ended");
        }
    }
}

/// Receiving end of a [`QueuedBackend`].
#[derive(Debug)]
pub struct ConfirmationInbox {
    rx: mpsc::UnboundedReceiver<PendingConfirmation>,
}

impl ConfirmationInbox {
    /// Next parked request, or `None` once every backend handle is gone.
    pub async fn next(&mut self) -> Option<PendingConfirmation> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`ConfirmationInbox::next`].
    pub fn try_next(&mut self) -> Option<PendingConfirmation> {
        self.rx.try_recv().ok()
    }
}

/// Parks each request until a reply arrives through the paired inbox.
#[derive(Debug, Clone)]
pub struct QueuedBackend {
    tx: mpsc::UnboundedSender<PendingConfirmation>,
}

impl QueuedBackend {
    pub fn new() -> (Self, ConfirmationInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, ConfirmationInbox { rx })
    }
}

#[async_trait]
impl ConfirmationBackend for QueuedBackend {
    fn name(&self) -> &str {
        "queued"
    }

    async fn request_confirmation(&self, request: &ConfirmationRequest, context: &RequestContext) -> bool {
        self.decide(request, context).await.approved
    }

    async fn decide(
        &self,
        request: &ConfirmationRequest,
        context: &RequestContext,
    ) -> ConfirmationDecision {
        let (reply, answer) = oneshot::channel();
        let pending = PendingConfirmation {
            request: request.clone(),
            actor: context.actor.clone(),
            correlation_id: context.correlation_id.clone(),
            reply,
        };
        if self.tx.send(pending).is_err() {
            tracing::warn!(task_id = %request.task_id, "confirmation inbox closed, denying");
            return ConfirmationDecision::deny();
        }
        answer.await.unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A backend plus the time an approver is given to answer.
#[derive(Clone)]
pub struct ConfirmationChannel {
    backend: Arc<dyn ConfirmationBackend>,
    timeout: Duration,
}

impl ConfirmationChannel {
    pub fn new(backend: Arc<dyn ConfirmationBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Channel that denies everything.
    pub fn deny_all() -> Self {
        Self::new(Arc::new(DenyAllBackend), Duration::from_secs(300))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Same timeout, different backend.
    pub fn with_backend(&self, backend: Arc<dyn ConfirmationBackend>) -> Self {
        Self {
            backend,
            timeout: self.timeout,
        }
    }

    /// Ask the backend, bounded by the timeout.
    pub async fn confirm(
        &self,
        request: &ConfirmationRequest,
        context: &RequestContext,
    ) -> Confirmation {
        let ask = AssertUnwindSafe(self.backend.decide(request, context)).catch_unwind();
        let outcome = match tokio::time::timeout(self.timeout, ask).await {
            Ok(Ok(decision)) if decision.approved => {
                return Confirmation {
                    outcome: ConfirmationOutcome::Approved,
                    justification: decision.justification.filter(|j| !j.trim().is_empty()),
                };
            }
            Ok(Ok(_)) => ConfirmationOutcome::Denied,
            Ok(Err(_)) => {
                tracing::error!(
                    backend = self.backend.name(),
                    task_id = %request.task_id,
                    "confirmation backend panicked, treating as denial"
                );
                ConfirmationOutcome::Denied
            }
            Err(_) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    task_id = %request.task_id,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "confirmation timed out"
                );
                ConfirmationOutcome::TimedOut
            }
        };
        Confirmation::without_justification(outcome)
    }
}

impl Default for ConfirmationChannel {
    fn default() -> Self {
        Self::deny_all()
    }
}

impl std::fmt::Debug for ConfirmationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationChannel")
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
