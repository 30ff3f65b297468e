//! Engine facade.
//!
//! Assembles the policy registry, authorization gate, audit emitter,
//! intent router and workflow scheduler from an [`EngineConfig`] and exposes
//! the two entry points: [`Engine::handle_request`] for single operations and
//! [`Engine::execute_workflow`] for task graphs.
//!
//! Construction fails fast: a malformed policy or two capabilities claiming
//! the same intent abort [`EngineBuilder::build`].

use std::sync::Arc;

use opsgate_kernel::{
    AuditEmitter, AuditSink, AuthorizationGate, Capability, ErrorInfo, IntentRouter, KernelError,
    Params, PolicyRegistry, RequestContext, Response, TracingAuditSink,
};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::confirmation::{ConfirmationBackend, ConfirmationChannel, DenyAllBackend};
use crate::error::Result;
use crate::report::WorkflowReport;
use crate::scheduler::{CancellationHandle, WorkflowScheduler};
use crate::workflow::Workflow;

/// Step-by-step [`Engine`] construction.
pub struct EngineBuilder {
    config: EngineConfig,
    capabilities: Vec<Arc<dyn Capability>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    buffered_audit: bool,
    confirmation_backend: Option<Arc<dyn ConfirmationBackend>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            capabilities: Vec::new(),
            audit_sink: None,
            buffered_audit: false,
            confirmation_backend: None,
        }
    }

    /// Add a capability.  It is registered for every intent it declares,
    /// unless the configuration disables it.
    pub fn capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Where audit records go.  Defaults to [`TracingAuditSink`].
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Deliver audit records from a background task instead of inline.
    /// [`EngineBuilder::build`] fails outside a tokio runtime.
    pub fn buffered_audit(mut self, buffered: bool) -> Self {
        self.buffered_audit = buffered;
        self
    }

    /// Default confirmation backend.  Without one, every confirmation is
    /// denied.
    pub fn confirmation_backend(mut self, backend: Arc<dyn ConfirmationBackend>) -> Self {
        self.confirmation_backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let policies = PolicyRegistry::from_config(&config.kernel.policies)?;
        let sink = self
            .audit_sink
            .unwrap_or_else(|| Arc::new(TracingAuditSink) as Arc<dyn AuditSink>);
        let audit = if self.buffered_audit {
            AuditEmitter::buffered(sink)?
        } else {
            AuditEmitter::new(sink)
        };

        let gate = AuthorizationGate::with_config(
            Arc::new(policies),
            audit.clone(),
            config.kernel.authorization.clone(),
        );
        let router = IntentRouter::new(gate);

        let mut registered = Vec::new();
        for capability in self.capabilities {
            let toggle = config.kernel.capability(capability.name());
            if !toggle.enabled {
                info!(capability = capability.name(), "capability disabled by configuration");
                continue;
            }
            registered.push(capability.name().to_string());
            router.register_capability(capability, toggle.max_concurrency)?;
        }
        for name in config.kernel.capabilities.keys() {
            if !registered.contains(name) && config.kernel.capability(name).enabled {
                warn!(capability = %name, "configured capability was never provided");
            }
        }

        let backend = self
            .confirmation_backend
            .unwrap_or_else(|| Arc::new(DenyAllBackend) as Arc<dyn ConfirmationBackend>);
        let channel = ConfirmationChannel::new(backend, config.confirmation.timeout());

        let router = Arc::new(router);
        let scheduler = WorkflowScheduler::new(Arc::clone(&router), audit.clone(), config.scheduler.clone())
            .with_confirmations(channel)
            .with_prompts(config.prompts.clone());

        info!(
            intents = router.registry().count(),
            capabilities = registered.len(),
            policies = router.gate().policies().len(),
            confirmation_backend = scheduler.confirmations().backend_name(),
            "engine ready"
        );

        Ok(Engine {
            router,
            scheduler,
            audit,
            config,
        })
    }
}

/// The assembled request path.
#[derive(Debug, Clone)]
pub struct Engine {
    router: Arc<IntentRouter>,
    scheduler: WorkflowScheduler,
    audit: AuditEmitter,
    config: EngineConfig,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Route one operation.  Never fails; problems are reported in the
    /// response.  The dispatch is bounded by the scheduler's task timeout.
    pub async fn handle_request(
        &self,
        intent: &str,
        parameters: Params,
        context: &RequestContext,
    ) -> Response {
        let timeout = self.config.scheduler.task_timeout();
        match tokio::time::timeout(timeout, self.router.route(intent, &parameters, context)).await {
            Ok(response) => response,
            Err(_) => {
                let err = KernelError::Timeout {
                    operation: format!("request `{intent}`"),
                    millis: self.config.scheduler.task_timeout_ms,
                };
                warn!(intent, actor = %context.actor, "request timed out");
                Response::failed(ErrorInfo::from(&err), self.config.scheduler.task_timeout_ms)
            }
        }
    }

    /// Execute a workflow with the configured confirmation backend.
    pub async fn execute_workflow(
        &self,
        workflow: Workflow,
        context: &RequestContext,
    ) -> Result<WorkflowReport> {
        self.scheduler.execute(workflow, context).await
    }

    /// Execute a workflow with a specific confirmation backend.
    pub async fn execute_workflow_with(
        &self,
        workflow: Workflow,
        context: &RequestContext,
        backend: Arc<dyn ConfirmationBackend>,
    ) -> Result<WorkflowReport> {
        let channel = self.scheduler.confirmations().with_backend(backend);
        self.scheduler
            .execute_with(workflow, context, &channel, &CancellationHandle::new())
            .await
    }

    /// Execute a workflow that can be cancelled through `cancel`.
    pub async fn execute_cancellable(
        &self,
        workflow: Workflow,
        context: &RequestContext,
        cancel: &CancellationHandle,
    ) -> Result<WorkflowReport> {
        self.scheduler
            .execute_with(workflow, context, self.scheduler.confirmations(), cancel)
            .await
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    pub fn scheduler(&self) -> &WorkflowScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn available_intents(&self) -> Vec<String> {
        self.router.available_intents()
    }

    /// Wait for buffered audit records to reach the sink.
    pub async fn shutdown(&self) {
        self.audit.flush().await;
        info!("engine shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
