//! Risk-gated workflow scheduler.
//!
//! Executes a workflow's task graph through the [`IntentRouter`].  A single
//! coordinating loop owns every task's state; workers only run router calls
//! and confirmation waits and report back.
//!
//! # Execution model
//!
//! 1. Tasks without predecessors start `Ready`, the rest `Blocked`.
//! 2. Up to `worker_pool_size` dispatches run at once.  Tasks re-dispatched
//!    after an approved confirmation jump the ready queue.
//! 3. Transient capability failures are retried with exponential backoff;
//!    a dispatch that exceeds the task timeout fails without retry.
//! 4. `ApprovalRequired` parks the task at a confirmation checkpoint.  The
//!    wait does not occupy a worker.  Approval re-dispatches the task with a
//!    context approved for that task only; denial or timeout skips it.
//! 5. A task that fails or is skipped takes all of its transitive
//!    dependents with it.  Independent branches keep going.
//! 6. Cancellation stops new dispatches, lets running calls finish, denies
//!    pending confirmations, and skips everything not yet dispatched.
//!
//! Every terminal task state is audited.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use opsgate_kernel::{
    AuditEmitter, AuditOutcome, AuditRecord, ErrorInfo, ErrorKind, IntentRouter, KernelError,
    Params, RequestContext, Response, RiskTier,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::confirmation::{Confirmation, ConfirmationChannel, ConfirmationOutcome, ConfirmationRequest};
use crate::error::{Result, WorkflowError};
use crate::prompt::{PromptTemplates, PromptVars};
use crate::report::{TaskReason, TaskReport, WorkflowReport};
use crate::workflow::{TaskGraph, TaskState, Workflow, WorkflowStatus};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scheduler tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrent dispatches per workflow run.
    pub worker_pool_size: usize,
    /// Deadline for a single router call.
    pub task_timeout_ms: u64,
    /// Retries after the first attempt for transient capability failures.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            task_timeout_ms: 60_000,
            max_retries: 2,
            initial_backoff_ms: 500,
            backoff_factor: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Delay before retry number `retry` (1-based), capped at
    /// `max_backoff_ms`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.initial_backoff_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(WorkflowError::config("scheduler.worker_pool_size must be at least 1"));
        }
        if self.task_timeout_ms == 0 {
            return Err(WorkflowError::config("scheduler.task_timeout_ms must be positive"));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(WorkflowError::config("scheduler.backoff_factor must be >= 1.0"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(WorkflowError::config(
                "scheduler.max_backoff_ms must not be below initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancels a running workflow from outside.
///
/// Cheap to clone; every clone controls the same run.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancellationHandle::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once cancelled.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Worker plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Dispatch,
    Confirm,
}

#[derive(Debug)]
enum Checkpoint {
    Answered(Confirmation),
    Cancelled,
}

#[derive(Debug)]
enum JobOutput {
    Dispatched { response: Response, attempts: u32 },
    Checkpoint(Checkpoint),
}

async fn track(
    task: usize,
    job: Job,
    handle: JoinHandle<JobOutput>,
) -> (usize, Job, std::result::Result<JobOutput, JoinError>) {
    (task, job, handle.await)
}

/// One task's dispatch: router call under the task timeout, with retries
/// for transient failures.
async fn dispatch(
    router: Arc<IntentRouter>,
    task_id: String,
    intent: String,
    parameters: Params,
    context: RequestContext,
    config: SchedulerConfig,
) -> JobOutput {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let call = router.route(&intent, &parameters, &context);
        let response = match tokio::time::timeout(config.task_timeout(), call).await {
            Ok(response) => response,
            Err(_) => {
                let err = KernelError::Timeout {
                    operation: format!("dispatch of task `{task_id}` ({intent})"),
                    millis: config.task_timeout_ms,
                };
                warn!(task_id = %task_id, intent = %intent, attempt = attempts, "task dispatch timed out");
                return JobOutput::Dispatched {
                    response: Response::failed(ErrorInfo::from(&err), config.task_timeout_ms),
                    attempts,
                };
            }
        };

        if response.is_transient_failure() && attempts <= config.max_retries {
            let delay = config.backoff(attempts);
            warn!(
                task_id = %task_id,
                intent = %intent,
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        return JobOutput::Dispatched { response, attempts };
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TaskRun {
    state: TaskState,
    tier: Option<RiskTier>,
    reason: Option<TaskReason>,
    error: Option<ErrorInfo>,
    result: Option<serde_json::Value>,
    attempts: u32,
    confirmed: bool,
    /// What the approver recorded with the approval, if anything.
    approver_justification: Option<String>,
    clock: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    latency_ms: u64,
}

/// The coordinating loop's exclusive view of one workflow run.
struct Run<'a> {
    workflow: &'a Workflow,
    graph: TaskGraph,
    tasks: Vec<TaskRun>,
    context: &'a RequestContext,
    audit: &'a AuditEmitter,
    cancelled: bool,
}

impl<'a> Run<'a> {
    fn transition(&mut self, task: usize, next: TaskState) -> bool {
        let current = self.tasks[task].state;
        if !current.can_transition_to(next) {
            error!(
                workflow_id = %self.workflow.id,
                task_id = %self.workflow.tasks[task].id,
                from = %current,
                to = %next,
                "illegal task transition ignored"
            );
            return false;
        }
        self.tasks[task].state = next;
        true
    }

    fn mark_started(&mut self, task: usize) {
        let run = &mut self.tasks[task];
        if run.clock.is_none() {
            run.clock = Some(Instant::now());
            run.started_at = Some(Utc::now());
        }
    }

    fn finish(
        &mut self,
        task: usize,
        state: TaskState,
        reason: Option<TaskReason>,
        error: Option<ErrorInfo>,
    ) {
        if !self.transition(task, state) {
            return;
        }
        let run = &mut self.tasks[task];
        run.reason = reason;
        run.error = error;
        run.finished_at = Some(Utc::now());
        run.latency_ms = run
            .clock
            .map(|c| u64::try_from(c.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        let spec = &self.workflow.tasks[task];
        let reason_str = reason.map(TaskReason::as_str).unwrap_or("");
        match state {
            TaskState::Completed => info!(
                workflow_id = %self.workflow.id,
                task_id = %spec.id,
                intent = %spec.intent,
                latency_ms = run.latency_ms,
                "task completed"
            ),
            TaskState::Failed => warn!(
                workflow_id = %self.workflow.id,
                task_id = %spec.id,
                intent = %spec.intent,
                reason = reason_str,
                error = run.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                "task failed"
            ),
            _ => info!(
                workflow_id = %self.workflow.id,
                task_id = %spec.id,
                intent = %spec.intent,
                reason = reason_str,
                "task skipped"
            ),
        }

        let outcome = match (state, reason) {
            (TaskState::Completed, _) => AuditOutcome::Success,
            (TaskState::Skipped, Some(TaskReason::ConfirmationDenied)) => AuditOutcome::Denied,
            _ => AuditOutcome::Error,
        };
        let mut record = AuditRecord::new(self.context, spec.intent.clone(), run.tier, outcome)
            .with_detail("event", "task_terminal")
            .with_detail("workflow_id", self.workflow.id.clone())
            .with_detail("task_id", spec.id.clone())
            .with_detail("final_state", state.as_str())
            .with_detail("attempts", run.attempts)
            .with_detail("confirmed", run.confirmed)
            .with_detail("latency_ms", run.latency_ms);
        if let Some(reason) = reason {
            record = record.with_detail("reason", reason.as_str());
        }
        if let Some(error) = &run.error {
            record = record.with_detail("error", error.message.clone());
        }
        self.audit.emit(record);
    }

    /// Skip every not-yet-terminal transitive dependent of `task`.
    fn skip_dependents(&mut self, task: usize) {
        for dependent in self.graph.transitive_dependents(task) {
            if !self.tasks[dependent].state.is_terminal() {
                self.finish(
                    dependent,
                    TaskState::Skipped,
                    Some(TaskReason::UpstreamFailed),
                    None,
                );
            }
        }
    }

    /// Successors of a freshly completed `task` whose predecessors are now
    /// all complete.
    fn unblocked_by(&self, task: usize) -> Vec<usize> {
        self.graph
            .successors(task)
            .iter()
            .copied()
            .filter(|&s| self.tasks[s].state == TaskState::Blocked)
            .filter(|&s| {
                self.graph
                    .predecessors(s)
                    .iter()
                    .all(|&p| self.tasks[p].state == TaskState::Completed)
            })
            .collect()
    }

    fn status(&self) -> WorkflowStatus {
        let completed = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .count();
        if self.cancelled {
            WorkflowStatus::Cancelled
        } else if completed == self.tasks.len() {
            WorkflowStatus::Completed
        } else if completed > 0 {
            WorkflowStatus::PartialFailure
        } else {
            WorkflowStatus::Failed
        }
    }

    fn into_reports(self) -> Vec<TaskReport> {
        self.workflow
            .tasks
            .iter()
            .zip(self.tasks)
            .map(|(spec, run)| TaskReport {
                id: spec.id.clone(),
                intent: spec.intent.clone(),
                depends_on: spec.depends_on.clone(),
                final_state: run.state,
                reason: run.reason,
                error: run.error,
                result: run.result,
                risk_tier: run.tier,
                latency_ms: run.latency_ms,
                attempts: run.attempts,
                confirmed: run.confirmed,
                started_at: run.started_at,
                finished_at: run.finished_at,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Executes workflows through an [`IntentRouter`].
#[derive(Debug, Clone)]
pub struct WorkflowScheduler {
    router: Arc<IntentRouter>,
    confirmations: ConfirmationChannel,
    prompts: Arc<PromptTemplates>,
    audit: AuditEmitter,
    config: SchedulerConfig,
}

impl WorkflowScheduler {
    /// Scheduler with the deny-all confirmation channel and default prompts.
    pub fn new(router: Arc<IntentRouter>, audit: AuditEmitter, config: SchedulerConfig) -> Self {
        Self {
            router,
            confirmations: ConfirmationChannel::default(),
            prompts: Arc::new(PromptTemplates::default()),
            audit,
            config,
        }
    }

    pub fn with_confirmations(mut self, channel: ConfirmationChannel) -> Self {
        self.confirmations = channel;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptTemplates) -> Self {
        self.prompts = Arc::new(prompts);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn confirmations(&self) -> &ConfirmationChannel {
        &self.confirmations
    }

    /// Run `workflow` to completion with the configured confirmation channel.
    pub async fn execute(&self, workflow: Workflow, context: &RequestContext) -> Result<WorkflowReport> {
        self.execute_with(workflow, context, &self.confirmations, &CancellationHandle::new())
            .await
    }

    /// Run `workflow` with an explicit confirmation channel and cancellation
    /// handle.
    ///
    /// Fails only for a structurally invalid graph, before any task runs.
    pub async fn execute_with(
        &self,
        workflow: Workflow,
        context: &RequestContext,
        channel: &ConfirmationChannel,
        cancel: &CancellationHandle,
    ) -> Result<WorkflowReport> {
        let graph = workflow.graph()?;
        let started_at = Utc::now();
        let clock = Instant::now();
        let pool = self.config.worker_pool_size.max(1);

        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            tasks = workflow.tasks.len(),
            pool,
            actor = %context.actor,
            correlation_id = %context.correlation_id,
            "starting workflow execution"
        );

        let tiers: Vec<Option<RiskTier>> = workflow
            .tasks
            .iter()
            .map(|t| self.router.gate().risk_tier(&t.intent))
            .collect();
        let mut run = Run {
            workflow: &workflow,
            graph,
            tasks: tiers
                .into_iter()
                .map(|tier| TaskRun {
                    tier,
                    ..TaskRun::default()
                })
                .collect(),
            context,
            audit: &self.audit,
            cancelled: false,
        };

        let mut ready: VecDeque<usize> = VecDeque::new();
        let mut approved: VecDeque<usize> = VecDeque::new();
        for task in 0..workflow.tasks.len() {
            if run.graph.predecessors(task).is_empty() {
                run.transition(task, TaskState::Ready);
                ready.push_back(task);
            } else {
                run.transition(task, TaskState::Blocked);
            }
        }

        let mut in_flight = FuturesUnordered::new();
        let mut busy = 0usize;

        loop {
            if !run.cancelled && cancel.is_cancelled() {
                run.cancelled = true;
                warn!(workflow_id = %workflow.id, "workflow cancelled, skipping undispatched tasks");
                ready.clear();
                for task in approved.drain(..).collect::<Vec<_>>() {
                    run.finish(task, TaskState::Skipped, Some(TaskReason::Cancelled), None);
                }
                for task in 0..workflow.tasks.len() {
                    if matches!(
                        run.tasks[task].state,
                        TaskState::Pending | TaskState::Blocked | TaskState::Ready
                    ) {
                        run.finish(task, TaskState::Skipped, Some(TaskReason::Cancelled), None);
                    }
                }
            }

            while busy < pool {
                let Some(task) = approved.pop_front().or_else(|| ready.pop_front()) else {
                    break;
                };
                let spec = &workflow.tasks[task];
                let task_context = if run.tasks[task].state == TaskState::AwaitingConfirmation {
                    let tier = run.tasks[task].tier.unwrap_or(RiskTier::Critical);
                    context.with_task_approval(tier, run.tasks[task].approver_justification.as_deref())
                } else {
                    run.transition(task, TaskState::Running);
                    run.mark_started(task);
                    context.clone()
                };
                debug!(workflow_id = %workflow.id, task_id = %spec.id, intent = %spec.intent, "dispatching task");

                let handle = tokio::spawn(dispatch(
                    Arc::clone(&self.router),
                    spec.id.clone(),
                    spec.intent.clone(),
                    spec.parameters.clone(),
                    task_context,
                    self.config.clone(),
                ));
                in_flight.push(track(task, Job::Dispatch, handle));
                busy += 1;
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((task, job, joined)) = in_flight.next() => {
                    if job == Job::Dispatch {
                        busy -= 1;
                    }
                    match joined {
                        Ok(JobOutput::Dispatched { response, attempts }) => {
                            run.tasks[task].attempts += attempts;
                            if let Some(confirm) =
                                Self::on_dispatched(&mut run, task, response, &mut ready)
                            {
                                let handle = self.spawn_confirmation(&run, task, confirm, channel, cancel);
                                in_flight.push(track(task, Job::Confirm, handle));
                            }
                        }
                        Ok(JobOutput::Checkpoint(checkpoint)) => {
                            Self::on_checkpoint(&mut run, task, checkpoint, &mut approved);
                        }
                        Err(e) => {
                            error!(workflow_id = %workflow.id, task = task, error = %e, "worker crashed");
                            let info = ErrorInfo::new(ErrorKind::Internal, format!("worker crashed: {e}"));
                            run.finish(task, TaskState::Failed, Some(TaskReason::Internal), Some(info));
                            run.skip_dependents(task);
                        }
                    }
                }
                () = cancel.cancelled(), if !run.cancelled => {}
            }
        }

        for task in 0..workflow.tasks.len() {
            if !run.tasks[task].state.is_terminal() {
                error!(
                    workflow_id = %workflow.id,
                    task_id = %workflow.tasks[task].id,
                    state = %run.tasks[task].state,
                    "task left non-terminal at end of run"
                );
                run.tasks[task].state = TaskState::Failed;
                run.tasks[task].reason = Some(TaskReason::Internal);
                run.tasks[task].finished_at = Some(Utc::now());
            }
        }

        let status = run.status();
        let finished_at = Utc::now();
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        let report = WorkflowReport {
            workflow_id: workflow.id.clone(),
            name: workflow.name.clone(),
            status,
            tasks: run.into_reports(),
            started_at,
            finished_at,
            duration_ms,
        };

        info!(
            workflow_id = %report.workflow_id,
            status = %report.status,
            completed = report.completed(),
            failed = report.failed(),
            skipped = report.skipped(),
            duration_ms,
            "workflow execution complete"
        );
        Ok(report)
    }

    /// Fold a router response into the task's state.  Returns the risk tier
    /// when the task needs a confirmation checkpoint.
    fn on_dispatched(
        run: &mut Run<'_>,
        task: usize,
        response: Response,
        ready: &mut VecDeque<usize>,
    ) -> Option<RiskTier> {
        if response.success {
            run.tasks[task].result = response.result;
            run.finish(task, TaskState::Completed, None, None);
            for next in run.unblocked_by(task) {
                if run.cancelled {
                    run.finish(next, TaskState::Skipped, Some(TaskReason::Cancelled), None);
                } else if run.transition(next, TaskState::Ready) {
                    ready.push_back(next);
                }
            }
            return None;
        }

        let error = response.error.unwrap_or_else(|| {
            ErrorInfo::new(ErrorKind::Internal, "router reported failure without an error")
        });

        // First refusal for lack of approval: hold at a checkpoint.  A second
        // one, after approval, is a plain failure.
        if error.kind == ErrorKind::ApprovalRequired && run.tasks[task].state == TaskState::Running {
            run.transition(task, TaskState::AwaitingConfirmation);
            if run.cancelled {
                let info = ErrorInfo::new(ErrorKind::Cancelled, "workflow cancelled before confirmation");
                run.finish(task, TaskState::Skipped, Some(TaskReason::ConfirmationDenied), Some(info));
                run.skip_dependents(task);
                return None;
            }
            return Some(run.tasks[task].tier.unwrap_or(RiskTier::Critical));
        }

        let reason = TaskReason::from_error_kind(error.kind);
        run.finish(task, TaskState::Failed, Some(reason), Some(error));
        run.skip_dependents(task);
        None
    }

    fn on_checkpoint(
        run: &mut Run<'_>,
        task: usize,
        checkpoint: Checkpoint,
        approved: &mut VecDeque<usize>,
    ) {
        let answer = match checkpoint {
            Checkpoint::Answered(answer) => answer,
            Checkpoint::Cancelled => {
                let info = ErrorInfo::new(ErrorKind::Cancelled, "workflow cancelled during confirmation");
                run.finish(task, TaskState::Skipped, Some(TaskReason::ConfirmationDenied), Some(info));
                run.skip_dependents(task);
                return;
            }
        };
        let message = match answer.outcome {
            ConfirmationOutcome::Approved => {
                run.tasks[task].confirmed = true;
                run.tasks[task].approver_justification = answer.justification;
                if run.cancelled {
                    run.finish(task, TaskState::Skipped, Some(TaskReason::Cancelled), None);
                    run.skip_dependents(task);
                } else {
                    info!(
                        workflow_id = %run.workflow.id,
                        task_id = %run.workflow.tasks[task].id,
                        justified = run.tasks[task].approver_justification.is_some(),
                        "confirmation approved, re-dispatching"
                    );
                    approved.push_back(task);
                }
                return;
            }
            ConfirmationOutcome::Denied => {
                ErrorInfo::new(ErrorKind::ApprovalRequired, "confirmation denied")
            }
            ConfirmationOutcome::TimedOut => {
                ErrorInfo::new(ErrorKind::Timeout, "confirmation timed out")
            }
        };
        run.finish(
            task,
            TaskState::Skipped,
            Some(TaskReason::ConfirmationDenied),
            Some(message),
        );
        run.skip_dependents(task);
    }

    fn spawn_confirmation(
        &self,
        run: &Run<'_>,
        task: usize,
        tier: RiskTier,
        channel: &ConfirmationChannel,
        cancel: &CancellationHandle,
    ) -> JoinHandle<JobOutput> {
        let spec = &run.workflow.tasks[task];
        let prompt = self.prompts.render(&PromptVars {
            workflow_id: &run.workflow.id,
            task_id: &spec.id,
            intent: &spec.intent,
            actor: &run.context.actor,
            tier,
        });
        let request = ConfirmationRequest {
            workflow_id: run.workflow.id.clone(),
            task_id: spec.id.clone(),
            intent: spec.intent.clone(),
            tier,
            prompt,
        };
        info!(
            workflow_id = %request.workflow_id,
            task_id = %request.task_id,
            %tier,
            backend = channel.backend_name(),
            "awaiting confirmation"
        );

        let channel = channel.clone();
        let cancel = cancel.clone();
        let context = run.context.clone();
        tokio::spawn(async move {
            let checkpoint = tokio::select! {
                outcome = channel.confirm(&request, &context) => Checkpoint::Answered(outcome),
                () = cancel.cancelled() => Checkpoint::Cancelled,
            };
            JobOutput::Checkpoint(checkpoint)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Task;
    use async_trait::async_trait;
    use opsgate_kernel::{
        AuthorizationGate, Capability, CapabilityError, IntentSpec, MemoryAuditSink, PolicyRegistry,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails transiently `flaky_failures` times, then succeeds.
    struct Helpdesk {
        flaky_failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Capability for Helpdesk {
        fn name(&self) -> &str {
            "helpdesk"
        }

        fn intents(&self) -> Vec<IntentSpec> {
            ["ping", "ticket.flaky", "ticket.broken", "ticket.slow"]
                .into_iter()
                .map(IntentSpec::new)
                .collect()
        }

        async fn execute(
            &self,
            intent: &str,
            _params: &Params,
            _context: &RequestContext,
        ) -> std::result::Result<serde_json::Value, CapabilityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match intent {
                "ticket.flaky" if call <= self.flaky_failures => {
                    Err(CapabilityError::transient("429 too many requests"))
                }
                "ticket.broken" => Err(CapabilityError::permanent("ticket table missing")),
                "ticket.slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(serde_json::json!("late"))
                }
                _ => Ok(serde_json::json!({ "call": call })),
            }
        }
    }

    fn scheduler(flaky_failures: u32, config: SchedulerConfig) -> (WorkflowScheduler, Arc<Helpdesk>, Arc<MemoryAuditSink>) {
        let mut policies = PolicyRegistry::new();
        policies.register("*", Vec::<String>::new(), RiskTier::Low, false).unwrap();
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = AuditEmitter::new(sink.clone());
        let router = IntentRouter::new(AuthorizationGate::new(Arc::new(policies), audit.clone()));
        let helpdesk = Arc::new(Helpdesk {
            flaky_failures,
            calls: AtomicU32::new(0),
        });
        router.register_capability(helpdesk.clone(), None).unwrap();
        (
            WorkflowScheduler::new(Arc::new(router), audit, config),
            helpdesk,
            sink,
        )
    }

    fn fast_retries() -> SchedulerConfig {
        SchedulerConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = SchedulerConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_millis(1000));
        assert_eq!(config.backoff(3), Duration::from_millis(2000));
        assert_eq!(config.backoff(10), Duration::from_millis(10_000));
    }

    #[test]
    fn config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let zero_pool = SchedulerConfig {
            worker_pool_size: 0,
            ..SchedulerConfig::default()
        };
        assert!(zero_pool.validate().is_err());
        let shrinking = SchedulerConfig {
            backoff_factor: 0.5,
            ..SchedulerConfig::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn cancellation_handle_is_shared() {
        let handle = CancellationHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());
        clone.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (scheduler, helpdesk, _) = scheduler(2, fast_retries());
        let wf = Workflow::new("retry", vec![Task::new("t", "ticket.flaky")]);
        let report = scheduler
            .execute(wf, &RequestContext::new("alice", "c"))
            .await
            .unwrap();

        let task = report.task("t").unwrap();
        assert_eq!(task.final_state, TaskState::Completed);
        assert_eq!(task.attempts, 3);
        assert_eq!(helpdesk.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (scheduler, _, _) = scheduler(10, fast_retries());
        let wf = Workflow::new("retry", vec![Task::new("t", "ticket.flaky")]);
        let report = scheduler
            .execute(wf, &RequestContext::new("alice", "c"))
            .await
            .unwrap();

        let task = report.task("t").unwrap();
        assert_eq!(task.final_state, TaskState::Failed);
        assert_eq!(task.reason, Some(TaskReason::CapabilityError));
        assert_eq!(task.attempts, 3);
        assert!(task.error.as_ref().unwrap().transient);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (scheduler, helpdesk, _) = scheduler(0, fast_retries());
        let wf = Workflow::new("broken", vec![Task::new("t", "ticket.broken")]);
        let report = scheduler
            .execute(wf, &RequestContext::new("alice", "c"))
            .await
            .unwrap();

        assert_eq!(report.task("t").unwrap().attempts, 1);
        assert_eq!(helpdesk.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn task_timeout_is_a_failure() {
        let (scheduler, _, _) = scheduler(
            0,
            SchedulerConfig {
                task_timeout_ms: 30,
                ..fast_retries()
            },
        );
        let wf = Workflow::new(
            "slow",
            vec![
                Task::new("slow", "ticket.slow"),
                Task::new("after", "ping").after(["slow"]),
            ],
        );
        let report = scheduler
            .execute(wf, &RequestContext::new("alice", "c"))
            .await
            .unwrap();

        let slow = report.task("slow").unwrap();
        assert_eq!(slow.final_state, TaskState::Failed);
        assert_eq!(slow.reason, Some(TaskReason::Timeout));
        assert_eq!(slow.attempts, 1);
        assert_eq!(report.task("after").unwrap().reason, Some(TaskReason::UpstreamFailed));
    }

    #[tokio::test]
    async fn invalid_graph_runs_nothing() {
        let (scheduler, helpdesk, sink) = scheduler(0, fast_retries());
        let wf = Workflow::new(
            "cycle",
            vec![
                Task::new("a", "ping").after(["b"]),
                Task::new("b", "ping").after(["a"]),
            ],
        );
        let err = scheduler
            .execute(wf, &RequestContext::new("alice", "c"))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::InvalidGraph { .. }));
        assert_eq!(helpdesk.calls.load(Ordering::SeqCst), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn terminal_states_are_audited() {
        let (scheduler, _, sink) = scheduler(0, fast_retries());
        let wf = Workflow::new(
            "audit",
            vec![
                Task::new("a", "ticket.broken"),
                Task::new("b", "ping").after(["a"]),
            ],
        )
        .with_id("wf-audit");
        scheduler
            .execute(wf, &RequestContext::new("alice", "corr-a"))
            .await
            .unwrap();

        let terminal: Vec<_> = sink
            .drain()
            .into_iter()
            .filter(|r| r.detail_str("event") == Some("task_terminal"))
            .collect();
        assert_eq!(terminal.len(), 2);
        assert!(terminal.iter().all(|r| r.outcome == AuditOutcome::Error));
        assert!(terminal.iter().all(|r| r.detail_str("workflow_id") == Some("wf-audit")));
        let b = terminal.iter().find(|r| r.detail_str("task_id") == Some("b")).unwrap();
        assert_eq!(b.detail_str("reason"), Some("upstream_failed"));
    }
}
