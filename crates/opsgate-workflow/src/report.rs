//! Workflow execution reports.
//!
//! A [`WorkflowReport`] always lists every task of the workflow, in
//! declaration order, each in a terminal state.  Per-task problems live
//! here as structured fields ([`TaskReason`] plus [`ErrorInfo`]), never as
//! errors returned to the caller.

use chrono::{DateTime, Utc};
use opsgate_kernel::{ErrorInfo, ErrorKind, RiskTier};
use serde::{Deserialize, Serialize};

use crate::workflow::{TaskState, WorkflowStatus};

/// Why a task did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskReason {
    /// The authorization gate refused the actor.
    PermissionDenied,
    /// The approver said no, did not answer in time, or the wait was
    /// cancelled.
    ConfirmationDenied,
    /// Still not authorized after an approved confirmation.
    ApprovalRequired,
    /// A predecessor failed or was skipped.
    UpstreamFailed,
    /// The workflow was cancelled before the task was dispatched.
    Cancelled,
    /// Required parameters missing or rejected by the capability.
    Validation,
    /// The downstream call failed (after retries, for transient errors).
    CapabilityError,
    /// The dispatch exceeded the task timeout.
    Timeout,
    /// No capability serves the intent.
    NotFound,
    Internal,
}

impl TaskReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::ConfirmationDenied => "confirmation_denied",
            Self::ApprovalRequired => "approval_required",
            Self::UpstreamFailed => "upstream_failed",
            Self::Cancelled => "cancelled",
            Self::Validation => "validation",
            Self::CapabilityError => "capability_error",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }

    /// Reason for a task that failed with an error of `kind`.
    pub fn from_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::ApprovalRequired => Self::ApprovalRequired,
            ErrorKind::Validation => Self::Validation,
            ErrorKind::Capability => Self::CapabilityError,
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::Configuration
            | ErrorKind::DuplicateIntent
            | ErrorKind::InvalidGraph
            | ErrorKind::Internal => Self::Internal,
        }
    }
}

impl std::fmt::Display for TaskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: String,
    pub intent: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub final_state: TaskState,
    /// `None` for completed tasks.
    pub reason: Option<TaskReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_tier: Option<RiskTier>,
    /// Wall time from first dispatch to the terminal state, confirmation
    /// waits included.  Zero for tasks never dispatched.
    pub latency_ms: u64,
    /// Router invocations, retries and the post-confirmation re-dispatch
    /// included.
    pub attempts: u32,
    /// Whether a confirmation checkpoint was approved for this task.
    #[serde(default)]
    pub confirmed: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub tasks: Vec<TaskReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WorkflowReport {
    pub fn task(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.final_state == state).count()
    }

    pub fn completed(&self) -> usize {
        self.count(TaskState::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskState::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(TaskState::Skipped)
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// Plain-text block report for chat transcripts and ticket notes.
    pub fn render_text(&self) -> String {
        let rule = "=".repeat(80);
        let mut out = Vec::new();
        out.push(rule.clone());
        out.push(format!("WORKFLOW REPORT: {}", self.name));
        out.push(rule);
        out.push(format!("ID: {}", self.workflow_id));
        out.push(format!("Status: {}", self.status));
        out.push(format!("Duration: {} ms", self.duration_ms));
        out.push(String::new());

        out.push("STATUS SUMMARY:".into());
        out.push(format!("  ✓ Completed: {}/{}", self.completed(), self.tasks.len()));
        if self.failed() > 0 {
            out.push(format!("  ✗ Failed: {}", self.failed()));
        }
        if self.skipped() > 0 {
            out.push(format!("  ⊘ Skipped: {}", self.skipped()));
        }
        out.push(String::new());

        out.push("TASK DETAILS:".into());
        for (i, task) in self.tasks.iter().enumerate() {
            let icon = match task.final_state {
                TaskState::Completed => "✓",
                TaskState::Failed => "✗",
                TaskState::Skipped => "⊘",
                _ => "⏳",
            };
            out.push(format!("{}. {icon} {}", i + 1, task.id));
            out.push(format!("   Intent: {}", task.intent));
            out.push(format!("   Status: {}", task.final_state));
            if let Some(tier) = task.risk_tier {
                out.push(format!("   Risk: {tier}"));
            }
            if !task.depends_on.is_empty() {
                out.push(format!("   Dependencies: {}", task.depends_on.join(", ")));
            }
            if let Some(reason) = task.reason {
                out.push(format!("   Reason: {reason}"));
            }
            if let Some(error) = &task.error {
                out.push(format!("   Error: {}", error.message));
            }
            if let Some(result) = &task.result {
                out.push(format!("   Result: {}", preview(&result.to_string(), 100)));
            }
            out.push(format!("   Attempts: {}, latency: {} ms", task.attempts, task.latency_ms));
            out.push(String::new());
        }

        out.join("\n")
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkflowReport {
        let now = Utc::now();
        WorkflowReport {
            workflow_id: "wf-offboard".into(),
            name: "Employee offboarding".into(),
            status: WorkflowStatus::PartialFailure,
            tasks: vec![
                TaskReport {
                    id: "list_devices".into(),
                    intent: "device.list".into(),
                    depends_on: vec![],
                    final_state: TaskState::Completed,
                    reason: None,
                    error: None,
                    result: Some(serde_json::json!(["LAPTOP-042"])),
                    risk_tier: Some(RiskTier::Low),
                    latency_ms: 12,
                    attempts: 1,
                    confirmed: false,
                    started_at: Some(now),
                    finished_at: Some(now),
                },
                TaskReport {
                    id: "wipe_devices".into(),
                    intent: "device.wipe".into(),
                    depends_on: vec!["list_devices".into()],
                    final_state: TaskState::Skipped,
                    reason: Some(TaskReason::ConfirmationDenied),
                    error: None,
                    result: None,
                    risk_tier: Some(RiskTier::Critical),
                    latency_ms: 0,
                    attempts: 1,
                    confirmed: false,
                    started_at: Some(now),
                    finished_at: Some(now),
                },
                TaskReport {
                    id: "close_ticket".into(),
                    intent: "ticket.resolve".into(),
                    depends_on: vec!["wipe_devices".into()],
                    final_state: TaskState::Skipped,
                    reason: Some(TaskReason::UpstreamFailed),
                    error: None,
                    result: None,
                    risk_tier: None,
                    latency_ms: 0,
                    attempts: 0,
                    confirmed: false,
                    started_at: None,
                    finished_at: Some(now),
                },
            ],
            started_at: now,
            finished_at: now,
            duration_ms: 15,
        }
    }

    #[test]
    fn json_round_trip_preserves_states_and_reasons() {
        let report = sample();
        let json = serde_json::to_string(&report).unwrap();
        let back: WorkflowReport = serde_json::from_str(&json).unwrap();

        assert_eq!(back, report);
        for (a, b) in back.tasks.iter().zip(&report.tasks) {
            assert_eq!(a.final_state, b.final_state);
            assert_eq!(a.reason, b.reason);
        }
    }

    #[test]
    fn reasons_serialize_snake_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["status"], "partial_failure");
        assert_eq!(json["tasks"][1]["final_state"], "skipped");
        assert_eq!(json["tasks"][1]["reason"], "confirmation_denied");
        assert_eq!(json["tasks"][2]["reason"], "upstream_failed");
        assert!(json["tasks"][0]["reason"].is_null());
    }

    #[test]
    fn counts_and_text() {
        let report = sample();
        assert_eq!(report.completed(), 1);
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.failed(), 0);
        assert!(!report.is_success());

        let text = report.render_text();
        assert!(text.contains("WORKFLOW REPORT: Employee offboarding"));
        assert!(text.contains("✓ Completed: 1/3"));
        assert!(text.contains("⊘ Skipped: 2"));
        assert!(!text.contains("✗ Failed"));
        assert!(text.contains("2. ⊘ wipe_devices"));
        assert!(text.contains("Reason: confirmation_denied"));
        assert!(text.contains("Dependencies: wipe_devices"));
    }

    #[test]
    fn long_results_are_truncated() {
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("abc", 3), "abc");
    }
}
