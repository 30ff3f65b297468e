//! Risk-tier confirmation prompts.
//!
//! Prompt wording is data, not code: one template per tier, with
//! `{placeholder}` substitution.  Recognized placeholders are `{intent}`,
//! `{task_id}`, `{actor}`, `{tier}` and `{workflow_id}`; anything else is
//! left as written.

use opsgate_kernel::RiskTier;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// Values substituted into a prompt template.
#[derive(Debug, Clone, Copy)]
pub struct PromptVars<'a> {
    pub workflow_id: &'a str,
    pub task_id: &'a str,
    pub intent: &'a str,
    pub actor: &'a str,
    pub tier: RiskTier,
}

/// One template per risk tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    pub low: String,
    pub medium: String,
    pub high: String,
    pub critical: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            low: "Task {task_id} in workflow {workflow_id}: {intent}\n\
                  Requested by: {actor}\n\
                  Risk: {tier}\n\
                  Confirm execution? (yes/no)"
                .into(),
            medium: "Task {task_id} in workflow {workflow_id}: {intent}\n\
                     Requested by: {actor}\n\
                     Risk: {tier}. This changes live account or device state.\n\
                     Confirm execution? (yes/no)"
                .into(),
            high: "Task {task_id} in workflow {workflow_id}: {intent}\n\
                   Requested by: {actor}\n\
                   Risk: {tier}. Record a justification (ticket number or reason) with your answer.\n\
                   Confirm execution? (yes/no)"
                .into(),
            critical: "Task {task_id} in workflow {workflow_id}: {intent}\n\
                       Requested by: {actor}\n\
                       Risk: {tier}. This action is destructive and cannot be undone.\n\
                       Manager approval is required.\n\
                       Confirm execution with manager sign-off? (yes/no)"
                .into(),
        }
    }
}

impl PromptTemplates {
    pub fn template(&self, tier: RiskTier) -> &str {
        match tier {
            RiskTier::Low => &self.low,
            RiskTier::Medium => &self.medium,
            RiskTier::High => &self.high,
            RiskTier::Critical => &self.critical,
        }
    }

    /// Render the prompt for `vars.tier`.
    pub fn render(&self, vars: &PromptVars<'_>) -> String {
        let tier = match vars.tier {
            RiskTier::Critical => "CRITICAL".to_string(),
            other => other.as_str().to_string(),
        };
        self.template(vars.tier)
            .replace("{workflow_id}", vars.workflow_id)
            .replace("{task_id}", vars.task_id)
            .replace("{intent}", vars.intent)
            .replace("{actor}", vars.actor)
            .replace("{tier}", &tier)
    }

    /// Every template must be non-empty.
    pub fn validate(&self) -> Result<()> {
        for tier in [RiskTier::Low, RiskTier::Medium, RiskTier::High, RiskTier::Critical] {
            if self.template(tier).trim().is_empty() {
                return Err(WorkflowError::config(format!(
                    "confirmation prompt for tier `{tier}` is empty"
                )));
            }
        }
        Ok(())
    }
}
