//! Request context.
//!
//! A [`RequestContext`] says who is asking, under which correlation id, with
//! which roles, and which approvals they already hold.  It is owned by the
//! caller and only ever borrowed by the router and scheduler; when the
//! scheduler needs a task-scoped approval it derives a new value with
//! [`RequestContext::with_task_approval`] instead of mutating the original.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::RiskTier;

/// Immutable description of the caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Who is acting (user principal, service account).
    pub actor: String,
    /// Session / correlation identifier threaded through every audit record.
    pub correlation_id: String,
    /// Roles held by the actor.
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Whether an approval for risky operations has been granted.
    #[serde(default)]
    pub approval_granted: bool,
    /// Free-text reason accompanying the approval.
    #[serde(default)]
    pub approval_justification: Option<String>,
    /// Manager sign-off, needed on top of `approval_granted` for `critical`.
    #[serde(default)]
    pub manager_approval: bool,
    /// Who granted the approval, if known.
    #[serde(default)]
    pub approver_id: Option<String>,
    /// Channel the request came in on (`teams`, `web`, `cli`, `api`).
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl RequestContext {
    /// A context for `actor` with no roles and no approvals.
    pub fn new(actor: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            correlation_id: correlation_id.into(),
            roles: BTreeSet::new(),
            approval_granted: false,
            approval_justification: None,
            manager_approval: false,
            approver_id: None,
            source: None,
            tenant_id: None,
        }
    }

    /// A context for `actor` with a freshly generated correlation id.
    pub fn for_actor(actor: impl Into<String>) -> Self {
        Self::new(actor, Uuid::now_v7().to_string())
    }

    pub fn with_roles<I, R>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Mark approval as granted, optionally with a justification.
    pub fn with_approval(mut self, justification: Option<String>) -> Self {
        self.approval_granted = true;
        self.approval_justification = justification;
        self
    }

    pub fn with_manager_approval(mut self, approver_id: impl Into<String>) -> Self {
        self.manager_approval = true;
        self.approver_id = Some(approver_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Derive the context used to re-dispatch a single task after its
    /// confirmation checkpoint was approved.
    ///
    /// The confirmation prompt for `critical` tasks asks for manager
    /// sign-off, so an approval there also sets `manager_approval`.  A
    /// justification given by the approver replaces the caller's; without
    /// one the caller's justification (if any) is kept as is.
    pub fn with_task_approval(&self, tier: RiskTier, justification: Option<&str>) -> Self {
        let mut scoped = self.clone();
        scoped.approval_granted = true;
        if let Some(justification) = justification.filter(|j| !j.trim().is_empty()) {
            scoped.approval_justification = Some(justification.to_string());
        }
        if tier == RiskTier::Critical {
            scoped.manager_approval = true;
        }
        scoped
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let ctx = RequestContext::new("alice", "corr-1")
            .with_roles(["it_admin", "viewer"])
            .with_approval(Some("ticket INC001".into()))
            .with_source("cli");

        assert!(ctx.has_role("it_admin"));
        assert!(ctx.approval_granted);
        assert_eq!(ctx.approval_justification.as_deref(), Some("ticket INC001"));
        assert!(!ctx.manager_approval);
        assert_eq!(ctx.source.as_deref(), Some("cli"));
    }

    #[test]
    fn task_approval_leaves_original_untouched() {
        let ctx = RequestContext::for_actor("bob").with_roles(["it_admin"]);
        let scoped = ctx.with_task_approval(RiskTier::Critical, None);

        assert!(!ctx.approval_granted);
        assert!(!ctx.manager_approval);
        assert!(scoped.approval_granted);
        assert!(scoped.manager_approval);
        assert_eq!(scoped.correlation_id, ctx.correlation_id);
    }

    #[test]
    fn task_approval_below_critical_does_not_grant_manager_flag() {
        let ctx = RequestContext::for_actor("bob");
        let scoped = ctx.with_task_approval(RiskTier::High, None);
        assert!(scoped.approval_granted);
        assert!(!scoped.manager_approval);
    }

    #[test]
    fn task_approval_never_invents_a_justification() {
        let bare = RequestContext::for_actor("bob");
        assert_eq!(bare.with_task_approval(RiskTier::High, None).approval_justification, None);
        assert_eq!(bare.with_task_approval(RiskTier::High, Some("  ")).approval_justification, None);

        let mut justified = RequestContext::for_actor("bob");
        justified.approval_justification = Some("INC0001".into());
        assert_eq!(
            justified
                .with_task_approval(RiskTier::High, None)
                .approval_justification
                .as_deref(),
            Some("INC0001")
        );
        assert_eq!(
            justified
                .with_task_approval(RiskTier::High, Some("INC0042 approved by manager"))
                .approval_justification
                .as_deref(),
            Some("INC0042 approved by manager")
        );
    }
}
