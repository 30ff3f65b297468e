//! Authorization gate.
//!
//! Decides, for an `(intent, context)` pair, whether the operation may run
//! now, must be confirmed first, or is refused outright.  The decision table:
//!
//! | Condition                                         | Decision           |
//! |---------------------------------------------------|--------------------|
//! | no policy matches                                 | `Denied`           |
//! | actor holds none of the required roles            | `Denied`           |
//! | tier `low`                                        | `Allowed`          |
//! | tier `medium`/`high`, approval not required       | `Allowed`          |
//! | tier `medium`/`high`, approval required, granted  | `Allowed`          |
//! | tier `medium`/`high`, approval required, missing  | `ApprovalRequired` |
//! | tier `critical`, approval *and* manager sign-off  | `Allowed`          |
//! | tier `critical`, either one missing               | `ApprovalRequired` |
//!
//! With `require_justification_for_high`, an approved `high` operation that
//! carries no justification is also `ApprovalRequired`.
//!
//! Every call emits exactly one [`AuditRecord`] before returning.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditEmitter, AuditOutcome, AuditRecord};
use crate::config::AuthorizationConfig;
use crate::context::RequestContext;
use crate::error::{KernelError, Result};
use crate::policy::{PolicyRegistry, RiskTier};

/// Why an operation was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    PolicyNotFound,
    MissingRole,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyNotFound => "policy_not_found",
            Self::MissingRole => "missing_role",
        }
    }
}

/// Result of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AuthDecision {
    Allowed {
        tier: RiskTier,
    },
    Denied {
        tier: Option<RiskTier>,
        reason: DenialReason,
        message: String,
    },
    ApprovalRequired {
        tier: RiskTier,
        justification_required: bool,
    },
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn tier(&self) -> Option<RiskTier> {
        match self {
            Self::Allowed { tier } | Self::ApprovalRequired { tier, .. } => Some(*tier),
            Self::Denied { tier, .. } => *tier,
        }
    }

    /// Convert into the error taxonomy: `Ok(tier)` when allowed,
    /// [`KernelError::PermissionDenied`] / [`KernelError::ApprovalRequired`]
    /// otherwise.
    pub fn into_result(self, intent: &str, context: &RequestContext) -> Result<RiskTier> {
        match self {
            Self::Allowed { tier } => Ok(tier),
            Self::Denied { message, .. } => Err(KernelError::PermissionDenied {
                actor: context.actor.clone(),
                intent: intent.to_string(),
                reason: message,
            }),
            Self::ApprovalRequired {
                tier,
                justification_required,
            } => Err(KernelError::ApprovalRequired {
                intent: intent.to_string(),
                tier,
                justification_required,
            }),
        }
    }

    fn audit_outcome(&self) -> AuditOutcome {
        match self {
            Self::Allowed { .. } => AuditOutcome::Success,
            Self::Denied { .. } => AuditOutcome::Denied,
            Self::ApprovalRequired { .. } => AuditOutcome::ApprovalRequired,
        }
    }
}

/// Role/risk-based gate in front of every capability call.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    policies: Arc<PolicyRegistry>,
    audit: AuditEmitter,
    config: AuthorizationConfig,
}

impl AuthorizationGate {
    pub fn new(policies: Arc<PolicyRegistry>, audit: AuditEmitter) -> Self {
        Self::with_config(policies, audit, AuthorizationConfig::default())
    }

    pub fn with_config(
        policies: Arc<PolicyRegistry>,
        audit: AuditEmitter,
        config: AuthorizationConfig,
    ) -> Self {
        Self {
            policies,
            audit,
            config,
        }
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Risk tier of `intent`, if a policy covers it.  Does not audit.
    pub fn risk_tier(&self, intent: &str) -> Option<RiskTier> {
        self.policies.resolve(intent).ok().map(|p| p.risk_tier)
    }

    /// Evaluate `intent` for `context` and audit the decision.
    pub fn authorize(&self, intent: &str, context: &RequestContext) -> AuthDecision {
        let decision = self.evaluate(intent, context);

        match &decision {
            AuthDecision::Allowed { tier } => {
                tracing::debug!(intent, actor = %context.actor, %tier, "authorization allowed");
            }
            AuthDecision::Denied { reason, .. } => {
                tracing::warn!(
                    intent,
                    actor = %context.actor,
                    correlation_id = %context.correlation_id,
                    reason = reason.as_str(),
                    "authorization denied"
                );
            }
            AuthDecision::ApprovalRequired { tier, .. } => {
                tracing::info!(
                    intent,
                    actor = %context.actor,
                    correlation_id = %context.correlation_id,
                    %tier,
                    "approval required"
                );
            }
        }

        self.audit.emit(self.decision_record(intent, context, &decision));
        decision
    }

    fn evaluate(&self, intent: &str, context: &RequestContext) -> AuthDecision {
        let policy = match self.policies.resolve(intent) {
            Ok(policy) => policy,
            Err(e) => {
                return AuthDecision::Denied {
                    tier: None,
                    reason: DenialReason::PolicyNotFound,
                    message: e.to_string(),
                };
            }
        };

        if !policy.admits(&context.roles) {
            let required: Vec<&str> = policy.required_roles.iter().map(String::as_str).collect();
            return AuthDecision::Denied {
                tier: Some(policy.risk_tier),
                reason: DenialReason::MissingRole,
                message: format!(
                    "actor `{}` holds none of the required roles [{}]",
                    context.actor,
                    required.join(", ")
                ),
            };
        }

        let tier = policy.risk_tier;
        match tier {
            RiskTier::Low => AuthDecision::Allowed { tier },
            RiskTier::Medium | RiskTier::High => {
                if !policy.approval_required {
                    return AuthDecision::Allowed { tier };
                }
                let needs_justification =
                    tier == RiskTier::High && self.config.require_justification_for_high;
                let justified = context
                    .approval_justification
                    .as_deref()
                    .is_some_and(|j| !j.trim().is_empty());

                if context.approval_granted && (!needs_justification || justified) {
                    AuthDecision::Allowed { tier }
                } else {
                    AuthDecision::ApprovalRequired {
                        tier,
                        justification_required: needs_justification,
                    }
                }
            }
            RiskTier::Critical => {
                if context.approval_granted && context.manager_approval {
                    AuthDecision::Allowed { tier }
                } else {
                    AuthDecision::ApprovalRequired {
                        tier,
                        justification_required: false,
                    }
                }
            }
        }
    }

    fn decision_record(
        &self,
        intent: &str,
        context: &RequestContext,
        decision: &AuthDecision,
    ) -> AuditRecord {
        let roles: Vec<serde_json::Value> = context
            .roles
            .iter()
            .map(|r| serde_json::Value::from(r.as_str()))
            .collect();

        let mut record = AuditRecord::new(context, intent, decision.tier(), decision.audit_outcome())
            .with_detail("event", "authorization")
            .with_detail("roles", roles)
            .with_detail("approval_granted", context.approval_granted)
            .with_detail("manager_approval", context.manager_approval);

        if let Some(approver) = &context.approver_id {
            record = record.with_detail("approver_id", approver.as_str());
        }
        match decision {
            AuthDecision::Denied {
                reason, message, ..
            } => record
                .with_detail("reason", reason.as_str())
                .with_detail("message", message.as_str()),
            AuthDecision::ApprovalRequired {
                justification_required,
                ..
            } => record.with_detail("justification_required", *justification_required),
            AuthDecision::Allowed { .. } => record,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;

    fn gate_with(config: AuthorizationConfig) -> (AuthorizationGate, Arc<MemoryAuditSink>) {
        let mut policies = PolicyRegistry::new();
        policies
            .register("ping", Vec::<String>::new(), RiskTier::Low, false)
            .unwrap();
        policies
            .register("ad.user.lookup", ["it_helpdesk", "viewer"], RiskTier::Low, false)
            .unwrap();
        policies
            .register("ad.password.reset", ["it_helpdesk"], RiskTier::Medium, true)
            .unwrap();
        policies
            .register("graph.group.list", ["it_admin"], RiskTier::Medium, false)
            .unwrap();
        policies
            .register("ad.laps.retrieve", ["it_admin"], RiskTier::High, true)
            .unwrap();
        policies
            .register("device.wipe", ["admin"], RiskTier::Critical, true)
            .unwrap();

        let sink = Arc::new(MemoryAuditSink::new());
        let gate = AuthorizationGate::with_config(
            Arc::new(policies),
            AuditEmitter::new(sink.clone()),
            config,
        );
        (gate, sink)
    }

    fn gate() -> (AuthorizationGate, Arc<MemoryAuditSink>) {
        gate_with(AuthorizationConfig::default())
    }

    #[test]
    fn low_tier_allowed_with_no_roles() {
        let (gate, _) = gate();
        let ctx = RequestContext::new("anon", "c1");
        assert_eq!(
            gate.authorize("ping", &ctx),
            AuthDecision::Allowed {
                tier: RiskTier::Low
            }
        );
    }

    #[test]
    fn unknown_intent_is_denied_by_default() {
        let (gate, sink) = gate();
        let ctx = RequestContext::new("alice", "c1").with_roles(["it_admin"]);
        let decision = gate.authorize("payroll.export", &ctx);

        assert!(matches!(
            decision,
            AuthDecision::Denied {
                reason: DenialReason::PolicyNotFound,
                tier: None,
                ..
            }
        ));
        let records = sink.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Denied);
        assert_eq!(records[0].detail_str("reason"), Some("policy_not_found"));
    }

    #[test]
    fn missing_role_is_denied() {
        let (gate, _) = gate();
        let ctx = RequestContext::new("bob", "c1").with_roles(["viewer"]);
        let decision = gate.authorize("ad.password.reset", &ctx);
        assert!(matches!(
            decision,
            AuthDecision::Denied {
                reason: DenialReason::MissingRole,
                ..
            }
        ));

        let err = decision.into_result("ad.password.reset", &ctx).unwrap_err();
        assert!(matches!(err, KernelError::PermissionDenied { .. }));
    }

    #[test]
    fn medium_without_approval_flag_needed_is_allowed() {
        let (gate, _) = gate();
        let ctx = RequestContext::new("carol", "c1").with_roles(["it_admin"]);
        assert!(gate.authorize("graph.group.list", &ctx).is_allowed());
    }

    #[test]
    fn medium_with_approval_required_needs_grant() {
        let (gate, _) = gate();
        let ctx = RequestContext::new("dave", "c1").with_roles(["it_helpdesk"]);

        assert_eq!(
            gate.authorize("ad.password.reset", &ctx),
            AuthDecision::ApprovalRequired {
                tier: RiskTier::Medium,
                justification_required: false
            }
        );

        let approved = ctx.with_approval(None);
        assert!(gate.authorize("ad.password.reset", &approved).is_allowed());
    }

    #[test]
    fn high_tier_requires_justification_when_configured() {
        let (gate, _) = gate_with(AuthorizationConfig {
            require_justification_for_high: true,
        });
        let ctx = RequestContext::new("erin", "c1")
            .with_roles(["it_admin"])
            .with_approval(None);

        assert_eq!(
            gate.authorize("ad.laps.retrieve", &ctx),
            AuthDecision::ApprovalRequired {
                tier: RiskTier::High,
                justification_required: true
            }
        );

        let justified = ctx.with_approval(Some("INC0042 local admin recovery".into()));
        assert!(gate.authorize("ad.laps.retrieve", &justified).is_allowed());
    }

    #[test]
    fn critical_needs_manager_approval_regardless_of_grant() {
        let (gate, sink) = gate();
        let ctx = RequestContext::new("frank", "c1")
            .with_roles(["admin"])
            .with_approval(Some("stolen laptop".into()));

        let decision = gate.authorize("device.wipe", &ctx);
        assert_eq!(
            decision,
            AuthDecision::ApprovalRequired {
                tier: RiskTier::Critical,
                justification_required: false
            }
        );

        let signed_off = ctx.with_manager_approval("manager-1");
        assert!(gate.authorize("device.wipe", &signed_off).is_allowed());

        let manager_only = RequestContext::new("frank", "c2")
            .with_roles(["admin"])
            .with_manager_approval("manager-1");
        assert!(!gate.authorize("device.wipe", &manager_only).is_allowed());

        let outcomes: Vec<AuditOutcome> = sink.drain().into_iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AuditOutcome::ApprovalRequired,
                AuditOutcome::Success,
                AuditOutcome::ApprovalRequired
            ]
        );
    }

    #[test]
    fn every_decision_emits_exactly_one_record() {
        let (gate, sink) = gate();
        let ctx = RequestContext::new("gina", "c1").with_roles(["viewer"]);

        gate.authorize("ping", &ctx);
        gate.authorize("ad.user.lookup", &ctx);
        gate.authorize("ad.password.reset", &ctx);
        gate.authorize("nope", &ctx);

        assert_eq!(sink.len(), 4);
    }

    #[test]
    fn risk_tier_lookup_does_not_audit() {
        let (gate, sink) = gate();
        assert_eq!(gate.risk_tier("device.wipe"), Some(RiskTier::Critical));
        assert_eq!(gate.risk_tier("nope"), None);
        assert!(sink.is_empty());
    }
}
