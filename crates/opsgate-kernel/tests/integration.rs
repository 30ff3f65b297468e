//! Integration tests for the opsgate-kernel crate.
//!
//! These tests exercise the policy table, authorization gate, audit sinks,
//! capability registry, and intent router as one request path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use opsgate_kernel::{
    AuditEmitter, AuditOutcome, AuthorizationConfig, AuthorizationGate, Capability,
    CapabilityError, ErrorKind, IntentRouter, IntentSpec, KernelConfig, KernelError,
    MemoryAuditSink, Params, PolicyRegistry, RequestContext, RiskTier,
};

// ═══════════════════════════════════════════════════════════════════════
//  Fixtures
// ═══════════════════════════════════════════════════════════════════════

/// Records every call; optionally sleeps to expose overlap.
struct Spy {
    name: &'static str,
    intents: Vec<IntentSpec>,
    calls: AtomicU32,
    in_flight: AtomicU32,
    peak: AtomicU32,
    delay: Duration,
}

impl Spy {
    fn new(name: &'static str, intents: Vec<IntentSpec>) -> Arc<Self> {
        Self::slow(name, intents, Duration::ZERO)
    }

    fn slow(name: &'static str, intents: Vec<IntentSpec>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            intents,
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            delay,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for Spy {
    fn name(&self) -> &str {
        self.name
    }

    fn intents(&self) -> Vec<IntentSpec> {
        self.intents.clone()
    }

    async fn execute(
        &self,
        intent: &str,
        _params: &Params,
        context: &RequestContext,
    ) -> Result<serde_json::Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "intent": intent, "actor": context.actor }))
    }
}

const CATALOGUE: &str = r#"
[[policies]]
pattern = "ping"
risk_tier = "low"

[[policies]]
pattern = "ad.user.lookup"
required_roles = ["it_helpdesk", "it_admin"]
risk_tier = "low"

[[policies]]
pattern = "ad.password.reset"
required_roles = ["it_helpdesk", "it_admin"]
risk_tier = "high"
approval_required = true

[[policies]]
pattern = "device.*"
required_roles = ["it_admin"]
risk_tier = "medium"

[[policies]]
pattern = "device.wipe"
required_roles = ["it_admin", "security_admin"]
risk_tier = "critical"
approval_required = true
"#;

fn kernel_config() -> KernelConfig {
    toml::from_str(CATALOGUE).unwrap()
}

fn build(config: AuthorizationConfig) -> (IntentRouter, Arc<MemoryAuditSink>) {
    let policies = PolicyRegistry::from_config(&kernel_config().policies).unwrap();
    let sink = Arc::new(MemoryAuditSink::new());
    let gate = AuthorizationGate::with_config(
        Arc::new(policies),
        AuditEmitter::new(sink.clone()),
        config,
    );
    (IntentRouter::new(gate), sink)
}

// ═══════════════════════════════════════════════════════════════════════
//  Request path
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn low_risk_ping_without_roles_succeeds() {
    let (router, sink) = build(AuthorizationConfig::default());
    let spy = Spy::new("health", vec![IntentSpec::new("ping")]);
    router.register_capability(spy.clone(), None).unwrap();

    let response = router
        .route("ping", &Params::new(), &RequestContext::new("anon", "corr-ping"))
        .await;

    assert!(response.success, "ping failed: {:?}", response.error);
    assert!(response.error.is_none());
    assert_eq!(response.capability.as_deref(), Some("health"));
    assert_eq!(spy.calls(), 1);

    let records = sink.drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Success);
    assert_eq!(records[0].risk_tier, Some(RiskTier::Low));
    assert_eq!(records[0].correlation_id, "corr-ping");
}

#[tokio::test]
async fn critical_wipe_without_approval_is_held() {
    let (router, sink) = build(AuthorizationConfig::default());
    let intune = Spy::new(
        "intune",
        vec![IntentSpec::new("device.wipe").required("device_id")],
    );
    router.register_capability(intune.clone(), None).unwrap();

    let ctx = RequestContext::new("alice", "corr-wipe").with_roles(["security_admin"]);
    let mut params = Params::new();
    params.insert("device_id".into(), serde_json::json!("LAPTOP-042"));

    let response = router.route("device.wipe", &params, &ctx).await;

    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ApprovalRequired);
    assert_eq!(error.details.unwrap()["risk_tier"], "critical");
    assert_eq!(intune.calls(), 0);

    let records = sink.drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::ApprovalRequired);
    assert_eq!(records[0].risk_tier, Some(RiskTier::Critical));
}

#[tokio::test]
async fn critical_needs_manager_sign_off_on_top_of_approval() {
    let (router, sink) = build(AuthorizationConfig::default());
    let intune = Spy::new("intune", vec![IntentSpec::new("device.wipe")]);
    router.register_capability(intune.clone(), None).unwrap();

    let approved = RequestContext::new("alice", "c")
        .with_roles(["it_admin"])
        .with_approval(Some("stolen laptop".into()));
    let response = router.route("device.wipe", &Params::new(), &approved).await;
    assert_eq!(response.error_kind(), Some(ErrorKind::ApprovalRequired));
    assert_eq!(intune.calls(), 0);

    let signed = approved.with_manager_approval("mgr-7");
    let response = router.route("device.wipe", &Params::new(), &signed).await;
    assert!(response.success);
    assert_eq!(intune.calls(), 1);

    let outcomes: Vec<_> = sink.drain().into_iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AuditOutcome::ApprovalRequired, AuditOutcome::Success]
    );
}

#[tokio::test]
async fn specific_policy_beats_namespace_wildcard() {
    let (router, _) = build(AuthorizationConfig::default());
    assert_eq!(router.gate().risk_tier("device.lock"), Some(RiskTier::Medium));
    assert_eq!(router.gate().risk_tier("device.wipe"), Some(RiskTier::Critical));
    assert_eq!(router.gate().risk_tier("hr.onboard"), None);
}

#[tokio::test]
async fn high_risk_justification_rule() {
    let (router, _) = build(AuthorizationConfig {
        require_justification_for_high: true,
    });
    let ad = Spy::new("active_directory", vec![IntentSpec::new("ad.password.reset")]);
    router.register_capability(ad.clone(), None).unwrap();

    let bare = RequestContext::new("bob", "c")
        .with_roles(["it_helpdesk"])
        .with_approval(None);
    let response = router.route("ad.password.reset", &Params::new(), &bare).await;
    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ApprovalRequired);
    assert_eq!(error.details.unwrap()["justification_required"], true);

    let justified = RequestContext::new("bob", "c")
        .with_roles(["it_helpdesk"])
        .with_approval(Some("INC0042".into()));
    assert!(
        router
            .route("ad.password.reset", &Params::new(), &justified)
            .await
            .success
    );
    assert_eq!(ad.calls(), 1);
}

#[tokio::test]
async fn no_policy_means_denied() {
    let (router, sink) = build(AuthorizationConfig::default());
    let hr = Spy::new("workday", vec![IntentSpec::new("hr.onboard")]);
    router.register_capability(hr.clone(), None).unwrap();

    let response = router
        .route(
            "hr.onboard",
            &Params::new(),
            &RequestContext::new("root", "c").with_roles(["it_admin"]),
        )
        .await;

    assert_eq!(response.error_kind(), Some(ErrorKind::PermissionDenied));
    assert_eq!(hr.calls(), 0);
    assert_eq!(sink.drain()[0].outcome, AuditOutcome::Denied);
}

// ═══════════════════════════════════════════════════════════════════════
//  Registration and concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn duplicate_intent_across_capabilities_is_rejected() {
    let (router, _) = build(AuthorizationConfig::default());
    router
        .register_capability(Spy::new("intune", vec![IntentSpec::new("device.lock")]), None)
        .unwrap();

    let err = router
        .register_capability(Spy::new("jamf", vec![IntentSpec::new("device.lock")]), None)
        .unwrap_err();
    assert!(matches!(err, KernelError::DuplicateIntent { .. }));
    assert_eq!(router.resolve("device.lock").unwrap().name(), "intune");
}

#[tokio::test]
async fn distinct_intents_run_in_parallel() {
    let (router, _) = build(AuthorizationConfig::default());
    let ad = Spy::slow(
        "active_directory",
        vec![IntentSpec::new("ping"), IntentSpec::new("ad.user.lookup")],
        Duration::from_millis(100),
    );
    router.register_capability(ad.clone(), None).unwrap();
    let router = Arc::new(router);

    let ctx = RequestContext::new("carol", "c").with_roles(["it_helpdesk"]);
    let a = {
        let router = Arc::clone(&router);
        let ctx = ctx.clone();
        tokio::spawn(async move { router.route("ping", &Params::new(), &ctx).await })
    };
    let b = {
        let router = Arc::clone(&router);
        let ctx = ctx.clone();
        tokio::spawn(async move { router.route("ad.user.lookup", &Params::new(), &ctx).await })
    };

    assert!(a.await.unwrap().success);
    assert!(b.await.unwrap().success);
    assert_eq!(ad.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn per_capability_limit_serializes_calls() {
    let (router, _) = build(AuthorizationConfig::default());
    let ad = Spy::slow(
        "active_directory",
        vec![IntentSpec::new("ping"), IntentSpec::new("ad.user.lookup")],
        Duration::from_millis(50),
    );
    router.register_capability(ad.clone(), Some(1)).unwrap();
    let router = Arc::new(router);

    let ctx = RequestContext::new("carol", "c").with_roles(["it_admin"]);
    let mut handles = Vec::new();
    for intent in ["ping", "ad.user.lookup", "ping"] {
        let router = Arc::clone(&router);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            router.route(intent, &Params::new(), &ctx).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    assert_eq!(ad.calls(), 3);
    assert_eq!(ad.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn buffered_audit_emitter_delivers_after_flush() {
    let policies = PolicyRegistry::from_config(&kernel_config().policies).unwrap();
    let sink = Arc::new(MemoryAuditSink::new());
    let emitter = AuditEmitter::buffered(sink.clone()).unwrap();
    let router = IntentRouter::new(AuthorizationGate::new(Arc::new(policies), emitter.clone()));
    router
        .register_capability(Spy::new("health", vec![IntentSpec::new("ping")]), None)
        .unwrap();

    for i in 0..5 {
        let ctx = RequestContext::new("anon", format!("corr-{i}"));
        assert!(router.route("ping", &Params::new(), &ctx).await.success);
    }
    emitter.flush().await;

    assert_eq!(sink.len(), 5);
}
