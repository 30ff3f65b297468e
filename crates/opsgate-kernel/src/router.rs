//! Intent router.
//!
//! Resolves an intent to its single registered [`Capability`], runs it
//! through the [`AuthorizationGate`], checks declared required parameters,
//! invokes the capability, and folds whatever happened into a [`Response`].
//!
//! | Stage | Failure surfaces as                               |
//! |-------|---------------------------------------------------|
//! | 1 | Capability lookup -> `NotFound`                       |
//! | 2 | Authorization -> `PermissionDenied` / `ApprovalRequired` |
//! | 3 | Required-field check -> `Validation`                  |
//! | 4 | Capability call -> `Capability` (transient or not) / `Validation` |
//!
//! Nothing past stage 2 runs unless the gate allowed the call, and a
//! capability that returns an error or panics never takes the caller down
//! with it.
//!
//! Distinct intents are never serialized against each other; the only
//! throttling is the optional per-capability cap configured at registration.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use crate::auth::AuthorizationGate;
use crate::capability::{Capability, IntentSpec, Params};
use crate::error::{CapabilityError, KernelError, Result};
use crate::registry::CapabilityRegistry;
use crate::response::{ErrorInfo, Response};
use crate::context::RequestContext;

/// Dispatches intents to capabilities behind the authorization gate.
///
/// Cheap to share: wrap in `Arc` and call [`IntentRouter::route`] from as
/// many tasks as needed.
#[derive(Clone)]
pub struct IntentRouter {
    registry: CapabilityRegistry,
    gate: AuthorizationGate,
}

impl IntentRouter {
    pub fn new(gate: AuthorizationGate) -> Self {
        Self {
            registry: CapabilityRegistry::new(),
            gate,
        }
    }

    /// Bind `intents` to `capability`.  Fails with
    /// [`KernelError::DuplicateIntent`] if any of them is already bound.
    pub fn register(
        &self,
        capability: Arc<dyn Capability>,
        intents: impl IntoIterator<Item = IntentSpec>,
    ) -> Result<()> {
        self.registry.register(capability, intents)
    }

    /// Bind every intent the capability declares, with an optional
    /// concurrency cap.
    pub fn register_capability(
        &self,
        capability: Arc<dyn Capability>,
        max_concurrency: Option<usize>,
    ) -> Result<()> {
        let intents = capability.intents();
        self.registry
            .register_with_limit(capability, intents, max_concurrency)
    }

    /// The capability bound to `intent`.
    pub fn resolve(&self, intent: &str) -> Result<Arc<dyn Capability>> {
        self.registry.get(intent).map(|b| b.capability)
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    pub fn available_intents(&self) -> Vec<String> {
        self.registry.available_intents()
    }

    /// Route one operation.  Never fails: every problem is reported inside
    /// the returned [`Response`].
    pub async fn route(
        &self,
        intent: &str,
        parameters: &Params,
        context: &RequestContext,
    ) -> Response {
        let started = Instant::now();
        let elapsed = || u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        // Stage 1: capability lookup.
        let binding = match self.registry.get(intent) {
            Ok(binding) => binding,
            Err(e) => {
                tracing::warn!(intent, actor = %context.actor, "no capability for intent");
                let info = ErrorInfo::from(&e).with_details(serde_json::json!({
                    "requested_intent": intent,
                    "available_intents": self.registry.available_intents(),
                }));
                return Response::failed(info, elapsed());
            }
        };
        let capability_name = binding.capability.name().to_string();

        // Stage 2: authorization.
        let decision = self.gate.authorize(intent, context);
        if let Err(e) = decision.into_result(intent, context) {
            return Response::failed(ErrorInfo::from(&e), elapsed()).with_capability(capability_name);
        }

        // Stage 3: declared required fields.
        let missing = binding.spec.missing_fields(parameters);
        if !missing.is_empty() {
            let err = KernelError::Validation {
                intent: intent.to_string(),
                missing,
            };
            tracing::debug!(intent, error = %err, "parameter validation failed");
            return Response::failed(ErrorInfo::from(&err), elapsed()).with_capability(capability_name);
        }

        // Stage 4: invoke, honoring the capability's concurrency cap.
        let _permit = match &binding.limiter {
            Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    let err = KernelError::Internal(format!("capability limiter closed: {e}"));
                    return Response::failed(ErrorInfo::from(&err), elapsed())
                        .with_capability(capability_name);
                }
            },
            None => None,
        };

        tracing::debug!(
            intent,
            capability = %capability_name,
            correlation_id = %context.correlation_id,
            "dispatching intent"
        );

        let outcome = AssertUnwindSafe(binding.capability.execute(intent, parameters, context))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(intent, capability = %capability_name, "capability panicked");
                Err(CapabilityError::permanent("capability panicked during execution"))
            }
        };

        match result {
            Ok(value) => {
                let latency = elapsed();
                tracing::info!(
                    intent,
                    capability = %capability_name,
                    latency_ms = latency,
                    "intent completed"
                );
                Response::ok(value, latency).with_capability(capability_name)
            }
            Err(source) => {
                let err = KernelError::Capability {
                    capability: capability_name.clone(),
                    source,
                };
                tracing::warn!(intent, error = %err, transient = err.is_transient(), "intent failed");
                Response::failed(ErrorInfo::from(&err), elapsed()).with_capability(capability_name)
            }
        }
    }
}

impl std::fmt::Debug for IntentRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentRouter")
            .field("intents", &self.registry.count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEmitter, AuditOutcome, MemoryAuditSink};
    use crate::policy::{PolicyRegistry, RiskTier};
    use crate::response::ErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Desk {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Capability for Desk {
        fn name(&self) -> &str {
            "desk"
        }

        fn intents(&self) -> Vec<IntentSpec> {
            vec![
                IntentSpec::new("ping"),
                IntentSpec::new("ticket.create").required("summary"),
                IntentSpec::new("ticket.flaky"),
                IntentSpec::new("ticket.bad_input"),
                IntentSpec::new("ticket.panic"),
            ]
        }

        async fn execute(
            &self,
            intent: &str,
            params: &Params,
            _context: &RequestContext,
        ) -> std::result::Result<serde_json::Value, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match intent {
                "ping" => Ok(serde_json::json!("pong")),
                "ticket.create" => Ok(serde_json::json!({ "number": "INC0001", "summary": params["summary"] })),
                "ticket.flaky" => Err(CapabilityError::transient("503 from upstream")),
                "ticket.bad_input" => Err(CapabilityError::invalid_input("summary too long")),
                _ => panic!("boom"),
            }
        }
    }

    fn router() -> (IntentRouter, Arc<Desk>, Arc<MemoryAuditSink>) {
        let mut policies = PolicyRegistry::new();
        policies
            .register("ping", Vec::<String>::new(), RiskTier::Low, false)
            .unwrap();
        policies
            .register("ticket.*", ["it_helpdesk"], RiskTier::Low, false)
            .unwrap();

        let sink = Arc::new(MemoryAuditSink::new());
        let gate = AuthorizationGate::new(Arc::new(policies), AuditEmitter::new(sink.clone()));
        let router = IntentRouter::new(gate);
        let desk = Arc::new(Desk {
            calls: AtomicU32::new(0),
        });
        router.register_capability(desk.clone(), None).unwrap();
        (router, desk, sink)
    }

    fn helpdesk() -> RequestContext {
        RequestContext::new("alice", "corr-1").with_roles(["it_helpdesk"])
    }

    #[tokio::test]
    async fn routes_to_capability() {
        let (router, _, sink) = router();
        let response = router
            .route("ping", &Params::new(), &RequestContext::new("anon", "c"))
            .await;

        assert!(response.success);
        assert_eq!(response.result, Some(serde_json::json!("pong")));
        assert_eq!(response.capability.as_deref(), Some("desk"));
        assert_eq!(sink.drain().len(), 1);
    }

    #[tokio::test]
    async fn unknown_intent_lists_available_ones() {
        let (router, _, sink) = router();
        let response = router.route("hr.fire", &Params::new(), &helpdesk()).await;

        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::NotFound);
        let details = error.details.unwrap();
        assert_eq!(details["requested_intent"], "hr.fire");
        assert!(details["available_intents"].as_array().unwrap().len() >= 5);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn denied_call_never_reaches_capability() {
        let (router, desk, sink) = router();
        let ctx = RequestContext::new("mallory", "c");
        let mut params = Params::new();
        params.insert("summary".into(), serde_json::json!("x"));

        let response = router.route("ticket.create", &params, &ctx).await;

        assert_eq!(response.error_kind(), Some(ErrorKind::PermissionDenied));
        assert_eq!(desk.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.drain()[0].outcome, AuditOutcome::Denied);
    }

    #[tokio::test]
    async fn missing_required_field_is_validation_error() {
        let (router, desk, _) = router();
        let response = router
            .route("ticket.create", &Params::new(), &helpdesk())
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(error.details.unwrap()["missing"][0], "summary");
        assert_eq!(desk.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn capability_errors_are_wrapped() {
        let (router, _, _) = router();

        let flaky = router.route("ticket.flaky", &Params::new(), &helpdesk()).await;
        assert_eq!(flaky.error_kind(), Some(ErrorKind::Capability));
        assert!(flaky.is_transient_failure());

        let bad = router
            .route("ticket.bad_input", &Params::new(), &helpdesk())
            .await;
        assert_eq!(bad.error_kind(), Some(ErrorKind::Validation));
        assert!(!bad.is_transient_failure());
    }

    #[tokio::test]
    async fn capability_panic_becomes_capability_error() {
        let (router, _, _) = router();
        let response = router.route("ticket.panic", &Params::new(), &helpdesk()).await;

        assert!(!response.success);
        assert_eq!(response.error_kind(), Some(ErrorKind::Capability));
        assert!(!response.is_transient_failure());
    }

    #[tokio::test]
    async fn resolve_unbound_is_not_found() {
        let (router, _, _) = router();
        assert!(matches!(
            router.resolve("nope"),
            Err(KernelError::NotFound { .. })
        ));
        assert_eq!(router.resolve("ping").unwrap().name(), "desk");
    }
}
