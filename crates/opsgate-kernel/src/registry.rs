//! Capability registry.
//!
//! Binds every intent to exactly one [`Capability`].  Registration is
//! all-or-nothing: if any intent in a batch is already bound (or appears
//! twice in the batch), nothing from the batch is kept and the call fails
//! with [`KernelError::DuplicateIntent`].  A silent override is never
//! possible.
//!
//! Internally the registry is backed by [`DashMap`], so lookups from many
//! concurrent dispatches never contend on a global lock.
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use async_trait::async_trait;
//! # use opsgate_kernel::{Capability, CapabilityError, CapabilityRegistry, IntentSpec, Params, RequestContext};
//! struct Ping;
//!
//! #[async_trait]
//! impl Capability for Ping {
//!     fn name(&self) -> &str { "ping" }
//!     fn intents(&self) -> Vec<IntentSpec> { vec![IntentSpec::new("ping")] }
//!     async fn execute(&self, _: &str, _: &Params, _: &RequestContext)
//!         -> Result<serde_json::Value, CapabilityError> {
//!         Ok(serde_json::json!("pong"))
//!     }
//! }
//!
//! let registry = CapabilityRegistry::new();
//! let ping: Arc<dyn Capability> = Arc::new(Ping);
//! registry.register(Arc::clone(&ping), ping.intents()).unwrap();
//! assert!(registry.register(Arc::clone(&ping), ping.intents()).is_err());
//! assert_eq!(registry.available_intents(), vec!["ping".to_string()]);
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Semaphore;

use crate::capability::{Capability, IntentSpec};
use crate::error::{KernelError, Result};

/// A resolved intent binding.
#[derive(Clone)]
pub struct Binding {
    pub capability: Arc<dyn Capability>,
    pub spec: IntentSpec,
    /// Shared by every intent of the capability when a concurrency cap is
    /// configured.
    pub limiter: Option<Arc<Semaphore>>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("capability", &self.capability.name())
            .field("spec", &self.spec)
            .field("limited", &self.limiter.is_some())
            .finish()
    }
}

/// Concurrent intent → capability table.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    bindings: Arc<DashMap<String, Binding>>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `intents` to `capability` with no concurrency cap.
    pub fn register(
        &self,
        capability: Arc<dyn Capability>,
        intents: impl IntoIterator<Item = IntentSpec>,
    ) -> Result<()> {
        self.register_with_limit(capability, intents, None)
    }

    /// Bind `intents` to `capability`, capping concurrent invocations across
    /// all of them at `max_concurrency`.
    pub fn register_with_limit(
        &self,
        capability: Arc<dyn Capability>,
        intents: impl IntoIterator<Item = IntentSpec>,
        max_concurrency: Option<usize>,
    ) -> Result<()> {
        let name = capability.name().to_string();
        let specs: Vec<IntentSpec> = intents.into_iter().collect();

        let mut seen = HashSet::new();
        for spec in &specs {
            if spec.intent.trim().is_empty() {
                return Err(KernelError::config(format!(
                    "capability `{name}` declares an empty intent"
                )));
            }
            if !seen.insert(spec.intent.as_str()) {
                return Err(KernelError::DuplicateIntent {
                    intent: spec.intent.clone(),
                    existing: name.clone(),
                    incoming: name.clone(),
                });
            }
        }

        let limiter = match max_concurrency {
            Some(0) => {
                return Err(KernelError::config(format!(
                    "capability `{name}` max_concurrency must be at least 1"
                )));
            }
            Some(n) => Some(Arc::new(Semaphore::new(n))),
            None => None,
        };

        let mut inserted: Vec<String> = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.bindings.entry(spec.intent.clone()) {
                Entry::Occupied(existing) => {
                    let err = KernelError::DuplicateIntent {
                        intent: spec.intent.clone(),
                        existing: existing.get().capability.name().to_string(),
                        incoming: name.clone(),
                    };
                    drop(existing);
                    for intent in &inserted {
                        self.bindings.remove(intent);
                    }
                    tracing::error!(error = %err, "capability registration rejected");
                    return Err(err);
                }
                Entry::Vacant(slot) => {
                    inserted.push(spec.intent.clone());
                    slot.insert(Binding {
                        capability: Arc::clone(&capability),
                        spec,
                        limiter: limiter.clone(),
                    });
                }
            }
        }

        tracing::info!(
            capability = %name,
            intents = inserted.len(),
            max_concurrency = ?max_concurrency,
            "capability registered"
        );
        Ok(())
    }

    /// Look up the binding for `intent`.
    pub fn get(&self, intent: &str) -> Result<Binding> {
        self.bindings
            .get(intent)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KernelError::NotFound {
                intent: intent.to_string(),
            })
    }

    /// Name of the capability bound to `intent`, if any.
    pub fn capability_for(&self, intent: &str) -> Option<String> {
        self.bindings
            .get(intent)
            .map(|entry| entry.capability.name().to_string())
    }

    /// Every bound intent, sorted.
    pub fn available_intents(&self) -> Vec<String> {
        let mut intents: Vec<String> = self.bindings.iter().map(|e| e.key().clone()).collect();
        intents.sort();
        intents
    }

    pub fn contains(&self, intent: &str) -> bool {
        self.bindings.contains_key(intent)
    }

    /// Number of bound intents.
    pub fn count(&self) -> usize {
        self.bindings.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
