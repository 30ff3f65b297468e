//! Kernel configuration.
//!
//! Plain serde structs describing the policy catalogue, the capability
//! enable/disable switches, and authorization knobs.  Parsing files and
//! applying environment overrides is the embedding application's job; the
//! kernel only consumes an already-deserialized [`KernelConfig`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Everything the kernel needs at construction time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Policy catalogue, loaded into a [`crate::policy::PolicyRegistry`].
    pub policies: Vec<PolicyConfig>,
    /// Per-capability switches keyed by capability name.  Capabilities not
    /// listed here are enabled with no concurrency cap.
    pub capabilities: BTreeMap<String, CapabilityToggle>,
    pub authorization: AuthorizationConfig,
}

impl KernelConfig {
    /// The switch for `capability`, or the default (enabled, uncapped).
    pub fn capability(&self, capability: &str) -> CapabilityToggle {
        self.capabilities
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }
}

/// One policy entry as written in configuration.
///
/// The tier is kept as a string so that an unknown value surfaces as a
/// configuration error naming the offending entry rather than a generic
/// deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub pattern: String,
    #[serde(default)]
    pub required_roles: Vec<String>,
    pub risk_tier: String,
    #[serde(default)]
    pub approval_required: bool,
}

/// Enable switch and rate limit for a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityToggle {
    pub enabled: bool,
    /// Maximum concurrent invocations across all of the capability's
    /// intents.  `None` means unlimited.
    pub max_concurrency: Option<usize>,
}

impl Default for CapabilityToggle {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// When set, approved `high` tier operations also need a justification
    /// string in the request context.
    pub require_justification_for_high: bool,
}
