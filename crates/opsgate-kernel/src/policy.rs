//! Policy registry.
//!
//! Maps intents to the roles allowed to invoke them, their risk tier, and
//! whether an explicit approval is required.  Policies are loaded once at
//! startup and never change afterwards; the registry is shared behind an
//! `Arc` by the authorization gate.
//!
//! # Pattern syntax
//!
//! | Pattern            | Matches                                        |
//! |--------------------|------------------------------------------------|
//! | `device.wipe`      | exactly `device.wipe`                          |
//! | `device.*`         | `device.wipe`, `device.sync.now`; not `device` |
//! | `*`                | every intent                                   |
//!
//! # Resolution order
//!
//! 1. Exact match.
//! 2. Longest namespace prefix.
//! 3. The catch-all `*`.
//!
//! No match is a [`KernelError::PolicyNotFound`], which the gate turns into
//! a denial.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::error::{KernelError, Result};

/// Accepted shapes: `*`, `a.b.c`, `a.b.*`.
const PATTERN_SYNTAX: &str = r"^(\*|[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*(\.\*)?)$";

static PATTERN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PATTERN_SYNTAX).expect("policy pattern syntax must compile"));

// ---------------------------------------------------------------------------
// Risk tier
// ---------------------------------------------------------------------------

/// How dangerous an operation is.  Ordered from least to most strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(KernelError::config(format!("unrecognized risk tier `{other}`"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// A single policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Exact intent, `namespace.*` prefix, or `*`.
    pub pattern: String,
    /// Roles allowed to invoke matching intents (any-of).  Empty means any
    /// actor may invoke them.
    pub required_roles: BTreeSet<String>,
    /// Risk tier of matching intents.
    pub risk_tier: RiskTier,
    /// Whether `medium`/`high` intents need `approval_granted` in context.
    pub approval_required: bool,
}

impl Policy {
    /// Whether any of `roles` satisfies this policy.
    pub fn admits(&self, roles: &BTreeSet<String>) -> bool {
        self.required_roles.is_empty() || !self.required_roles.is_disjoint(roles)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable-after-startup lookup table from intent to [`Policy`].
#[derive(Debug, Default, Clone)]
pub struct PolicyRegistry {
    exact: HashMap<String, Policy>,
    /// Prefix policies keyed by namespace (without the trailing `.*`).
    /// The catch-all `*` is stored under the empty key.
    prefixes: HashMap<String, Policy>,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration entries, failing on the first
    /// malformed one.
    pub fn from_config(entries: &[PolicyConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for entry in entries {
            let tier: RiskTier = entry.risk_tier.parse()?;
            registry.register(
                entry.pattern.clone(),
                entry.required_roles.iter().cloned(),
                tier,
                entry.approval_required,
            )?;
        }
        tracing::info!(policies = registry.len(), "policy registry loaded");
        Ok(registry)
    }

    /// Register a policy.
    ///
    /// Fails with [`KernelError::Configuration`] if the pattern is empty,
    /// syntactically invalid, or already registered.
    pub fn register<I, R>(
        &mut self,
        intent_pattern: impl Into<String>,
        required_roles: I,
        risk_tier: RiskTier,
        approval_required: bool,
    ) -> Result<()>
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        let pattern = intent_pattern.into().trim().to_string();
        if pattern.is_empty() {
            return Err(KernelError::config("policy pattern must not be empty"));
        }
        if !PATTERN_REGEX.is_match(&pattern) {
            return Err(KernelError::config(format!(
                "invalid policy pattern `{pattern}`"
            )));
        }

        let policy = Policy {
            pattern: pattern.clone(),
            required_roles: required_roles.into_iter().map(Into::into).collect(),
            risk_tier,
            approval_required,
        };

        let (table, key) = match prefix_key(&pattern) {
            Some(namespace) => (&mut self.prefixes, namespace.to_string()),
            None => (&mut self.exact, pattern.clone()),
        };
        if table.contains_key(&key) {
            return Err(KernelError::config(format!(
                "duplicate policy for pattern `{pattern}`"
            )));
        }

        tracing::debug!(
            pattern = %pattern,
            tier = %risk_tier,
            approval_required,
            "policy registered"
        );
        table.insert(key, policy);
        Ok(())
    }

    /// Return the most specific policy matching `intent`.
    pub fn resolve(&self, intent: &str) -> Result<&Policy> {
        if let Some(policy) = self.exact.get(intent) {
            return Ok(policy);
        }

        // Walk the enclosing namespaces from longest to shortest: `a.b.c`
        // tries `a.b.*`, `a.*`, then `*`.  A prefix pattern never matches its
        // own root, so `device.*` does not cover the bare intent `device`.
        let mut rest = intent;
        while let Some(idx) = rest.rfind('.') {
            rest = &rest[..idx];
            if let Some(policy) = self.prefixes.get(rest) {
                return Ok(policy);
            }
        }
        if let Some(policy) = self.prefixes.get("") {
            return Ok(policy);
        }

        Err(KernelError::PolicyNotFound {
            intent: intent.to_string(),
        })
    }

    /// Snapshot of every registered policy, sorted by pattern.
    pub fn list(&self) -> Vec<Policy> {
        let mut all: Vec<Policy> = self
            .exact
            .values()
            .chain(self.prefixes.values())
            .cloned()
            .collect();
        all.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        all
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `Some(namespace)` for prefix patterns, `None` for exact ones.
fn prefix_key(pattern: &str) -> Option<&str> {
    if pattern == "*" {
        Some("")
    } else {
        pattern.strip_suffix(".*")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
