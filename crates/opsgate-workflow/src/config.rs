//! Engine configuration.
//!
//! One file (TOML, or JSON when the extension is `.json`) describes the
//! whole engine: the kernel's policy catalogue and capability switches at the
//! top level, plus `[scheduler]`, `[confirmation]`, `[prompts]` and
//! `[logging]` tables.  A handful of `OPSGATE_*` environment variables
//! override the file.
//!
//! ```toml
//! [scheduler]
//! worker_pool_size = 8
//!
//! [capabilities.intune]
//! max_concurrency = 2
//!
//! [[policies]]
//! pattern = "device.wipe"
//! required_roles = ["it_admin"]
//! risk_tier = "critical"
//! approval_required = true
//! ```

use std::path::Path;
use std::time::Duration;

use opsgate_kernel::{KernelConfig, PolicyRegistry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, WorkflowError};
use crate::logging::{LogFormat, LoggingConfig};
use crate::prompt::PromptTemplates;
use crate::scheduler::SchedulerConfig;

/// Prefix of every recognized environment override.
pub const ENV_PREFIX: &str = "OPSGATE_";

/// Confirmation checkpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// How long an approver has to answer before the request counts as
    /// denied.
    pub timeout_ms: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self { timeout_ms: 300_000 }
    }
}

impl ConfirmationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub kernel: KernelConfig,
    pub scheduler: SchedulerConfig,
    pub confirmation: ConfirmationConfig,
    pub prompts: PromptTemplates,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.  Environment overrides are not
    /// applied.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, apply `OPSGATE_*` overrides, and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        config.apply_env()?;
        config.validate()?;

        info!(
            path = %path.display(),
            policies = config.kernel.policies.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars().filter(|(key, _)| key.starts_with(ENV_PREFIX)))
    }

    /// Apply `OPSGATE_*` style overrides from `vars`.  Unknown keys are
    /// ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "OPSGATE_WORKER_POOL_SIZE" => {
                    self.scheduler.worker_pool_size = parse_number(key, value)?;
                }
                "OPSGATE_TASK_TIMEOUT_MS" => {
                    self.scheduler.task_timeout_ms = parse_number(key, value)?;
                }
                "OPSGATE_MAX_RETRIES" => {
                    self.scheduler.max_retries = parse_number(key, value)?;
                }
                "OPSGATE_CONFIRMATION_TIMEOUT_MS" => {
                    self.confirmation.timeout_ms = parse_number(key, value)?;
                }
                "OPSGATE_LOG_LEVEL" => self.logging.level = value.to_string(),
                "OPSGATE_LOG_FORMAT" => self.logging.format = value.parse::<LogFormat>()?,
                _ => continue,
            }
            debug!(key, "configuration override applied");
        }
        Ok(())
    }

    /// Reject out-of-range values and malformed policies.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        if self.confirmation.timeout_ms == 0 {
            return Err(WorkflowError::config("confirmation.timeout_ms must be positive"));
        }
        self.prompts.validate()?;
        for (name, toggle) in &self.kernel.capabilities {
            if toggle.max_concurrency == Some(0) {
                return Err(WorkflowError::config(format!(
                    "capabilities.{name}.max_concurrency must be at least 1"
                )));
            }
        }
        PolicyRegistry::from_config(&self.kernel.policies)?;
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| WorkflowError::config(format!("{key}=`{value}`: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
