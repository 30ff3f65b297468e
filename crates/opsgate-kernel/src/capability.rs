//! Capability interface.
//!
//! A capability is an external collaborator (directory service, ticketing
//! system, device-management backend, ...) that performs the actual side
//! effect behind one or more intents.  The kernel only ever talks to it
//! through [`Capability::execute`].
//!
//! Each capability declares, per intent, which input fields it expects via
//! [`IntentSpec`].  The router checks that every *required* field is present
//! before dispatch; validating what the fields contain is the capability's
//! job, reported through [`CapabilityError::InvalidInput`].
//!
//! Implementations are invoked concurrently across tasks and must not rely
//! on the router to serialize calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::error::CapabilityError;

/// Intent parameters: a JSON object.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// One declared input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// An intent served by a capability, with its input schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentSpec {
    pub intent: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl IntentSpec {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn required(self, name: impl Into<String>) -> Self {
        self.field(FieldSpec::required(name))
    }

    pub fn optional(self, name: impl Into<String>) -> Self {
        self.field(FieldSpec::optional(name))
    }

    /// Required fields absent from `params` (a JSON `null` counts as absent).
    pub fn missing_fields(&self, params: &Params) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .filter(|f| params.get(&f.name).is_none_or(serde_json::Value::is_null))
            .map(|f| f.name.clone())
            .collect()
    }
}

/// The uniform contract every external collaborator implements.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique capability name (e.g. `active_directory`, `intune`).  Used for
    /// configuration switches, duplicate-intent diagnostics, and responses.
    fn name(&self) -> &str;

    /// Intents this capability serves, with their input schemas.
    fn intents(&self) -> Vec<IntentSpec>;

    /// Perform `intent` with `params` on behalf of `context`.
    async fn execute(
        &self,
        intent: &str,
        params: &Params,
        context: &RequestContext,
    ) -> std::result::Result<serde_json::Value, CapabilityError>;
}
