//! Callee programs and the loaders that instantiate them
//!
//! A callee is an external executable unit with declared input and output
//! parameters exchanged as JSON. Loading one is expensive, which is why
//! instances live in the handle registry rather than being created per call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::cancel::CancelToken;
use super::error::Result;
use super::resolver::CanonicalLocation;

/// How a callee parameter is fed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParameterKind {
    /// Table-shaped JSON (object or array)
    Table,
    /// Any JSON value
    FlowVariable,
}

impl ParameterKind {
    /// Check that `value` has the shape this kind requires.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterKind::Table => value.is_object() || value.is_array(),
            ParameterKind::FlowVariable => true,
        }
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKind::Table => write!(f, "table"),
            ParameterKind::FlowVariable => write!(f, "flow-variable"),
        }
    }
}

/// Declaration of a single parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter kind
    pub kind: ParameterKind,
    /// Value used when the caller does not bind the parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterSpec {
    /// Parameter of the given kind with no default
    pub fn new(kind: ParameterKind) -> Self {
        Self {
            kind,
            default: None,
            description: None,
        }
    }

    /// Attach a default value
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Declared inputs and outputs of a callee
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalleeSignature {
    /// Input parameters by name
    #[serde(default)]
    pub inputs: BTreeMap<String, ParameterSpec>,
    /// Output parameters by name
    #[serde(default)]
    pub outputs: BTreeMap<String, ParameterSpec>,
}

impl CalleeSignature {
    /// Output parameter names in ascending order
    pub fn output_names(&self) -> Vec<String> {
        self.outputs.keys().cloned().collect()
    }
}

/// Outcome of running a callee to completion (or not)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionState {
    /// Ran successfully
    Executed,
    /// Still running (timed out while waiting)
    Running,
    /// Not executed: a step failed or the run was cancelled
    Idle,
}

/// Severity of a step message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    /// Failed step
    Error,
    /// Step completed with a warning
    Warning,
}

/// Message reported by one internal step of a callee run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMessage {
    /// Step that produced the message
    pub step: String,
    /// Severity
    pub severity: Severity,
    /// Message text
    pub text: String,
}

impl StepMessage {
    /// Error message for `step`
    pub fn error(step: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            severity: Severity::Error,
            text: text.into(),
        }
    }

    /// Warning message for `step`
    pub fn warning(step: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            severity: Severity::Warning,
            text: text.into(),
        }
    }
}

/// A loaded callee instance.
///
/// Instances are only touched by whoever holds the owning handle's lock, so
/// implementations need `Send` but not `Sync`.
pub trait Callee: Send {
    /// Declared parameters
    fn signature(&self) -> CalleeSignature;

    /// Store an input value for the next run.
    ///
    /// Fails with [`super::error::CallError::InvalidParameter`] on a name or
    /// type mismatch.
    fn set_input(&mut self, name: &str, value: Value) -> Result<()>;

    /// Run to completion, blocking the calling thread.
    fn execute(&mut self, cancel: &CancelToken) -> ExecutionState;

    /// Outputs populated by the last run
    fn outputs(&self) -> BTreeMap<String, Value>;

    /// Step messages from the last run
    fn messages(&self) -> Vec<StepMessage>;

    /// Generic summary of the last run
    fn summary(&self) -> String;

    /// Stop any still-running internal execution.
    fn cancel(&mut self) {}

    /// Free resources held by the instance. Called exactly once.
    fn dispose(&mut self) {}
}

/// Instantiates callees from their canonical location
pub trait CalleeLoader: Send + Sync {
    /// Load the callee at `location`
    fn load(&self, location: &CanonicalLocation) -> Result<Box<dyn Callee>>;
}

impl<F> CalleeLoader for F
where
    F: Fn(&CanonicalLocation) -> Result<Box<dyn Callee>> + Send + Sync,
{
    fn load(&self, location: &CanonicalLocation) -> Result<Box<dyn Callee>> {
        self(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_kind_requires_structure() {
        assert!(ParameterKind::Table.accepts(&json!({"rows": []})));
        assert!(ParameterKind::Table.accepts(&json!([1, 2])));
        assert!(!ParameterKind::Table.accepts(&json!(3)));
        assert!(ParameterKind::FlowVariable.accepts(&json!(true)));
    }

    #[test]
    fn test_signature_parses_kebab_case() {
        let signature: CalleeSignature = serde_json::from_value(json!({
            "inputs": {
                "b": {"kind": "flow-variable"},
                "a": {"kind": "table", "default": {}}
            },
            "outputs": {"z": {"kind": "table"}, "result": {"kind": "flow-variable"}}
        }))
        .unwrap();

        assert_eq!(signature.inputs["a"].default, Some(json!({})));
        assert_eq!(signature.output_names(), vec!["result", "z"]);
    }
}
