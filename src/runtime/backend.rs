//! Invocation backends
//!
//! [`InvocationBackend`] is the capability set a row invoker drives:
//! set inputs, execute, read outputs, read the diagnostic, release. The local
//! implementation runs a cached callee in-process under its handle lease; a
//! remote implementation would provide the same trait over a transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use super::callee::{CalleeSignature, ExecutionState, Severity};
use super::cancel::CancelToken;
use super::error::{CallError, Result};
use super::registry::{HandleRegistry, Lease};
use super::resolver::CanonicalLocation;

/// Status reported by [`InvocationBackend::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationStatus {
    /// Completed successfully
    Executed,
    /// Did not finish
    Running,
    /// Not executed
    Idle,
}

impl From<ExecutionState> for InvocationStatus {
    fn from(state: ExecutionState) -> Self {
        match state {
            ExecutionState::Executed => InvocationStatus::Executed,
            ExecutionState::Running => InvocationStatus::Running,
            ExecutionState::Idle => InvocationStatus::Idle,
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationStatus::Executed => write!(f, "EXECUTED"),
            InvocationStatus::Running => write!(f, "RUNNING"),
            InvocationStatus::Idle => write!(f, "IDLE"),
        }
    }
}

/// Operations available on a held callee
pub trait InvocationBackend: Send {
    /// Canonical location of the callee
    fn location(&self) -> &CanonicalLocation;

    /// Declared parameters of the callee
    fn signature(&self) -> Result<CalleeSignature>;

    /// Store input values on the callee.
    fn set_inputs(&mut self, inputs: &BTreeMap<String, Value>) -> Result<()>;

    /// Run the callee to completion, blocking the calling thread.
    fn execute(&mut self, cancel: &CancelToken) -> Result<InvocationStatus>;

    /// Outputs populated by the last run; unpopulated ones are absent.
    fn outputs(&mut self) -> Result<BTreeMap<String, Value>>;

    /// Errors of failed steps, else warnings, else a summary of the last run.
    fn diagnostic(&mut self) -> Result<String>;

    /// Stop any leftover execution and give the handle back.
    fn release(self: Box<Self>) -> Result<()>;
}

/// In-process backend holding a registry lease
pub struct LocalBackend {
    location: CanonicalLocation,
    lease: Option<Lease>,
}

impl LocalBackend {
    /// Check out the handle for `location`, waiting for exclusive use.
    pub fn open(
        registry: &HandleRegistry,
        location: &CanonicalLocation,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let lease = registry.checkout(location, cancel)?;
        debug!(%location, "acquired workflow");
        Ok(Self {
            location: location.clone(),
            lease: Some(lease),
        })
    }

    fn lease(&self) -> Result<&Lease> {
        self.lease
            .as_ref()
            .ok_or_else(|| CallError::Execution("backend already released".into()))
    }

    fn release_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            // Best effort: the instance may already be gone if the lease is stale.
            let _ = lease.with_callee(|callee| {
                callee.cancel();
                Ok(())
            });
            lease.release();
            debug!(location = %self.location, "released workflow");
        }
    }
}

impl InvocationBackend for LocalBackend {
    fn location(&self) -> &CanonicalLocation {
        &self.location
    }

    fn signature(&self) -> Result<CalleeSignature> {
        self.lease()?.with_callee(|callee| Ok(callee.signature()))
    }

    fn set_inputs(&mut self, inputs: &BTreeMap<String, Value>) -> Result<()> {
        self.lease()?.with_callee(|callee| {
            let signature = callee.signature();
            for (name, value) in inputs {
                let spec = signature.inputs.get(name).ok_or_else(|| {
                    CallError::invalid_parameter(name, "no such input parameter")
                })?;
                if !spec.kind.accepts(value) {
                    return Err(CallError::invalid_parameter(
                        name,
                        format!("value is not valid for a {} parameter", spec.kind),
                    ));
                }
                callee.set_input(name, value.clone())?;
            }
            Ok(())
        })
    }

    fn execute(&mut self, cancel: &CancelToken) -> Result<InvocationStatus> {
        self.lease()?
            .with_callee(|callee| Ok(InvocationStatus::from(callee.execute(cancel))))
    }

    fn outputs(&mut self) -> Result<BTreeMap<String, Value>> {
        self.lease()?.with_callee(|callee| Ok(callee.outputs()))
    }

    fn diagnostic(&mut self) -> Result<String> {
        self.lease()?.with_callee(|callee| {
            let messages = callee.messages();
            let join = |severity: Severity| {
                messages
                    .iter()
                    .filter(|message| message.severity == severity)
                    .map(|message| format!("{}: {}", message.step, message.text))
                    .collect::<Vec<_>>()
                    .join("\n")
            };

            let errors = join(Severity::Error);
            if !errors.is_empty() {
                return Ok(errors);
            }
            let warnings = join(Severity::Warning);
            if !warnings.is_empty() {
                return Ok(warnings);
            }
            Ok(callee.summary())
        })
    }

    fn release(mut self: Box<Self>) -> Result<()> {
        self.release_lease();
        Ok(())
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        self.release_lease();
    }
}
