//! Shared fixtures for integration tests
//!
//! `ScriptedCallee` is a deterministic in-memory callee: it declares inputs
//! `a` (table) and `b` (flow variable) and one output `result` that depends
//! only on `a`. A `b` value of `"fail"` makes the run fail with a step error.

#![allow(dead_code)]

use callflow::runtime::callee::{
    Callee, CalleeLoader, CalleeSignature, ExecutionState, ParameterKind, ParameterSpec,
    StepMessage,
};
use callflow::runtime::cancel::CancelToken;
use callflow::runtime::error::{CallError, Result};
use callflow::runtime::registry::HandleRegistry;
use callflow::runtime::resolver::CanonicalLocation;
use callflow::runtime::scheduler::ManualScheduler;
use callflow::{CallRuntime, RuntimeConfig};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Counters shared by every callee a loader produces
#[derive(Default)]
pub struct Tally {
    pub loads: AtomicUsize,
    pub disposals: AtomicUsize,
    pub executions: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub load_delay_ms: AtomicU64,
    pub exec_delay_ms: AtomicU64,
}

impl Tally {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

pub struct ScriptedCallee {
    tally: Arc<Tally>,
    inputs: BTreeMap<String, Value>,
    outputs: BTreeMap<String, Value>,
    messages: Vec<StepMessage>,
}

impl ScriptedCallee {
    pub fn signature() -> CalleeSignature {
        let mut signature = CalleeSignature::default();
        signature.inputs.insert(
            "a".into(),
            ParameterSpec::new(ParameterKind::Table).with_default(json!({})),
        );
        signature
            .inputs
            .insert("b".into(), ParameterSpec::new(ParameterKind::FlowVariable));
        signature
            .outputs
            .insert("result".into(), ParameterSpec::new(ParameterKind::FlowVariable));
        signature
    }
}

impl Callee for ScriptedCallee {
    fn signature(&self) -> CalleeSignature {
        Self::signature()
    }

    fn set_input(&mut self, name: &str, value: Value) -> Result<()> {
        if !Self::signature().inputs.contains_key(name) {
            return Err(CallError::invalid_parameter(name, "unknown input"));
        }
        self.inputs.insert(name.to_string(), value);
        Ok(())
    }

    fn execute(&mut self, _cancel: &CancelToken) -> ExecutionState {
        let now = self.tally.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.max_active.fetch_max(now, Ordering::SeqCst);
        self.tally.executions.fetch_add(1, Ordering::SeqCst);

        let delay = self.tally.exec_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        self.outputs.clear();
        self.messages.clear();
        let state = if self.inputs.get("b") == Some(&json!("fail")) {
            self.messages
                .push(StepMessage::error("Rule Engine", "rejected flag"));
            ExecutionState::Idle
        } else {
            let a = self.inputs.get("a").cloned().unwrap_or_else(|| json!({}));
            self.outputs
                .insert("result".into(), json!({ "source": a, "ok": true }));
            ExecutionState::Executed
        };

        self.tally.active.fetch_sub(1, Ordering::SeqCst);
        state
    }

    fn outputs(&self) -> BTreeMap<String, Value> {
        self.outputs.clone()
    }

    fn messages(&self) -> Vec<StepMessage> {
        self.messages.clone()
    }

    fn summary(&self) -> String {
        format!("{} step message(s)", self.messages.len())
    }

    fn dispose(&mut self) {
        self.tally.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loader producing `ScriptedCallee`s; locations named `broken*` fail to load
pub struct ScriptedLoader {
    pub tally: Arc<Tally>,
}

impl CalleeLoader for ScriptedLoader {
    fn load(&self, location: &CanonicalLocation) -> Result<Box<dyn Callee>> {
        self.tally.loads.fetch_add(1, Ordering::SeqCst);
        let delay = self.tally.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if location.display_name().starts_with("broken") {
            return Err(CallError::load(location, "cannot instantiate workflow"));
        }
        Ok(Box::new(ScriptedCallee {
            tally: self.tally.clone(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            messages: Vec::new(),
        }))
    }
}

/// Registry over scripted callees with a hand-driven cleanup timer
pub fn registry(config: RuntimeConfig) -> (HandleRegistry, Arc<Tally>, Arc<ManualScheduler>) {
    let tally = Arc::new(Tally::default());
    let scheduler = Arc::new(ManualScheduler::new());
    let registry = HandleRegistry::new(
        config,
        Arc::new(ScriptedLoader {
            tally: tally.clone(),
        }),
        scheduler.clone(),
    );
    (registry, tally, scheduler)
}

/// Runtime over scripted callees with a hand-driven cleanup timer
pub fn runtime(config: RuntimeConfig) -> (CallRuntime, Arc<Tally>, Arc<ManualScheduler>) {
    let tally = Arc::new(Tally::default());
    let scheduler = Arc::new(ManualScheduler::new());
    let runtime = CallRuntime::new(
        config,
        Arc::new(ScriptedLoader {
            tally: tally.clone(),
        }),
        scheduler.clone(),
    );
    (runtime, tally, scheduler)
}

/// Location that needs no directory on disk
pub fn location(name: &str) -> CanonicalLocation {
    CanonicalLocation::from_canonical(format!("/callflow-tests/{name}"))
}

/// Temporary workspace with one directory per name
pub fn workspace(names: &[&str]) -> TempDir {
    let temp = TempDir::new().unwrap();
    for name in names {
        std::fs::create_dir_all(temp.path().join(name)).unwrap();
    }
    temp
}
