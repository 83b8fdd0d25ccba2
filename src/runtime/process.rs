//! Child-process callees described by a `workflow.json` manifest
//!
//! A workflow directory contains a manifest declaring the command to run and
//! its parameters:
//!
//! ```json
//! {
//!   "name": "score",
//!   "command": ["python3", "score.py"],
//!   "inputs":  {"model": {"kind": "table", "default": {}}, "flag": {"kind": "flow-variable"}},
//!   "outputs": {"result": {"kind": "flow-variable"}},
//!   "timeout_secs": 30
//! }
//! ```
//!
//! Each run spawns the command in the workflow directory, writes all inputs
//! as one JSON object to stdin and expects one JSON object of outputs on
//! stdout. Stderr lines starting with `warning:` become warnings; a non-zero
//! exit fails the run with the remaining stderr as the error message.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::callee::{
    Callee, CalleeLoader, CalleeSignature, ExecutionState, ParameterSpec, StepMessage,
};
use super::cancel::CancelToken;
use super::error::{CallError, Result};
use super::resolver::CanonicalLocation;

/// Manifest file name inside a workflow directory
pub const MANIFEST_FILE: &str = "workflow.json";

const WARNING_PREFIX: &str = "warning:";
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Parsed `workflow.json`
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowManifest {
    /// Display name; defaults to the directory name
    #[serde(default)]
    pub name: Option<String>,
    /// Program and arguments
    pub command: Vec<String>,
    /// Input parameters
    #[serde(default)]
    pub inputs: BTreeMap<String, ParameterSpec>,
    /// Output parameters
    #[serde(default)]
    pub outputs: BTreeMap<String, ParameterSpec>,
    /// How long `execute` waits before reporting the run as still running
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Loads [`ProcessCallee`]s from manifest directories
#[derive(Debug, Default, Clone)]
pub struct ManifestLoader;

impl ManifestLoader {
    /// Create a loader
    pub fn new() -> Self {
        Self
    }

    /// Read and validate the manifest at `location`
    pub fn read_manifest(location: &CanonicalLocation) -> Result<WorkflowManifest> {
        let path = location.path().join(MANIFEST_FILE);
        let data = std::fs::read(&path)
            .map_err(|err| CallError::load(location, format!("cannot read {}: {err}", path.display())))?;
        let manifest: WorkflowManifest = serde_json::from_slice(&data)
            .map_err(|err| CallError::load(location, format!("invalid {MANIFEST_FILE}: {err}")))?;

        if manifest.command.is_empty() {
            return Err(CallError::load(location, "manifest command is empty"));
        }
        for (name, spec) in &manifest.inputs {
            if let Some(default) = &spec.default {
                if !spec.kind.accepts(default) {
                    return Err(CallError::load(
                        location,
                        format!("default of input '{name}' is not valid for a {} parameter", spec.kind),
                    ));
                }
            }
        }
        Ok(manifest)
    }
}

impl CalleeLoader for ManifestLoader {
    fn load(&self, location: &CanonicalLocation) -> Result<Box<dyn Callee>> {
        let manifest = Self::read_manifest(location)?;
        Ok(Box::new(ProcessCallee::new(location, manifest)))
    }
}

type Capture = JoinHandle<std::io::Result<String>>;

struct RunningChild {
    child: Child,
    stdin: JoinHandle<()>,
    stdout: Capture,
    stderr: Capture,
    started: Instant,
}

#[derive(Default)]
struct RunRecord {
    outputs: BTreeMap<String, Value>,
    messages: Vec<StepMessage>,
    summary: String,
}

/// Callee executed as a child process per run
pub struct ProcessCallee {
    name: String,
    dir: PathBuf,
    manifest: WorkflowManifest,
    values: BTreeMap<String, Value>,
    running: Option<RunningChild>,
    last: RunRecord,
}

impl ProcessCallee {
    /// Build a callee for a validated manifest
    pub fn new(location: &CanonicalLocation, manifest: WorkflowManifest) -> Self {
        let name = manifest
            .name
            .clone()
            .unwrap_or_else(|| location.display_name());
        Self {
            name,
            dir: location.path().to_path_buf(),
            manifest,
            values: BTreeMap::new(),
            running: None,
            last: RunRecord::default(),
        }
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn payload(&self) -> Value {
        let mut payload = Map::new();
        for (name, spec) in &self.manifest.inputs {
            if let Some(value) = self.values.get(name).or(spec.default.as_ref()) {
                payload.insert(name.clone(), value.clone());
            }
        }
        Value::Object(payload)
    }

    fn spawn(&self) -> std::io::Result<RunningChild> {
        let mut command = Command::new(&self.manifest.command[0]);
        command
            .args(&self.manifest.command[1..])
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let body = serde_json::to_vec(&self.payload())?;
        let mut child = command.spawn()?;
        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());
        let stdin = feed(child.stdin.take(), body, self.name.clone());

        Ok(RunningChild {
            child,
            stdin,
            stdout,
            stderr,
            started: Instant::now(),
        })
    }

    fn kill_running(&mut self) {
        if let Some(mut running) = self.running.take() {
            if let Err(err) = running.child.kill() {
                debug!(workflow = %self.name, %err, "kill failed, child already exited");
            }
            let _ = running.child.wait();
            let _ = running.stdin.join();
            let _ = running.stdout.join();
            let _ = running.stderr.join();
            debug!(workflow = %self.name, "killed running callee process");
        }
    }

    fn finish(&self, status: ExitStatus, running: RunningChild) -> (ExecutionState, RunRecord) {
        let elapsed = running.started.elapsed();
        let _ = running.stdin.join();
        let stdout = join_capture(running.stdout);
        let stderr = join_capture(running.stderr);
        let step = self.manifest.command[0].clone();

        let mut record = RunRecord::default();
        let mut failure_lines = Vec::new();
        for line in stderr.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix(WARNING_PREFIX) {
                record.messages.push(StepMessage::warning(&step, rest.trim()));
            } else if !trimmed.is_empty() {
                failure_lines.push(trimmed.to_string());
            }
        }

        if !status.success() {
            let mut text = match status.code() {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            };
            if !failure_lines.is_empty() {
                text = format!("{text}: {}", failure_lines.join("\n"));
            }
            record.messages.push(StepMessage::error(&step, text));
            record.summary = format!("{} failed after {:?}", self.name, elapsed);
            return (ExecutionState::Idle, record);
        }

        // Nothing on stdout: every declared output stays missing.
        if stdout.trim().is_empty() {
            record.summary = format!(
                "{} executed in {:?}, 0 of {} outputs populated",
                self.name,
                elapsed,
                self.manifest.outputs.len()
            );
            return (ExecutionState::Executed, record);
        }

        match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(Value::Object(map)) => {
                for (name, value) in map {
                    if self.manifest.outputs.contains_key(&name) {
                        record.outputs.insert(name, value);
                    } else {
                        record.messages.push(StepMessage::warning(
                            &step,
                            format!("ignoring undeclared output '{name}'"),
                        ));
                    }
                }
                record.summary = format!(
                    "{} executed in {:?}, {} of {} outputs populated",
                    self.name,
                    elapsed,
                    record.outputs.len(),
                    self.manifest.outputs.len()
                );
                (ExecutionState::Executed, record)
            }
            Ok(_) => {
                record
                    .messages
                    .push(StepMessage::error(&step, "stdout is not a JSON object"));
                record.summary = format!("{} produced malformed output", self.name);
                (ExecutionState::Idle, record)
            }
            Err(err) => {
                record
                    .messages
                    .push(StepMessage::error(&step, format!("stdout is not JSON: {err}")));
                record.summary = format!("{} produced malformed output", self.name);
                (ExecutionState::Idle, record)
            }
        }
    }
}

impl Callee for ProcessCallee {
    fn signature(&self) -> CalleeSignature {
        CalleeSignature {
            inputs: self.manifest.inputs.clone(),
            outputs: self.manifest.outputs.clone(),
        }
    }

    fn set_input(&mut self, name: &str, value: Value) -> Result<()> {
        let spec = self
            .manifest
            .inputs
            .get(name)
            .ok_or_else(|| CallError::invalid_parameter(name, "no such input parameter"))?;
        if !spec.kind.accepts(&value) {
            return Err(CallError::invalid_parameter(
                name,
                format!("value is not valid for a {} parameter", spec.kind),
            ));
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    fn execute(&mut self, cancel: &CancelToken) -> ExecutionState {
        // A run left over from a timeout is abandoned before starting anew.
        self.kill_running();
        self.last = RunRecord::default();

        let step = self.manifest.command[0].clone();
        let running = match self.spawn() {
            Ok(running) => running,
            Err(err) => {
                warn!(workflow = %self.name, %err, "failed to start callee process");
                self.last
                    .messages
                    .push(StepMessage::error(&step, format!("failed to start: {err}")));
                self.last.summary = format!("{} could not be started", self.name);
                return ExecutionState::Idle;
            }
        };
        self.running = Some(running);

        let timeout = self.manifest.timeout_secs.map(Duration::from_secs);
        loop {
            let Some(running) = self.running.as_mut() else {
                return ExecutionState::Idle;
            };

            match running.child.try_wait() {
                Ok(Some(status)) => {
                    let Some(running) = self.running.take() else {
                        return ExecutionState::Idle;
                    };
                    let (state, record) = self.finish(status, running);
                    self.last = record;
                    return state;
                }
                Ok(None) => {}
                Err(err) => {
                    self.kill_running();
                    self.last
                        .messages
                        .push(StepMessage::error(&step, format!("wait failed: {err}")));
                    self.last.summary = format!("{} was lost", self.name);
                    return ExecutionState::Idle;
                }
            }

            if cancel.is_cancelled() {
                self.kill_running();
                self.last
                    .messages
                    .push(StepMessage::error(&step, "execution cancelled"));
                self.last.summary = format!("{} was cancelled", self.name);
                return ExecutionState::Idle;
            }

            if let Some(limit) = timeout {
                if running.started.elapsed() >= limit {
                    self.last.summary =
                        format!("{} still running after {}s", self.name, limit.as_secs());
                    return ExecutionState::Running;
                }
            }

            std::thread::sleep(WAIT_POLL);
        }
    }

    fn outputs(&self) -> BTreeMap<String, Value> {
        self.last.outputs.clone()
    }

    fn messages(&self) -> Vec<StepMessage> {
        self.last.messages.clone()
    }

    fn summary(&self) -> String {
        self.last.summary.clone()
    }

    fn cancel(&mut self) {
        self.kill_running();
    }

    fn dispose(&mut self) {
        self.kill_running();
        self.values.clear();
    }
}

/// Write `body` to the child's stdin off the calling thread, so a child
/// that never reads cannot block the wait loop.
fn feed<W: Write + Send + 'static>(
    pipe: Option<W>,
    body: Vec<u8>,
    workflow: String,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let Some(mut pipe) = pipe else {
            return;
        };
        // A callee that ignores stdin may close it early; that is not a failure.
        if let Err(err) = pipe.write_all(&body).and_then(|_| pipe.write_all(b"\n")) {
            debug!(%workflow, %err, "callee closed stdin early");
        }
    })
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>) -> Capture {
    std::thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut buffer)?;
        }
        Ok(buffer)
    })
}

fn join_capture(capture: Capture) -> String {
    match capture.join() {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => {
            warn!(%err, "failed to read callee output");
            String::new()
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(dir: &std::path::Path, manifest: &Value) -> CanonicalLocation {
        std::fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(manifest).unwrap(),
        )
        .unwrap();
        CanonicalLocation::from_canonical(dir.canonicalize().unwrap())
    }

    #[test]
    fn test_missing_manifest_is_load_error() {
        let temp = TempDir::new().unwrap();
        let location = CanonicalLocation::from_canonical(temp.path());
        assert!(matches!(
            ManifestLoader::new().load(&location),
            Err(CallError::Load { .. })
        ));
    }

    #[test]
    fn test_bad_default_is_load_error() {
        let temp = TempDir::new().unwrap();
        let location = write_manifest(
            temp.path(),
            &serde_json::json!({
                "command": ["true"],
                "inputs": {"a": {"kind": "table", "default": 5}}
            }),
        );
        assert!(matches!(
            ManifestLoader::new().load(&location),
            Err(CallError::Load { .. })
        ));
    }

    #[test]
    fn test_payload_overlays_defaults() {
        let temp = TempDir::new().unwrap();
        let location = write_manifest(
            temp.path(),
            &serde_json::json!({
                "command": ["true"],
                "inputs": {
                    "a": {"kind": "table", "default": {"x": 1}},
                    "b": {"kind": "flow-variable", "default": 0},
                    "c": {"kind": "flow-variable"}
                }
            }),
        );
        let manifest = ManifestLoader::read_manifest(&location).unwrap();
        let mut callee = ProcessCallee::new(&location, manifest);
        callee.set_input("b", serde_json::json!(7)).unwrap();

        assert_eq!(callee.payload(), serde_json::json!({"a": {"x": 1}, "b": 7}));
        assert!(callee.set_input("zzz", Value::Null).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_child_and_reads_outputs() {
        let temp = TempDir::new().unwrap();
        let location = write_manifest(
            temp.path(),
            &serde_json::json!({
                "command": ["sh", "-c", "cat > /dev/null; echo 'warning: cached model' >&2; echo '{\"result\": 42, \"extra\": 1}'"],
                "inputs": {"flag": {"kind": "flow-variable"}},
                "outputs": {"result": {"kind": "flow-variable"}}
            }),
        );
        let mut callee = ManifestLoader::new().load(&location).unwrap();
        callee.set_input("flag", serde_json::json!(true)).unwrap();

        assert_eq!(callee.execute(&CancelToken::new()), ExecutionState::Executed);
        assert_eq!(callee.outputs()["result"], serde_json::json!(42));
        assert!(!callee.outputs().contains_key("extra"));
        let warnings: Vec<String> = callee.messages().into_iter().map(|m| m.text).collect();
        assert!(warnings.contains(&"cached model".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_fails_run() {
        let temp = TempDir::new().unwrap();
        let location = write_manifest(
            temp.path(),
            &serde_json::json!({
                "command": ["sh", "-c", "cat > /dev/null; echo 'model missing' >&2; exit 3"],
                "outputs": {"result": {"kind": "flow-variable"}}
            }),
        );
        let mut callee = ManifestLoader::new().load(&location).unwrap();

        assert_eq!(callee.execute(&CancelToken::new()), ExecutionState::Idle);
        assert!(callee.outputs().is_empty());
        let messages = callee.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.contains("exited with status 3"));
        assert!(messages[0].text.contains("model missing"));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_reports_running_and_cancel_kills() {
        let temp = TempDir::new().unwrap();
        let location = write_manifest(
            temp.path(),
            &serde_json::json!({
                "command": ["sleep", "30"],
                "timeout_secs": 0
            }),
        );
        let mut callee = ManifestLoader::new().load(&location).unwrap();

        let started = Instant::now();
        assert_eq!(callee.execute(&CancelToken::new()), ExecutionState::Running);
        callee.cancel();
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_empty_stdout_leaves_outputs_missing() {
        let temp = TempDir::new().unwrap();
        let location = write_manifest(
            temp.path(),
            &serde_json::json!({"command": ["sh", "-c", "cat > /dev/null"]}),
        );
        let mut callee = ManifestLoader::new().load(&location).unwrap();

        assert_eq!(callee.execute(&CancelToken::new()), ExecutionState::Executed);
        assert!(callee.outputs().is_empty());
        assert!(callee.messages().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_empty_stdout_with_declared_outputs() {
        let temp = TempDir::new().unwrap();
        let location = write_manifest(
            temp.path(),
            &serde_json::json!({
                "command": ["sh", "-c", "cat > /dev/null"],
                "outputs": {"result": {"kind": "flow-variable"}}
            }),
        );
        let mut callee = ManifestLoader::new().load(&location).unwrap();

        assert_eq!(callee.execute(&CancelToken::new()), ExecutionState::Executed);
        assert!(!callee.outputs().contains_key("result"));
    }

    #[cfg(unix)]
    fn unread_input_callee(temp: &TempDir, timeout_secs: u64) -> Box<dyn Callee> {
        let location = write_manifest(
            temp.path(),
            &serde_json::json!({
                "command": ["sleep", "5"],
                "inputs": {"blob": {"kind": "flow-variable"}},
                "timeout_secs": timeout_secs
            }),
        );
        let mut callee = ManifestLoader::new().load(&location).unwrap();
        callee
            .set_input("blob", Value::String("x".repeat(1 << 20)))
            .unwrap();
        callee
    }

    #[cfg(unix)]
    #[test]
    fn test_large_unread_input_does_not_delay_cancel() {
        let temp = TempDir::new().unwrap();
        let mut callee = unread_input_callee(&temp, 1);
        let cancel = CancelToken::new();
        cancel.cancel();

        let started = Instant::now();
        assert_eq!(callee.execute(&cancel), ExecutionState::Idle);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(callee.messages()[0].text, "execution cancelled");
    }

    #[cfg(unix)]
    #[test]
    fn test_large_unread_input_does_not_delay_timeout() {
        let temp = TempDir::new().unwrap();
        let mut callee = unread_input_callee(&temp, 1);

        let started = Instant::now();
        assert_eq!(callee.execute(&CancelToken::new()), ExecutionState::Running);
        assert!(started.elapsed() < Duration::from_secs(3));
        callee.cancel();
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
