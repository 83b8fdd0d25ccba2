//! End-to-end tests with manifest-described workflows run as child processes

#![cfg(unix)]

use callflow::invoker::{CallSettings, ColumnSpec, DataRow, DataTable, NoProgress, TableSpec};
use callflow::runtime::cancel::CancelToken;
use callflow::runtime::process::{MANIFEST_FILE, ManifestLoader};
use callflow::runtime::resolver::ResolveContext;
use callflow::runtime::scheduler::ManualScheduler;
use callflow::{CallRuntime, RuntimeConfig};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const SCRIPT: &str = r#"input=$(cat)
case "$input" in
  *'"fail"'*) echo 'warning: retrying once' >&2; echo 'bad flag' >&2; exit 2 ;;
esac
echo '{"result": {"ok": true}, "debug": 1}'"#;

fn write_workflow(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    let manifest = json!({
        "name": "score",
        "command": ["sh", "-c", SCRIPT],
        "inputs": {
            "a": {"kind": "table", "default": {}},
            "b": {"kind": "flow-variable"}
        },
        "outputs": {
            "result": {"kind": "flow-variable"}
        }
    });
    std::fs::write(
        dir.join(MANIFEST_FILE),
        serde_json::to_vec_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

fn process_runtime() -> CallRuntime {
    CallRuntime::new(
        RuntimeConfig::default(),
        Arc::new(ManifestLoader::new()),
        Arc::new(ManualScheduler::new()),
    )
}

#[test]
fn test_process_workflow_per_row() {
    let temp = TempDir::new().unwrap();
    write_workflow(&temp.path().join("flows/score"));
    let runtime = process_runtime();
    let context = ResolveContext::rooted_at(temp.path());

    let mut settings = CallSettings::new("/flows/score");
    settings.binding.bind_static("a", json!({"threshold": 0.5}));
    settings.binding.bind_column("b", "flag");

    let mut input = DataTable::new(TableSpec::new(vec![ColumnSpec::json("flag")]));
    input.push(DataRow::new("Row0", vec![Some(json!("go"))]));
    input.push(DataRow::new("Row1", vec![Some(json!("fail"))]));
    input.push(DataRow::new("Row2", vec![None]));

    let result = runtime
        .invoke(
            &settings,
            &context,
            &input,
            &CancelToken::new(),
            &NoProgress,
        )
        .unwrap();
    let table = &result.table;
    let status = |row: usize| {
        table
            .value(row, "Status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    assert_eq!(table.value(0, "result"), Some(&json!({"ok": true})));
    assert!(status(0).starts_with("Completed in"));
    assert_eq!(
        status(1),
        "Failure, workflow was not executed. sh: exited with status 2: bad flag"
    );
    assert_eq!(status(2), "Row contains missing values, score not invoked");
    assert_eq!(result.failed_rows, 2);

    let signature = runtime
        .describe("callflow://workspace/flows/score", &context, &CancelToken::new())
        .unwrap();
    assert_eq!(signature.output_names(), vec!["result".to_string()]);
    assert_eq!(runtime.registry().len(), 1);

    runtime.shutdown();
    assert!(runtime.registry().is_empty());
}

#[test]
fn test_missing_manifest_aborts_batch() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("empty")).unwrap();
    let runtime = process_runtime();

    let outcome = runtime.describe(
        "empty",
        &ResolveContext::rooted_at(temp.path()),
        &CancelToken::new(),
    );

    assert!(matches!(outcome, Err(callflow::CallError::Load { .. })));
    assert!(runtime.registry().is_empty());
}
