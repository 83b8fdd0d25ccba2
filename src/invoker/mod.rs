//! Row invoker: drives one callee once per input record
//!
//! One batch holds one backend (and therefore one handle lease) from start to
//! finish:
//!
//! ```text
//! INIT ──open backend──▶ PER_ROW (bind → set inputs → execute → collect) ──▶ CLOSE (release)
//! ```
//!
//! Row-level problems never stop the batch: a row with a missing bound field
//! or a callee run that does not complete yields a failure row whose Status
//! cell says why. Cancellation is checked once per row and keeps the rows
//! produced so far; a row whose run was cut short by cancellation is
//! dropped rather than reported as a failure.

pub mod binding;
pub mod table;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::runtime::backend::{InvocationBackend, InvocationStatus};
use crate::runtime::callee::CalleeSignature;
use crate::runtime::cancel::CancelToken;
use crate::runtime::error::{CallError, Result};

pub use binding::{CallSettings, ConfigNode, ConfigTree, ParameterBinding};
pub use table::{ColumnSpec, ColumnType, DataRow, DataTable, TableSpec};

/// Name of the appended status column
pub const STATUS_COLUMN: &str = "Status";

/// Why a single row produced no outputs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowFailure {
    /// A field-bound parameter read a missing cell
    #[error("Row contains missing values, {callee} not invoked")]
    MissingValues {
        /// Callee display name
        callee: String,
    },

    /// The callee ran but did not complete
    #[error("Failure, workflow was not executed.{}", diagnostic.as_ref().map(|d| format!(" {d}")).unwrap_or_default())]
    NotExecuted {
        /// Backend diagnostic, if any
        diagnostic: Option<String>,
    },
}

/// What one row contributed to the batch
enum RowOutcome {
    Produced(Vec<Option<Value>>),
    Failed(RowFailure),
    /// Cancelled while the callee ran; the row is dropped
    Interrupted,
}

/// Progress sink for a batch
pub trait ProgressListener: Send + Sync {
    /// Called before row `index` (zero based) of `total` is processed
    fn on_row(&self, index: usize, total: usize, key: &str);
}

/// Listener that ignores progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressListener for NoProgress {
    fn on_row(&self, _index: usize, _total: usize, _key: &str) {}
}

/// Outcome of one batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    /// Output table (possibly partial when cancelled)
    pub table: DataTable,
    /// Whether the batch stopped early on cancellation
    pub cancelled: bool,
    /// Number of failure rows
    pub failed_rows: usize,
}

/// Configured per-row driver for one callee
#[derive(Debug, Clone)]
pub struct RowInvoker {
    callee_name: String,
    binding: ParameterBinding,
    input_spec: TableSpec,
    output_spec: TableSpec,
    outputs: Vec<String>,
}

impl RowInvoker {
    /// Validate `binding` and compute the output spec.
    ///
    /// Output columns are the input columns, one JSON column per declared
    /// output parameter (sorted by name), then [`STATUS_COLUMN`].
    pub fn configure(
        callee_name: impl Into<String>,
        binding: ParameterBinding,
        input_spec: &TableSpec,
        signature: &CalleeSignature,
    ) -> Result<Self> {
        binding.validate(input_spec)?;
        for name in binding.bound_names() {
            if !signature.inputs.contains_key(name) {
                return Err(CallError::invalid_parameter(
                    name,
                    "workflow declares no such input parameter",
                ));
            }
        }
        for (name, value) in binding.static_values() {
            let kind = signature.inputs[name].kind;
            if !kind.accepts(value) {
                return Err(CallError::invalid_parameter(
                    name,
                    format!("static value is not valid for a {kind} parameter"),
                ));
            }
        }

        let outputs = signature.output_names();
        let mut output_spec = input_spec.clone();
        for name in &outputs {
            output_spec.push_unique(ColumnSpec::json(name.clone()));
        }
        output_spec.push_unique(ColumnSpec::new(STATUS_COLUMN, ColumnType::String));

        Ok(Self {
            callee_name: callee_name.into(),
            binding,
            input_spec: input_spec.clone(),
            output_spec,
            outputs,
        })
    }

    /// Spec of the table `run` produces
    pub fn output_spec(&self) -> &TableSpec {
        &self.output_spec
    }

    /// Declared output parameters in column order
    pub fn output_parameters(&self) -> &[String] {
        &self.outputs
    }

    /// Process every row of `input`, then release `backend` exactly once.
    pub fn run(
        &self,
        mut backend: Box<dyn InvocationBackend>,
        input: &DataTable,
        cancel: &CancelToken,
        progress: &dyn ProgressListener,
    ) -> Result<BatchResult> {
        info!(
            workflow = %self.callee_name,
            rows = input.row_count(),
            "invoking workflow per row"
        );
        let outcome = self.run_rows(backend.as_mut(), input, cancel, progress);
        let released = backend.release();

        let result = outcome?;
        released?;
        info!(
            workflow = %self.callee_name,
            rows = result.table.row_count(),
            failed = result.failed_rows,
            cancelled = result.cancelled,
            "batch finished"
        );
        Ok(result)
    }

    fn run_rows(
        &self,
        backend: &mut dyn InvocationBackend,
        input: &DataTable,
        cancel: &CancelToken,
        progress: &dyn ProgressListener,
    ) -> Result<BatchResult> {
        if input.spec != self.input_spec {
            return Err(CallError::Execution(
                "input table does not match the configured spec".into(),
            ));
        }

        let column_indices: Vec<(&str, usize)> = self
            .binding
            .columns()
            .iter()
            .filter_map(|(parameter, column)| {
                input
                    .spec
                    .find(column)
                    .map(|(index, _)| (parameter.as_str(), index))
            })
            .collect();

        let total = input.row_count();
        let mut table = DataTable::new(self.output_spec.clone());
        let mut failed_rows = 0;

        for (index, row) in input.rows.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(workflow = %self.callee_name, processed = index, "batch cancelled");
                return Ok(BatchResult {
                    table,
                    cancelled: true,
                    failed_rows,
                });
            }
            progress.on_row(index, total, &row.key);

            let cells = match self.invoke_row(backend, row, &column_indices, cancel)? {
                RowOutcome::Produced(cells) => cells,
                RowOutcome::Failed(failure) => {
                    debug!(row = %row.key, %failure, "row failed");
                    failed_rows += 1;
                    self.failure_cells(&failure)
                }
                RowOutcome::Interrupted => {
                    info!(workflow = %self.callee_name, processed = index, "batch cancelled during row");
                    return Ok(BatchResult {
                        table,
                        cancelled: true,
                        failed_rows,
                    });
                }
            };

            let mut out = row.cells.clone();
            out.extend(cells);
            table.push(DataRow::new(row.key.clone(), out));
        }

        Ok(BatchResult {
            table,
            cancelled: false,
            failed_rows,
        })
    }

    /// An error aborts the batch; a [`RowOutcome::Failed`] fails only this row.
    fn invoke_row(
        &self,
        backend: &mut dyn InvocationBackend,
        row: &DataRow,
        column_indices: &[(&str, usize)],
        cancel: &CancelToken,
    ) -> Result<RowOutcome> {
        let mut inputs: BTreeMap<String, Value> = self.binding.static_values().clone();
        for (parameter, index) in column_indices {
            match row.cell(*index) {
                Some(value) => {
                    inputs.insert(parameter.to_string(), value.clone());
                }
                None => {
                    return Ok(RowOutcome::Failed(RowFailure::MissingValues {
                        callee: self.callee_name.clone(),
                    }));
                }
            }
        }

        backend.set_inputs(&inputs)?;
        let started = Instant::now();
        let status = backend.execute(cancel)?;
        let elapsed = started.elapsed();

        if status != InvocationStatus::Executed {
            if cancel.is_cancelled() {
                return Ok(RowOutcome::Interrupted);
            }
            let diagnostic = backend.diagnostic()?;
            warn!(workflow = %self.callee_name, row = %row.key, %status, "workflow not executed");
            return Ok(RowOutcome::Failed(RowFailure::NotExecuted {
                diagnostic: Some(diagnostic).filter(|d| !d.trim().is_empty()),
            }));
        }

        let mut produced = backend.outputs()?;
        let mut cells: Vec<Option<Value>> = self
            .outputs
            .iter()
            .map(|name| produced.remove(name))
            .collect();
        cells.push(Some(Value::String(format!(
            "Completed in {}",
            format_elapsed(elapsed)
        ))));
        Ok(RowOutcome::Produced(cells))
    }

    fn failure_cells(&self, failure: &RowFailure) -> Vec<Option<Value>> {
        let mut cells = vec![None; self.outputs.len()];
        cells.push(Some(Value::String(failure.to_string())));
        cells
    }
}

/// Human-readable elapsed time: `850ms`, `1.234s`, `2m 5s`, `1h 0m 12s`
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1_000 {
        return format!("{millis}ms");
    }
    let secs = elapsed.as_secs();
    if secs < 60 {
        return format!("{}.{:03}s", secs, elapsed.subsec_millis());
    }
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours == 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{hours}h {minutes}m {seconds}s")
    }
}
