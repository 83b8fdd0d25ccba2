//! Minimal tabular data model for row-wise invocation.
//!
//! Cells are `Option<Value>`: `None` is the missing-value sentinel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnType {
    /// Arbitrary JSON
    Json,
    /// Text
    String,
    /// Integer number
    Integer,
    /// Floating point number
    Double,
    /// Boolean
    Boolean,
}

/// Name and type of one column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name
    pub name: String,
    /// Column type
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnSpec {
    /// Column with the given name and type
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }

    /// JSON column
    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Json)
    }
}

/// Ordered column list of a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSpec {
    columns: Vec<ColumnSpec>,
}

impl TableSpec {
    /// Spec with the given columns
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    /// All columns in order
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether there are no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Index and spec of the column named `name`
    pub fn find(&self, name: &str) -> Option<(usize, &ColumnSpec)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, column)| column.name == name)
    }

    /// Append `column`, renaming it with a ` (#n)` suffix if the name is taken.
    ///
    /// Returns the name actually used.
    pub fn push_unique(&mut self, mut column: ColumnSpec) -> String {
        let taken: HashSet<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        if taken.contains(column.name.as_str()) {
            let base = column.name.clone();
            let mut n = 1;
            while taken.contains(format!("{base} (#{n})").as_str()) {
                n += 1;
            }
            column.name = format!("{base} (#{n})");
        }
        let name = column.name.clone();
        self.columns.push(column);
        name
    }
}

/// One row: a key plus one cell per column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    /// Row key
    pub key: String,
    /// Cells, `None` for missing
    pub cells: Vec<Option<Value>>,
}

impl DataRow {
    /// Row with the given key and cells
    pub fn new(key: impl Into<String>, cells: Vec<Option<Value>>) -> Self {
        Self {
            key: key.into(),
            cells,
        }
    }

    /// Cell at `index`; out of range reads as missing
    pub fn cell(&self, index: usize) -> Option<&Value> {
        self.cells.get(index).and_then(|cell| cell.as_ref())
    }
}

/// Table: spec plus rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    /// Column spec
    pub spec: TableSpec,
    /// Rows in order
    #[serde(default)]
    pub rows: Vec<DataRow>,
}

impl DataTable {
    /// Empty table with the given spec
    pub fn new(spec: TableSpec) -> Self {
        Self {
            spec,
            rows: Vec::new(),
        }
    }

    /// Append a row
    pub fn push(&mut self, row: DataRow) {
        self.rows.push(row);
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Cell of row `row` in the column named `column`
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let (index, _) = self.spec.find(column)?;
        self.rows.get(row)?.cell(index)
    }
}
