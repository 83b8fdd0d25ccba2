//! Parameter bindings and their persisted settings tree
//!
//! A binding says where each callee input comes from: a static JSON value or
//! a field of the source record. Unbound parameters keep the callee default.
//!
//! Settings persist as a hierarchical key/value tree:
//!
//! ```text
//! workflow                   = "<location>"
//! parameterToJsonConfigMap   / <param> / json        = "<canonical JSON text>"
//! parameterToJsonColumnMap   / <param> / json-column = "<field name>"
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use super::table::{ColumnType, TableSpec};
use crate::runtime::error::{ConfigError, ConfigResult, StorageResult};
use crate::runtime::storage;

/// Key of the callee location
pub const WORKFLOW_KEY: &str = "workflow";
/// Subtree of static bindings
pub const STATIC_MAP_KEY: &str = "parameterToJsonConfigMap";
/// Subtree of field bindings
pub const COLUMN_MAP_KEY: &str = "parameterToJsonColumnMap";
/// Leaf holding static JSON text
pub const JSON_KEY: &str = "json";
/// Leaf holding a field name
pub const JSON_COLUMN_KEY: &str = "json-column";

/// Node of a [`ConfigTree`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigNode {
    /// Leaf string
    Value(String),
    /// Nested subtree
    Tree(ConfigTree),
}

impl ConfigNode {
    /// Borrow this node as a subtree, replacing a leaf with an empty one
    fn make_tree(&mut self) -> &mut ConfigTree {
        match self {
            ConfigNode::Tree(tree) => tree,
            ConfigNode::Value(_) => {
                *self = ConfigNode::Tree(ConfigTree::new());
                self.make_tree()
            }
        }
    }
}

/// Hierarchical string key/value tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigTree {
    entries: BTreeMap<String, ConfigNode>,
}

impl ConfigTree {
    /// Empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a leaf string
    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), ConfigNode::Value(value.into()));
    }

    /// Insert (or replace) a subtree and return it for filling
    pub fn add_tree(&mut self, key: impl Into<String>) -> &mut ConfigTree {
        let node = self
            .entries
            .entry(key.into())
            .or_insert_with(|| ConfigNode::Tree(ConfigTree::new()));
        *node = ConfigNode::Tree(ConfigTree::new());
        node.make_tree()
    }

    /// Read a leaf string
    pub fn get_string(&self, key: &str) -> ConfigResult<&str> {
        match self.entries.get(key) {
            Some(ConfigNode::Value(value)) => Ok(value),
            Some(ConfigNode::Tree(_)) => Err(ConfigError::WrongType(key.to_string())),
            None => Err(ConfigError::MissingKey(key.to_string())),
        }
    }

    /// Read a subtree
    pub fn get_tree(&self, key: &str) -> ConfigResult<&ConfigTree> {
        match self.entries.get(key) {
            Some(ConfigNode::Tree(tree)) => Ok(tree),
            Some(ConfigNode::Value(_)) => Err(ConfigError::WrongType(key.to_string())),
            None => Err(ConfigError::MissingKey(key.to_string())),
        }
    }

    /// Child keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Whether `key` exists
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// Where each callee input parameter gets its value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBinding {
    static_values: BTreeMap<String, Value>,
    columns: BTreeMap<String, String>,
}

impl ParameterBinding {
    /// Empty binding: every parameter uses its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a static value, replacing any field binding
    pub fn bind_static(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.columns.remove(&name);
        self.static_values.insert(name, value);
    }

    /// Bind `name` to a source field, replacing any static binding
    pub fn bind_column(&mut self, name: impl Into<String>, column: impl Into<String>) {
        let name = name.into();
        self.static_values.remove(&name);
        self.columns.insert(name, column.into());
    }

    /// Remove any binding of `name`
    pub fn unbind(&mut self, name: &str) {
        self.static_values.remove(name);
        self.columns.remove(name);
    }

    /// Statically bound parameters
    pub fn static_values(&self) -> &BTreeMap<String, Value> {
        &self.static_values
    }

    /// Field-bound parameters
    pub fn columns(&self) -> &BTreeMap<String, String> {
        &self.columns
    }

    /// Every bound parameter name
    pub fn bound_names(&self) -> impl Iterator<Item = &str> {
        self.static_values
            .keys()
            .chain(self.columns.keys())
            .map(String::as_str)
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.static_values.is_empty() && self.columns.is_empty()
    }

    /// Check every field binding against the input schema.
    pub fn validate(&self, input: &TableSpec) -> ConfigResult<()> {
        for (parameter, column) in &self.columns {
            match input.find(column) {
                None => {
                    return Err(ConfigError::UnknownColumn {
                        parameter: parameter.clone(),
                        column: column.clone(),
                    });
                }
                Some((_, spec)) if spec.column_type != ColumnType::Json => {
                    return Err(ConfigError::NotJsonColumn {
                        parameter: parameter.clone(),
                        column: column.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Write both maps into `tree`
    pub fn save(&self, tree: &mut ConfigTree) {
        let statics = tree.add_tree(STATIC_MAP_KEY);
        for (name, value) in &self.static_values {
            statics.add_tree(name).add_string(JSON_KEY, value.to_string());
        }
        let columns = tree.add_tree(COLUMN_MAP_KEY);
        for (name, column) in &self.columns {
            columns.add_tree(name).add_string(JSON_COLUMN_KEY, column.clone());
        }
    }

    /// Read a binding, failing on the first invalid entry.
    ///
    /// Absent maps read as empty.
    pub fn load(tree: &ConfigTree) -> ConfigResult<Self> {
        let mut binding = Self::new();

        if tree.contains(STATIC_MAP_KEY) {
            let statics = tree.get_tree(STATIC_MAP_KEY)?;
            for name in statics.keys() {
                let text = statics.get_tree(name)?.get_string(JSON_KEY)?;
                let value = serde_json::from_str(text).map_err(|err| ConfigError::InvalidJson {
                    name: name.to_string(),
                    detail: err.to_string(),
                })?;
                binding.static_values.insert(name.to_string(), value);
            }
        }

        if tree.contains(COLUMN_MAP_KEY) {
            let columns = tree.get_tree(COLUMN_MAP_KEY)?;
            for name in columns.keys() {
                if binding.static_values.contains_key(name) {
                    return Err(ConfigError::DuplicateBinding(name.to_string()));
                }
                let column = columns.get_tree(name)?.get_string(JSON_COLUMN_KEY)?;
                binding.columns.insert(name.to_string(), column.to_string());
            }
        }

        Ok(binding)
    }

    /// Read a binding for display, silently dropping invalid entries.
    pub fn load_best_effort(tree: &ConfigTree) -> Self {
        let mut binding = Self::new();

        if let Ok(statics) = tree.get_tree(STATIC_MAP_KEY) {
            for name in statics.keys() {
                let parsed = statics
                    .get_tree(name)
                    .and_then(|entry| entry.get_string(JSON_KEY))
                    .ok()
                    .and_then(|text| serde_json::from_str::<Value>(text).ok());
                match parsed {
                    Some(value) => {
                        binding.static_values.insert(name.to_string(), value);
                    }
                    None => debug!(parameter = name, "dropping unreadable static binding"),
                }
            }
        }

        if let Ok(columns) = tree.get_tree(COLUMN_MAP_KEY) {
            for name in columns.keys() {
                if binding.static_values.contains_key(name) {
                    debug!(parameter = name, "dropping duplicate column binding");
                    continue;
                }
                match columns
                    .get_tree(name)
                    .and_then(|entry| entry.get_string(JSON_COLUMN_KEY))
                {
                    Ok(column) => {
                        binding.columns.insert(name.to_string(), column.to_string());
                    }
                    Err(_) => debug!(parameter = name, "dropping unreadable column binding"),
                }
            }
        }

        binding
    }
}

/// Persisted settings of one caller: callee location plus binding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSettings {
    /// Location string as entered (resolved at configure time)
    pub workflow: String,
    /// Parameter binding
    pub binding: ParameterBinding,
}

impl CallSettings {
    /// Settings for `workflow` with an empty binding
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            binding: ParameterBinding::new(),
        }
    }

    /// Write into a settings tree
    pub fn save(&self, tree: &mut ConfigTree) {
        tree.add_string(WORKFLOW_KEY, self.workflow.clone());
        self.binding.save(tree);
    }

    /// Read from a settings tree, failing on invalid entries
    pub fn load(tree: &ConfigTree) -> ConfigResult<Self> {
        Ok(Self {
            workflow: tree.get_string(WORKFLOW_KEY)?.to_string(),
            binding: ParameterBinding::load(tree)?,
        })
    }

    /// Read from a settings tree without ever failing
    pub fn load_best_effort(tree: &ConfigTree) -> Self {
        Self {
            workflow: tree
                .get_string(WORKFLOW_KEY)
                .map(str::to_string)
                .unwrap_or_default(),
            binding: ParameterBinding::load_best_effort(tree),
        }
    }

    /// Persist to a JSON file, atomically
    pub fn save_to(&self, path: &Path) -> StorageResult<()> {
        let mut tree = ConfigTree::new();
        self.save(&mut tree);
        let json = serde_json::to_vec_pretty(&tree)?;
        storage::write_atomic(path, &json)
    }

    /// Read a JSON settings file as a tree
    pub fn read_tree(path: &Path) -> StorageResult<ConfigTree> {
        let data = storage::read_file(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}
