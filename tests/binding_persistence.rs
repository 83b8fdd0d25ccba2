//! Persistence tests for parameter bindings and call settings

use callflow::invoker::{CallSettings, ConfigTree, ParameterBinding};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

fn binding() -> impl Strategy<Value = ParameterBinding> {
    (
        prop::collection::btree_map("s_[a-z]{1,8}", json_value(), 0..5),
        prop::collection::btree_map("c_[a-z]{1,8}", "[A-Za-z ()#0-9]{1,16}", 0..5),
    )
        .prop_map(
            |(statics, columns): (BTreeMap<String, Value>, BTreeMap<String, String>)| {
                let mut binding = ParameterBinding::new();
                for (name, value) in statics {
                    binding.bind_static(name, value);
                }
                for (name, column) in columns {
                    binding.bind_column(name, column);
                }
                binding
            },
        )
}

proptest! {
    #[test]
    fn binding_survives_save_and_load(binding in binding()) {
        let mut tree = ConfigTree::new();
        binding.save(&mut tree);
        let loaded = ParameterBinding::load(&tree).unwrap();
        prop_assert_eq!(loaded, binding);
    }

    #[test]
    fn rebinding_keeps_names_disjoint(name in "[a-z]{1,8}", value in json_value()) {
        let mut binding = ParameterBinding::new();
        binding.bind_column(name.clone(), "field");
        binding.bind_static(name.clone(), value);
        prop_assert!(binding.columns().is_empty());
        prop_assert_eq!(binding.static_values().len(), 1);
    }
}

#[test]
fn test_settings_file_round_trip() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("settings/call.json");

    let mut settings = CallSettings::new("callflow://workspace/flows/score");
    settings
        .binding
        .bind_static("model", json!({"depth": 3, "features": ["a", "b"]}));
    settings.binding.bind_column("threshold", "Threshold (#1)");
    settings.save_to(&path).unwrap();

    let tree = CallSettings::read_tree(&path).unwrap();
    assert_eq!(CallSettings::load(&tree).unwrap(), settings);

    // The file carries the nested key/value layout.
    let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["workflow"], json!("callflow://workspace/flows/score"));
    assert_eq!(
        raw["parameterToJsonColumnMap"]["threshold"]["json-column"],
        json!("Threshold (#1)")
    );
    let stored = raw["parameterToJsonConfigMap"]["model"]["json"]
        .as_str()
        .unwrap();
    assert_eq!(
        serde_json::from_str::<Value>(stored).unwrap(),
        json!({"depth": 3, "features": ["a", "b"]})
    );
}
