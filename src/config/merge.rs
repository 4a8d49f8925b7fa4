//! Layer merging.
//!
//! Layers are JSON values; later layers win:
//! - Objects: merged key by key, recursively
//! - Arrays: replaced wholesale
//! - Scalars and null: replaced

use serde_json::Value;

/// Merge `overlay` onto `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Fold `layers` from lowest to highest precedence.
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Convert a parsed TOML document to JSON for merging. Datetimes become
/// strings.
pub fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_tables_merge() {
        let base = json!({"port": 8097, "monitor": {"buffer": 256, "snapshot": true}});
        let overlay = json!({"monitor": {"buffer": 16}});
        let merged = deep_merge(base, overlay);
        assert_eq!(merged["port"], 8097);
        assert_eq!(merged["monitor"]["buffer"], 16);
        assert_eq!(merged["monitor"]["snapshot"], true);
    }

    #[test]
    fn test_arrays_replace() {
        let merged = deep_merge(
            json!({"purge": ["a", "b", "c"]}),
            json!({"purge": ["z"]}),
        );
        assert_eq!(merged["purge"], json!(["z"]));
    }

    #[test]
    fn test_later_layers_win() {
        let merged = merge_layers(vec![
            json!({"port": 1, "bind": "0.0.0.0"}),
            json!({"port": 2}),
            json!({"port": 3, "root": "/srv"}),
        ]);
        assert_eq!(merged, json!({"port": 3, "bind": "0.0.0.0", "root": "/srv"}));
    }

    #[test]
    fn test_null_clears() {
        let merged = deep_merge(json!({"name": "sched"}), json!({"name": null}));
        assert!(merged["name"].is_null());
    }

    #[test]
    fn test_toml_conversion() {
        let doc: toml::Value = toml::from_str(
            r#"
            port = 9000
            ratio = 0.5
            [monitor]
            buffer = 8
            hosts = ["x86_64", "aarch64"]
            "#,
        )
        .unwrap();
        let value = toml_to_json(doc);
        assert_eq!(value["port"], 9000);
        assert_eq!(value["ratio"], 0.5);
        assert_eq!(value["monitor"]["buffer"], 8);
        assert_eq!(value["monitor"]["hosts"][1], "aarch64");
    }
}
