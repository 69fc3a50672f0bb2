//! Field-by-field merging of configuration tiers.
//!
//! Higher tiers override lower ones key by key; arrays and scalars are
//! replaced wholesale.

use serde_json::Value;

/// Merge `overlay` onto `base`, with `overlay` taking precedence.
///
/// - Objects merge recursively
/// - Any other overlay value replaces the base value
/// - A null overlay keeps the base value (null means "not specified")
///
/// # Example
/// ```
/// use serde_json::json;
/// use taskport::config::deep_merge;
///
/// let base = json!({ "ports": { "min_port": 1000, "max_port": 2000 } });
/// let overlay = json!({ "ports": { "max_port": 1100 } });
/// let merged = deep_merge(base, overlay);
/// assert_eq!(merged, json!({ "ports": { "min_port": 1000, "max_port": 1100 } }));
/// ```
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged_value = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged_value);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Fold `deep_merge` over tiers, lowest priority first.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}
