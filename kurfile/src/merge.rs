//! Field-level merging of value trees.
//!
//! Used wherever one structure is layered over another: several documents
//! assembled together, `include` directives and `<<` merge keys.

use crate::value::Value;

/// Merge `overlay` on top of `base`.
///
/// Mappings are merged key by key, recursively. Any other overlay value,
/// sequences included, replaces the base value outright.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Map(mut base_map), Value::Map(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Map(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Fold several values left to right, later ones winning.
pub fn merge_all<I>(values: I) -> Value
where
    I: IntoIterator<Item = Value>,
{
    values.into_iter().fold(Value::Null, |acc, next| match acc {
        Value::Null => next,
        acc => deep_merge(acc, next),
    })
}
