//! Nested settings diff.
//!
//! Produces a flat map of dotted paths to `{old, new}` pairs restricted
//! to the keys that actually changed between two snapshots. Added and
//! removed keys are represented with a `null` counterpart.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

/// One changed key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Changed {
    pub old: Value,
    pub new: Value,
}

/// Compute the changed keys between two JSON documents.
pub fn compute_diff(previous: &Value, current: &Value) -> BTreeMap<String, Changed> {
    let mut changes = BTreeMap::new();
    walk(previous, current, String::new(), &mut changes);
    changes
}

fn walk(old: &Value, new: &Value, prefix: String, out: &mut BTreeMap<String, Changed>) {
    if let (Value::Object(old_map), Value::Object(new_map)) = (old, new) {
        let keys: BTreeSet<&String> = old_map.keys().chain(new_map.keys()).collect();
        for key in keys {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            let old_value = old_map.get(key).unwrap_or(&Value::Null);
            let new_value = new_map.get(key).unwrap_or(&Value::Null);
            walk(old_value, new_value, path, out);
        }
        return;
    }

    if old != new {
        out.insert(
            prefix,
            Changed {
                old: old.clone(),
                new: new.clone(),
            },
        );
    }
}
