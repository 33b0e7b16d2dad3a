//! Structural diffs between successive table states.
//!
//! States are opaque JSON values. A delta keeps only what changed in `curr`
//! relative to `prev`:
//!
//! - objects map each changed key to a nested delta or a replacement value,
//! - arrays map each changed index (as a string key) the same way and add a
//!   synthetic `length` field when the array grew or shrank,
//! - anything else is replaced wholesale.
//!
//! A replacement that would read as an array patch or as "no change" (an
//! array becoming an object, a scalar becoming an empty container) is wrapped
//! as `{"$replace": value}`. State objects must not use that key.
//!
//! Keys present in `prev` but missing from `curr` are not represented.

use serde_json::{Map, Value};

/// Synthetic key carrying the new length of an array that changed size.
pub const LENGTH_KEY: &str = "length";

/// Key of the wrapper marking an unambiguous wholesale replacement.
pub const REPLACE_KEY: &str = "$replace";

/// Computes the minimal delta that turns `prev` into `curr`.
///
/// With no prior state the full state is the delta. Identical inputs yield an
/// empty container of the same kind (an empty array for array states, an
/// empty object otherwise).
pub fn compute_delta(prev: Option<&Value>, curr: &Value) -> Value {
    let Some(prev) = prev else {
        return curr.clone();
    };

    match (prev, curr) {
        (Value::Array(prev), Value::Array(curr)) => diff_array(prev, curr),
        (Value::Object(prev), Value::Object(curr)) => diff_object(prev, curr),
        (prev, curr) if prev == curr => Value::Object(Map::new()),
        (prev, curr) => replacement(prev, curr),
    }
}

/// Returns `true` for the "no changes" result of [`compute_delta`].
pub fn is_empty(delta: &Value) -> bool {
    match delta {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Rebuilds the next state from `prev` and a delta produced by [`compute_delta`].
///
/// Every field present in the next state is reconstructed. Fields that only
/// existed in `prev` are carried over untouched.
pub fn apply_delta(prev: Option<&Value>, delta: &Value) -> Value {
    match prev {
        None => delta.clone(),
        // `compute_delta(x, x)` for a scalar `x` is `{}`.
        Some(prev) if !is_container(prev) && is_empty(delta) => prev.clone(),
        Some(prev) => apply_value(prev, delta),
    }
}

fn diff_array(prev: &[Value], curr: &[Value]) -> Value {
    let mut delta = Map::new();
    for (index, value) in curr.iter().enumerate() {
        if let Some(change) = diff_entry(prev.get(index), value) {
            delta.insert(index.to_string(), change);
        }
    }
    if prev.len() != curr.len() {
        delta.insert(LENGTH_KEY.to_string(), Value::from(curr.len()));
    }

    if delta.is_empty() {
        Value::Array(Vec::new())
    } else {
        Value::Object(delta)
    }
}

fn diff_object(prev: &Map<String, Value>, curr: &Map<String, Value>) -> Value {
    let delta = curr
        .iter()
        .filter_map(|(key, value)| {
            diff_entry(prev.get(key), value).map(|change| (key.clone(), change))
        })
        .collect();
    Value::Object(delta)
}

/// Change for a single slot, or `None` when the slot is unchanged.
fn diff_entry(prev: Option<&Value>, curr: &Value) -> Option<Value> {
    match prev {
        Some(prev) if same_container_kind(prev, curr) => {
            let nested = compute_delta(Some(prev), curr);
            (!is_empty(&nested)).then_some(nested)
        }
        Some(prev) if prev == curr => None,
        Some(prev) => Some(replacement(prev, curr)),
        None => Some(curr.clone()),
    }
}

fn replacement(prev: &Value, curr: &Value) -> Value {
    let ambiguous = match (prev, curr) {
        (Value::Array(_), Value::Object(_)) => true,
        (prev, curr) => !is_container(prev) && is_container(curr) && is_empty(curr),
    };
    if ambiguous {
        let mut wrapper = Map::new();
        wrapper.insert(REPLACE_KEY.to_string(), curr.clone());
        Value::Object(wrapper)
    } else {
        curr.clone()
    }
}

fn replaced_value(delta: &Value) -> Option<&Value> {
    match delta {
        Value::Object(map) if map.len() == 1 => map.get(REPLACE_KEY),
        _ => None,
    }
}

fn apply_value(prev: &Value, delta: &Value) -> Value {
    if let Some(value) = replaced_value(delta) {
        return value.clone();
    }
    match (prev, delta) {
        (Value::Object(prev), Value::Object(changes)) => {
            let mut next = prev.clone();
            for (key, change) in changes {
                let value = match prev.get(key) {
                    Some(old) => apply_value(old, change),
                    None => change.clone(),
                };
                next.insert(key.clone(), value);
            }
            Value::Object(next)
        }
        (Value::Array(prev), Value::Object(changes)) if is_array_patch(changes) => {
            Value::Array(patch_array(prev, changes))
        }
        (Value::Array(_), Value::Array(changes)) if changes.is_empty() => prev.clone(),
        _ => delta.clone(),
    }
}

fn patch_array(prev: &[Value], changes: &Map<String, Value>) -> Vec<Value> {
    let mut next = prev.to_vec();
    if let Some(len) = changes.get(LENGTH_KEY).and_then(Value::as_u64) {
        next.resize(len as usize, Value::Null);
    }
    for (key, change) in changes {
        let Ok(index) = key.parse::<usize>() else {
            continue;
        };
        if index >= next.len() {
            next.resize(index + 1, Value::Null);
        }
        next[index] = match prev.get(index) {
            Some(old) => apply_value(old, change),
            None => change.clone(),
        };
    }
    next
}

fn is_array_patch(changes: &Map<String, Value>) -> bool {
    changes
        .keys()
        .all(|key| key == LENGTH_KEY || key.parse::<usize>().is_ok())
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

fn same_container_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_))
    )
}
