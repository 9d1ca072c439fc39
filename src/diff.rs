use serde_json::{Map, Value};

/// Key used for an array element: the feature name when the element is a
/// feature object, otherwise its index.
fn element_key(index: usize, item: &Value) -> String {
    item.get("feature")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| index.to_string())
}

fn keyed(items: &[Value]) -> Map<String, Value> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| (element_key(i, item), item.clone()))
        .collect()
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Collects `(path, old, new)` for every leaf that differs between two JSON
/// documents. Feature arrays are compared by feature name, not position.
pub(crate) fn diff_json(
    previous: &Value,
    current: &Value,
    path_prefix: &str,
    changes: &mut Vec<(String, Value, Value)>,
) {
    match (previous, current) {
        (Value::Object(prev_map), Value::Object(curr_map)) => {
            diff_maps(prev_map, curr_map, path_prefix, changes);
        }
        (Value::Array(prev_items), Value::Array(curr_items)) => {
            diff_maps(&keyed(prev_items), &keyed(curr_items), path_prefix, changes);
        }
        (prev, curr) if prev != curr => {
            changes.push((path_prefix.to_string(), prev.clone(), curr.clone()));
        }
        _ => {}
    }
}

fn diff_maps(
    prev_map: &Map<String, Value>,
    curr_map: &Map<String, Value>,
    path_prefix: &str,
    changes: &mut Vec<(String, Value, Value)>,
) {
    for (key, curr_val) in curr_map {
        let path = join(path_prefix, key);
        match prev_map.get(key) {
            Some(prev_val) => diff_json(prev_val, curr_val, &path, changes),
            None if curr_val.is_object() => {
                diff_json(&Value::Object(Map::new()), curr_val, &path, changes);
            }
            None => changes.push((path, Value::Null, curr_val.clone())),
        }
    }
    for (key, prev_val) in prev_map {
        if !curr_map.contains_key(key) {
            changes.push((join(path_prefix, key), prev_val.clone(), Value::Null));
        }
    }
}
