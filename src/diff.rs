//! Structural diffs over free-form JSON specs.
//!
//! Every spec this crate handles is an object keyed by attribute name,
//! arbitrarily nested (`mount` entries, intent/status bags, ...). Diffs here
//! are scoped to that shape: paths are chains of object keys, there is no
//! array-index addressing. That keeps [`diff`], [`apply_diff`] and [`trim`]
//! simple enough to hand-roll instead of reaching for a general RFC 6902
//! JSON Patch implementation, which would buy us array semantics we never
//! use.

use serde_json::{Map, Value};

/// The kind of change a [`DiffOp`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Add,
    Change,
    Remove,
}

/// One attribute-level change between two spec snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffOp {
    pub op: DiffKind,
    pub path: Vec<String>,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Computes the attribute-level diff from `old` to `new`.
///
/// Recurses through matching object subtrees so that a change deep inside
/// `mount["gvr"]["nsn"]["spec"]["intent"]` is reported as a single op at
/// that path, rather than a wholesale replacement of `mount`.
pub fn diff(old: &Value, new: &Value) -> Vec<DiffOp> {
    let mut out = Vec::new();
    diff_into(&mut Vec::new(), old, new, &mut out);
    out
}

fn diff_into(path: &mut Vec<String>, old: &Value, new: &Value, out: &mut Vec<DiffOp>) {
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            for (k, new_v) in n {
                path.push(k.clone());
                match o.get(k) {
                    Some(old_v) if old_v == new_v => {}
                    Some(old_v) => diff_into(path, old_v, new_v, out),
                    None => out.push(DiffOp {
                        op: DiffKind::Add,
                        path: path.clone(),
                        old: None,
                        new: Some(new_v.clone()),
                    }),
                }
                path.pop();
            }
            for (k, old_v) in o {
                if !n.contains_key(k) {
                    path.push(k.clone());
                    out.push(DiffOp {
                        op: DiffKind::Remove,
                        path: path.clone(),
                        old: Some(old_v.clone()),
                        new: None,
                    });
                    path.pop();
                }
            }
        }
        _ if old == new => {}
        _ => out.push(DiffOp {
            op: DiffKind::Change,
            path: path.clone(),
            old: Some(old.clone()),
            new: Some(new.clone()),
        }),
    }
}

/// Applies a previously computed diff to `spec`, producing the resulting value.
pub fn apply_diff(spec: &Value, diffs: &[DiffOp]) -> Value {
    let mut result = spec.clone();
    for d in diffs {
        match d.op {
            DiffKind::Remove => remove_path(&mut result, &d.path),
            DiffKind::Add | DiffKind::Change => {
                if let Some(v) = &d.new {
                    set_path(&mut result, &d.path, v.clone());
                }
            }
        }
    }
    result
}

fn set_path(root: &mut Value, path: &[String], value: Value) {
    if path.is_empty() {
        *root = value;
        return;
    }
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let obj = root.as_object_mut().expect("just coerced to object");
    if path.len() == 1 {
        obj.insert(path[0].clone(), value);
    } else {
        let child = obj
            .entry(path[0].clone())
            .or_insert_with(|| Value::Object(Map::new()));
        set_path(child, &path[1..], value);
    }
}

fn remove_path(root: &mut Value, path: &[String]) {
    if path.is_empty() {
        return;
    }
    if let Some(obj) = root.as_object_mut() {
        if path.len() == 1 {
            obj.remove(&path[0]);
        } else if let Some(child) = obj.get_mut(&path[0]) {
            remove_path(child, &path[1..]);
        }
    }
}

/// Returns `spec` with every top-level or nested occurrence of an attribute
/// named in `attrs` removed.
///
/// Used to strip status-like (`status`, `output`, `obs`) or intent-like
/// (`intent`, `input`) attribute families before propagating a snapshot
/// across a mount boundary.
pub fn trim(spec: &Value, attrs: &[&str]) -> Value {
    let mut result = spec.clone();
    trim_in_place(&mut result, attrs);
    result
}

fn trim_in_place(value: &mut Value, attrs: &[&str]) {
    match value {
        Value::Object(map) => {
            map.retain(|k, _| !attrs.contains(&k.as_str()));
            for v in map.values_mut() {
                trim_in_place(v, attrs);
            }
        }
        Value::Array(items) => {
            for item in items {
                trim_in_place(item, attrs);
            }
        }
        _ => {}
    }
}
