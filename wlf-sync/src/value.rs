//! Helpers over the closed value model shared by server and client.
//!
//! Documents, roster entries and relay payloads are all `serde_json::Value`:
//! null, boolean, number, text, list, map. Decoding a frame into `Value` is
//! the sanitization step, since nothing outside that model survives it.

use serde::Serialize;
use serde_json::{Map, Value};
use std::io;

/// Structural comparison used to decide whether a roster entry changed.
///
/// Primitives compare by value. Lists compare index-wise and maps compare by
/// key set, but their elements are only compared at type level: a nested list
/// or map matches another of the same kind and the same length (or key set)
/// without its contents being inspected.
///
/// This is weaker than full deep equality. Two profiles that differ only
/// inside a nested map compare equal.
pub fn structural_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len()
                && left.iter().zip(right).all(|(l, r)| type_level_eq(l, r))
        }
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .all(|(key, l)| right.get(key).is_some_and(|r| type_level_eq(l, r)))
        }
        _ => primitive_eq(a, b),
    }
}

/// Element comparison inside a list or map: values for primitives, shape
/// only for containers.
fn type_level_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(left), Value::Array(right)) => left.len() == right.len(),
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len() && left.keys().all(|k| right.contains_key(k))
        }
        _ => primitive_eq(a, b),
    }
}

fn primitive_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(l), Value::Bool(r)) => l == r,
        // 1 and 1.0 are the same number on the wire
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => l == r,
        },
        (Value::String(l), Value::String(r)) => l == r,
        _ => false,
    }
}

/// `io::Write` sink that only counts bytes.
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Size of the compact JSON encoding of `value`, without allocating it.
///
/// Returns `usize::MAX` if the value cannot be serialized, so that a size
/// bound always rejects it.
pub fn serialized_size<T: Serialize + ?Sized>(value: &T) -> usize {
    let mut counter = ByteCounter(0);
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        Err(_) => usize::MAX,
    }
}

/// Write `value` at a dotted `path` inside `root`.
///
/// Missing or non-map intermediate nodes are replaced by empty maps. The leaf
/// is overwritten wholesale.
pub fn set_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or_default();

    let mut node = root;
    for segment in segments {
        let entry = node
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        node = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
    node.insert(leaf.to_string(), value);
}
