// rust/ptfu-core/src/codec/pickle.rs

use bytes::Bytes;
use serde_pickle::{DeOptions, HashableValue, Value};

use super::Decoder;
use crate::error::Result;
use crate::record::{ArrayData, NdArray, Record};

/// Python pickle members.
///
/// A dict holding a (possibly nested) `data` list of numbers becomes an array,
/// with an optional integer `label`. Any other pickle, including ones that
/// reference Python classes, is kept as raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickleDecoder;

enum Numbers {
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

impl Numbers {
    fn push(&mut self, value: &Value) -> bool {
        if matches!(value, Value::F64(_)) {
            if let Numbers::Ints(ints) = self {
                let floats = ints.iter().map(|&i| i as f64).collect();
                *self = Numbers::Floats(floats);
            }
        }
        match (self, value) {
            (Numbers::Ints(v), Value::I64(x)) => v.push(*x),
            (Numbers::Ints(v), Value::Bool(b)) => v.push(i64::from(*b)),
            (Numbers::Floats(v), Value::I64(x)) => v.push(*x as f64),
            (Numbers::Floats(v), Value::F64(x)) => v.push(*x),
            _ => return false,
        }
        true
    }
}

fn list_items(value: &Value) -> Option<&[Value]> {
    match value {
        Value::List(items) | Value::Tuple(items) => Some(items),
        _ => None,
    }
}

// Flattens a rectangular nested list, recording the extent of each level.
fn flatten(value: &Value, depth: usize, shape: &mut Vec<usize>, out: &mut Numbers) -> bool {
    match list_items(value) {
        Some(items) => {
            if shape.len() == depth {
                shape.push(items.len());
            } else if shape[depth] != items.len() {
                return false;
            }
            items.iter().all(|item| flatten(item, depth + 1, shape, out))
        }
        None => shape.len() == depth && out.push(value),
    }
}

fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Dict(map) => map
            .get(&HashableValue::String(key.to_string()))
            .or_else(|| map.get(&HashableValue::Bytes(key.as_bytes().to_vec()))),
        _ => None,
    }
}

fn to_array(data: &Value) -> Option<NdArray> {
    list_items(data)?;
    let mut shape = Vec::new();
    let mut numbers = Numbers::Ints(Vec::new());
    if !flatten(data, 0, &mut shape, &mut numbers) {
        return None;
    }
    let data: ArrayData = match numbers {
        Numbers::Ints(v) => v.into(),
        Numbers::Floats(v) => v.into(),
    };
    NdArray::new(shape, data).ok()
}

impl Decoder for PickleDecoder {
    fn decode(&self, name: &str, data: Bytes) -> Result<Record> {
        let value = match serde_pickle::value_from_slice(&data, DeOptions::new()) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(name, error = %e, "pickle kept as raw bytes");
                return Ok(Record::bytes(name, data));
            }
        };

        let Some(array) = lookup(&value, "data").and_then(to_array) else {
            return Ok(Record::bytes(name, data));
        };

        let mut record = Record::array(name, array);
        if let Some(Value::I64(label)) = lookup(&value, "label") {
            record.label = Some(*label);
        }
        Ok(record)
    }

    fn name(&self) -> &'static str {
        "pkl"
    }
}
