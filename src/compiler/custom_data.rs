//! External data read by `$name` accesses

use crate::error::{Error, Result};
use crate::runtime::Word;
use crate::types::{ScalarKind, Type};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One named value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CustomValue {
    /// bool
    Bool(bool),
    /// int16
    Int16(i16),
    /// int32
    Int32(i32),
    /// int64
    Int64(i64),
    /// float
    Float(f32),
    /// double
    Double(f64),
    /// Vector or matrix
    Array {
        /// Element kind
        elem: ScalarKind,
        /// Elements, row-major for matrices
        values: Vec<f64>,
    },
    /// string
    String(String),
}

impl CustomValue {
    /// Type of the value
    pub fn ty(&self) -> Type {
        match self {
            CustomValue::Bool(_) => Type::BOOL,
            CustomValue::Int16(_) => Type::INT16,
            CustomValue::Int32(_) => Type::INT32,
            CustomValue::Int64(_) => Type::INT64,
            CustomValue::Float(_) => Type::FLOAT,
            CustomValue::Double(_) => Type::DOUBLE,
            CustomValue::Array { elem, values } => Type::array(*elem, values.len()),
            CustomValue::String(_) => Type::String,
        }
    }

    /// Scalar or array elements as words; empty for strings
    pub fn words(&self) -> Vec<Word> {
        match self {
            CustomValue::Bool(v) => vec![Word::Bool(*v)],
            CustomValue::Int16(v) => vec![Word::I16(*v)],
            CustomValue::Int32(v) => vec![Word::I32(*v)],
            CustomValue::Int64(v) => vec![Word::I64(*v)],
            CustomValue::Float(v) => vec![Word::F32(*v)],
            CustomValue::Double(v) => vec![Word::F64(*v)],
            CustomValue::Array { elem, values } => {
                values.iter().map(|v| Word::from_f64(*elem, *v)).collect()
            }
            CustomValue::String(_) => Vec::new(),
        }
    }

    /// Vector of three floats
    pub fn vec3f(v: [f32; 3]) -> Self {
        CustomValue::Array {
            elem: ScalarKind::Float,
            values: v.iter().map(|x| *x as f64).collect(),
        }
    }
}

/// Named typed values bound to an executable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    values: BTreeMap<String, CustomValue>,
}

impl CustomData {
    /// Create empty custom data
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    pub fn insert(&mut self, name: &str, value: CustomValue) {
        self.values.insert(name.to_string(), value);
    }

    /// Look up a value
    pub fn get(&self, name: &str) -> Option<&CustomValue> {
        self.values.get(name)
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over (name, value) pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &CustomValue)> {
        self.values.iter()
    }

    /// Build from a flat JSON object
    ///
    /// Numbers with a fractional part become floats, other numbers int32
    /// (int64 when out of range). Arrays of 2-4, 9 or 16 numbers become
    /// vectors or matrices; strings and bools map directly.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::execution(format!("invalid custom data JSON: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::execution("custom data JSON must be an object"))?;

        let mut data = CustomData::new();
        for (name, v) in object {
            data.insert(name, json_value(name, v)?);
        }
        Ok(data)
    }
}

fn json_value(name: &str, v: &serde_json::Value) -> Result<CustomValue> {
    use serde_json::Value;
    match v {
        Value::Bool(b) => Ok(CustomValue::Bool(*b)),
        Value::String(s) => Ok(CustomValue::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(match i32::try_from(i) {
                    Ok(small) => CustomValue::Int32(small),
                    Err(_) => CustomValue::Int64(i),
                })
            } else {
                Ok(CustomValue::Float(n.as_f64().unwrap_or_default() as f32))
            }
        }
        Value::Array(items) if matches!(items.len(), 2..=4 | 9 | 16) => {
            let mut values = Vec::with_capacity(items.len());
            let mut all_int = true;
            for item in items {
                let n = item.as_f64().ok_or_else(|| {
                    Error::execution(format!("custom data \"{}\" has a non-numeric element", name))
                })?;
                all_int &= item.is_i64();
                values.push(n);
            }
            let elem = if all_int && items.len() <= 4 {
                ScalarKind::Int32
            } else {
                ScalarKind::Float
            };
            Ok(CustomValue::Array { elem, values })
        }
        _ => Err(Error::execution(format!(
            "custom data \"{}\" has an unsupported JSON value",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        let data =
            CustomData::from_json(r#"{"scale": 2.5, "seed": 7, "offset": [1.0, 0.5, 0.0], "tag": "a"}"#)
                .unwrap();
        assert_eq!(data.get("scale"), Some(&CustomValue::Float(2.5)));
        assert_eq!(data.get("seed"), Some(&CustomValue::Int32(7)));
        assert_eq!(
            data.get("offset").map(|v| v.ty()),
            Some(Type::vec(ScalarKind::Float, 3))
        );
        assert_eq!(data.get("tag").map(|v| v.ty()), Some(Type::String));
    }

    #[test]
    fn test_from_json_rejects_nested_objects() {
        assert!(CustomData::from_json(r#"{"a": {"b": 1}}"#).is_err());
        assert!(CustomData::from_json("[1, 2]").is_err());
    }
}
