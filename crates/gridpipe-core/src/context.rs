//! Scalar key/value bag threaded through a pipeline run.
//!
//! Stages communicate downstream by writing scalars into the bag; later
//! stages read them by key. Values are restricted to scalars so the bag
//! stays serializable and cheap to clone between runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A scalar value a stage may publish for later stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ContextValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ContextValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric accessor; integers widen to f64.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ContextValue::Float(f) => Some(*f),
            ContextValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Bool(b)
    }
}

impl From<i64> for ContextValue {
    fn from(n: i64) -> Self {
        ContextValue::Int(n)
    }
}

impl From<f64> for ContextValue {
    fn from(f: f64) -> Self {
        ContextValue::Float(f)
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::Str(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::Str(s)
    }
}

/// Ordered map of scalars shared across the stages of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextBag {
    values: BTreeMap<String, ContextValue>,
}

impl ContextBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(ContextValue::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(ContextValue::as_int)
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(ContextValue::as_float)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(ContextValue::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
