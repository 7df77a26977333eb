//! Dynamic argument values handed to wrapped methods.
//!
//! Objects and arrays are shared, mutable nodes (`Arc<Mutex<..>>`), so a value
//! can reference itself. Identity of a node is the address of its allocation.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::method::AsyncMethod;

/// What a callback receives: `Err` fills the error slot, `Ok` carries the
/// success payload (the callback arguments after the error slot).
pub type CallOutcome = Result<Vec<ArgValue>, ArgValue>;

#[derive(Clone)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(ArrayNode),
    Object(ObjectNode),
    Function(Arc<dyn AsyncMethod>),
    Opaque(OpaqueHandle),
}

#[derive(Clone, Default)]
pub struct ObjectNode(Arc<Mutex<BTreeMap<String, ArgValue>>>);

#[derive(Clone, Default)]
pub struct ArrayNode(Arc<Mutex<Vec<ArgValue>>>);

/// A value that cannot be persisted. Only its `kind` survives encoding.
#[derive(Clone)]
pub struct OpaqueHandle {
    kind: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ObjectNode {
    pub fn insert(&self, key: impl Into<String>, value: ArgValue) -> Option<ArgValue> {
        self.0
            .lock()
            .expect("object node lock")
            .insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<ArgValue> {
        self.0.lock().expect("object node lock").get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<ArgValue> {
        self.0.lock().expect("object node lock").remove(key)
    }

    /// Members in key order. The lock is released before returning.
    pub fn entries(&self) -> Vec<(String, ArgValue)> {
        self.0
            .lock()
            .expect("object node lock")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("object node lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl ArrayNode {
    pub fn push(&self, value: ArgValue) {
        self.0.lock().expect("array node lock").push(value);
    }

    pub fn get(&self, index: usize) -> Option<ArgValue> {
        self.0.lock().expect("array node lock").get(index).cloned()
    }

    pub fn set(&self, index: usize, value: ArgValue) -> bool {
        let mut items = self.0.lock().expect("array node lock");
        match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn items(&self) -> Vec<ArgValue> {
        self.0.lock().expect("array node lock").clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("array node lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl OpaqueHandle {
    pub fn new(kind: impl Into<String>, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            kind: kind.into(),
            inner,
        }
    }

    /// Stand-in produced when a fixture is decoded; carries no payload.
    pub fn placeholder(kind: impl Into<String>) -> Self {
        Self::new(kind, Arc::new(()))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl ArgValue {
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ArgValue)>,
    {
        let node = ObjectNode::default();
        for (key, value) in entries {
            node.insert(key, value);
        }
        ArgValue::Object(node)
    }

    pub fn array<I>(items: I) -> Self
    where
        I: IntoIterator<Item = ArgValue>,
    {
        let node = ArrayNode::default();
        for item in items {
            node.push(item);
        }
        ArgValue::Array(node)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ArgValue::Null => "null",
            ArgValue::Bool(_) => "bool",
            ArgValue::Number(_) => "number",
            ArgValue::String(_) => "string",
            ArgValue::Array(_) => "array",
            ArgValue::Object(_) => "object",
            ArgValue::Function(_) => "function",
            ArgValue::Opaque(_) => "opaque",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectNode> {
        match self {
            ArgValue::Object(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayNode> {
        match self {
            ArgValue::Array(node) => Some(node),
            _ => None,
        }
    }

    /// Shorthand for `as_object()?.get(key)`.
    pub fn get(&self, key: &str) -> Option<ArgValue> {
        self.as_object().and_then(|node| node.get(key))
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Number(value.into())
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        ArgValue::Number(i64::from(value).into())
    }
}

impl From<u64> for ArgValue {
    fn from(value: u64) -> Self {
        ArgValue::Number(value.into())
    }
}

/// Non-finite floats have no JSON form and become `Null`.
impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value).map_or(ArgValue::Null, ArgValue::Number)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::String(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::String(value)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::Null, Into::into)
    }
}

/// Builds an acyclic value from plain JSON.
impl From<serde_json::Value> for ArgValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ArgValue::Null,
            serde_json::Value::Bool(b) => ArgValue::Bool(b),
            serde_json::Value::Number(n) => ArgValue::Number(n),
            serde_json::Value::String(s) => ArgValue::String(s),
            serde_json::Value::Array(items) => {
                ArgValue::array(items.into_iter().map(ArgValue::from))
            }
            serde_json::Value::Object(map) => {
                ArgValue::object(map.into_iter().map(|(k, v)| (k, ArgValue::from(v))))
            }
        }
    }
}

// Nodes print as `{..}` / `[..]` so that Debug terminates on cycles.
impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Null => write!(f, "Null"),
            ArgValue::Bool(b) => write!(f, "Bool({b})"),
            ArgValue::Number(n) => write!(f, "Number({n})"),
            ArgValue::String(s) => write!(f, "String({s:?})"),
            ArgValue::Array(node) => write!(f, "Array([..; {}])", node.len()),
            ArgValue::Object(node) => write!(f, "Object({{..; {}}})", node.len()),
            ArgValue::Function(_) => write!(f, "Function"),
            ArgValue::Opaque(handle) => write!(f, "Opaque({})", handle.kind),
        }
    }
}
