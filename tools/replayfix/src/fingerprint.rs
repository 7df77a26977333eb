//! Cycle-safe canonical encoding of call arguments.
//!
//! The encoder walks the value graph depth-first and remembers which nodes are
//! on the current traversal stack. A node reached again while it is still on
//! the stack is written as a `BackRef` to the path where it was entered, so
//! every graph (cyclic or not) encodes to a finite tree.
//!
//! Paths are rooted at `$`. Array members append `[index]` and object members
//! append `["key"]` with the key JSON-escaped. Object keys are always emitted
//! in sorted order.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::value::{ArgValue, ArrayNode, ObjectNode, OpaqueHandle};

/// Nesting depth past which a subtree is replaced by a placeholder.
pub const MAX_DEPTH: usize = 512;

pub const DEPTH_LIMIT_KIND: &str = "depth_limit";

const ROOT_PATH: &str = "$";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CanonicalForm {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<CanonicalForm>),
    Object(BTreeMap<String, CanonicalForm>),
    /// Path of the ancestor this position points back to.
    BackRef(String),
    /// A value kind that cannot be persisted, identified by kind only.
    Unsupported(String),
}

impl CanonicalForm {
    /// First 16 hex chars of the SHA-256 of the JSON rendering.
    pub fn digest(&self) -> String {
        let rendered = serde_json::to_string(self).unwrap_or_default();
        let hash = Sha256::digest(rendered.as_bytes());
        hash[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

pub fn encode(value: &ArgValue) -> CanonicalForm {
    Encoder::default().encode(value, ROOT_PATH, 0)
}

/// Encodes an argument list as an array rooted at `$`.
pub fn encode_args(args: &[ArgValue]) -> CanonicalForm {
    let mut encoder = Encoder::default();
    CanonicalForm::Array(
        args.iter()
            .enumerate()
            .map(|(idx, arg)| encoder.encode(arg, &index_path(ROOT_PATH, idx), 1))
            .collect(),
    )
}

/// Rebuilds a value graph. Back-references resolve to the rebuilt ancestor,
/// so cycles come back as cycles; unknown paths decode to `Null`.
pub fn decode(form: &CanonicalForm) -> ArgValue {
    Decoder::default().decode(form, ROOT_PATH)
}

/// Inverse of [`encode_args`]. A non-array form decodes to a single argument.
pub fn decode_args(form: &CanonicalForm) -> Vec<ArgValue> {
    match decode(form) {
        ArgValue::Array(node) => node.items(),
        other => vec![other],
    }
}

fn index_path(parent: &str, idx: usize) -> String {
    format!("{parent}[{idx}]")
}

fn key_path(parent: &str, key: &str) -> String {
    let quoted = serde_json::to_string(key).unwrap_or_else(|_| format!("{key:?}"));
    format!("{parent}[{quoted}]")
}

#[derive(Default)]
struct Encoder {
    on_stack: HashMap<usize, String>,
}

impl Encoder {
    fn encode(&mut self, value: &ArgValue, path: &str, depth: usize) -> CanonicalForm {
        if depth > MAX_DEPTH {
            return CanonicalForm::Unsupported(DEPTH_LIMIT_KIND.to_string());
        }
        match value {
            ArgValue::Null => CanonicalForm::Null,
            ArgValue::Bool(b) => CanonicalForm::Bool(*b),
            ArgValue::Number(n) => CanonicalForm::Number(n.clone()),
            ArgValue::String(s) => CanonicalForm::String(s.clone()),
            ArgValue::Array(node) => self.encode_array(node, path, depth),
            ArgValue::Object(node) => self.encode_object(node, path, depth),
            ArgValue::Function(_) => CanonicalForm::Unsupported("function".to_string()),
            ArgValue::Opaque(handle) => CanonicalForm::Unsupported(handle.kind().to_string()),
        }
    }

    fn encode_array(&mut self, node: &ArrayNode, path: &str, depth: usize) -> CanonicalForm {
        let id = node.identity();
        if let Some(ancestor) = self.on_stack.get(&id) {
            return CanonicalForm::BackRef(ancestor.clone());
        }
        self.on_stack.insert(id, path.to_string());
        let items = node
            .items()
            .iter()
            .enumerate()
            .map(|(idx, item)| self.encode(item, &index_path(path, idx), depth + 1))
            .collect();
        self.on_stack.remove(&id);
        CanonicalForm::Array(items)
    }

    fn encode_object(&mut self, node: &ObjectNode, path: &str, depth: usize) -> CanonicalForm {
        let id = node.identity();
        if let Some(ancestor) = self.on_stack.get(&id) {
            return CanonicalForm::BackRef(ancestor.clone());
        }
        self.on_stack.insert(id, path.to_string());
        let members = node
            .entries()
            .into_iter()
            .map(|(key, member)| {
                let encoded = self.encode(&member, &key_path(path, &key), depth + 1);
                (key, encoded)
            })
            .collect();
        self.on_stack.remove(&id);
        CanonicalForm::Object(members)
    }
}

#[derive(Default)]
struct Decoder {
    ancestors: HashMap<String, ArgValue>,
}

impl Decoder {
    fn decode(&mut self, form: &CanonicalForm, path: &str) -> ArgValue {
        match form {
            CanonicalForm::Null => ArgValue::Null,
            CanonicalForm::Bool(b) => ArgValue::Bool(*b),
            CanonicalForm::Number(n) => ArgValue::Number(n.clone()),
            CanonicalForm::String(s) => ArgValue::String(s.clone()),
            CanonicalForm::Array(items) => {
                let node = ArrayNode::default();
                self.ancestors
                    .insert(path.to_string(), ArgValue::Array(node.clone()));
                for (idx, item) in items.iter().enumerate() {
                    let value = self.decode(item, &index_path(path, idx));
                    node.push(value);
                }
                self.ancestors.remove(path);
                ArgValue::Array(node)
            }
            CanonicalForm::Object(members) => {
                let node = ObjectNode::default();
                self.ancestors
                    .insert(path.to_string(), ArgValue::Object(node.clone()));
                for (key, member) in members {
                    let value = self.decode(member, &key_path(path, key));
                    node.insert(key.clone(), value);
                }
                self.ancestors.remove(path);
                ArgValue::Object(node)
            }
            CanonicalForm::BackRef(target) => {
                self.ancestors.get(target).cloned().unwrap_or(ArgValue::Null)
            }
            CanonicalForm::Unsupported(kind) => {
                ArgValue::Opaque(OpaqueHandle::placeholder(kind.clone()))
            }
        }
    }
}
