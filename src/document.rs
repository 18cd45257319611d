// src/document.rs
// The document shape this core agrees on with its callers: an
// application-defined JSON object carrying a handful of well-known,
// engine-managed fields alongside arbitrary application data.

use serde_json::{Map, Value};

use crate::revision::Revision;

pub const FIELD_REV: &str = "_rev";
pub const FIELD_DELETED: &str = "_deleted";
pub const FIELD_ATTACHMENTS: &str = "_attachments";
pub const FIELD_LAST_WRITE_AT: &str = "$lastWriteAt";

/// Document identifier. The core treats ids opaquely - whatever the
/// schema's primary-key path resolves to, stringified for use as a
/// table key.
pub type DocId = String;

/// The primary-key path, which may itself be a compound specification
/// made of several fields.
#[derive(Debug, Clone)]
pub enum PrimaryKey {
    Single(String),
    Compound(Vec<String>),
}

impl PrimaryKey {
    /// Resolve the id of `doc`, joining compound parts with `|` the way
    /// RxDB flattens compound primary keys into a single storage key.
    pub fn extract(&self, doc: &Value) -> Option<DocId> {
        match self {
            PrimaryKey::Single(field) => value_to_id(doc.get(field)?),
            PrimaryKey::Compound(fields) => {
                let mut parts = Vec::with_capacity(fields.len());
                for field in fields {
                    parts.push(value_to_id(doc.get(field)?)?);
                }
                Some(parts.join("|"))
            }
        }
    }
}

fn value_to_id(value: &Value) -> Option<DocId> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `true` if the document carries the tombstone flag.
pub fn is_deleted(doc: &Value) -> bool {
    doc.get(FIELD_DELETED).and_then(Value::as_bool).unwrap_or(false)
}

/// The document's current `_rev` string, if present and well-formed.
pub fn get_rev(doc: &Value) -> Option<&str> {
    doc.get(FIELD_REV).and_then(Value::as_str)
}

fn as_object_mut(doc: &mut Value) -> &mut Map<String, Value> {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    doc.as_object_mut().expect("just coerced to object")
}

pub fn set_rev(doc: &mut Value, rev: &Revision) {
    as_object_mut(doc).insert(FIELD_REV.to_string(), Value::String(rev.to_string()));
}

pub fn set_deleted(doc: &mut Value, deleted: bool) {
    as_object_mut(doc).insert(FIELD_DELETED.to_string(), Value::Bool(deleted));
}

pub fn set_last_write_at(doc: &mut Value, millis: i64) {
    as_object_mut(doc).insert(FIELD_LAST_WRITE_AT.to_string(), Value::from(millis));
}

pub fn ensure_attachments(doc: &mut Value) {
    let map = as_object_mut(doc);
    map.entry(FIELD_ATTACHMENTS.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
}

pub fn last_write_at(doc: &Value) -> Option<i64> {
    doc.get(FIELD_LAST_WRITE_AT).and_then(Value::as_i64)
}

/// Strip fields that are purely internal bookkeeping (the `$lastWriteAt`
/// secondary-index key) before handing a document back to a caller.
/// `_rev`, `_deleted`, and `_attachments` remain: they are part of the
/// document model callers are contractually aware of.
pub fn strip_engine_private(doc: &Value) -> Value {
    let mut out = doc.clone();
    if let Some(map) = out.as_object_mut() {
        map.remove(FIELD_LAST_WRITE_AT);
    }
    out
}
