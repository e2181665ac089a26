//! Portable value graph for record content.
//!
//! Records travel between producer and consumer as JSON, using the DAG-JSON
//! conventions for the two types JSON cannot express directly:
//!
//! ```text
//! {"$link": "bafy..."}   content identifier reference
//! {"$bytes": "AAEC"}     raw bytes, base64
//! ```
//!
//! [`Value::from_json`] lifts those markers into typed variants, and
//! [`Value::resolve_blob_refs`] turns `{"$type": "blob", ...}` objects into
//! [`BlobRef`]s for the indexing sink.

use base64::Engine;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::{DecodePaddingMode, general_purpose};
use ipld_core::cid::Cid;
use std::collections::BTreeMap;

const LINK_KEY: &str = "$link";
const BYTES_KEY: &str = "$bytes";
const TYPE_KEY: &str = "$type";
const BLOB_TYPE: &str = "blob";

/// Base64 (standard alphabet) accepting input with or without padding.
const BYTES_DECODER: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A node in a record's content graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
    Link(Cid),
    Blob(BlobRef),
}

/// A resolved reference to an uploaded blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub cid: Cid,
    pub mime_type: String,
    pub size: u64,
}

impl Value {
    /// Convert a JSON value, lifting `$link` and `$bytes` markers.
    ///
    /// Never fails: a marker object is only special-cased when the marker is
    /// its sole key and the payload decodes. Anything else stays a plain map.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => {
                if obj.len() == 1 {
                    if let Some(serde_json::Value::String(link)) = obj.get(LINK_KEY)
                        && let Ok(cid) = link.parse::<Cid>()
                    {
                        return Value::Link(cid);
                    }
                    if let Some(serde_json::Value::String(encoded)) = obj.get(BYTES_KEY)
                        && let Ok(bytes) = BYTES_DECODER.decode(encoded)
                    {
                        return Value::Bytes(bytes);
                    }
                }
                Value::Map(
                    obj.into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Encode back to DAG-JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => map_to_json(map),
            Value::Bytes(bytes) => serde_json::json!({
                BYTES_KEY: general_purpose::STANDARD_NO_PAD.encode(bytes)
            }),
            Value::Link(cid) => serde_json::json!({ LINK_KEY: cid.to_string() }),
            Value::Blob(blob) => serde_json::json!({
                TYPE_KEY: BLOB_TYPE,
                "ref": { LINK_KEY: blob.cid.to_string() },
                "mimeType": blob.mime_type,
                "size": blob.size,
            }),
        }
    }

    /// Get a map entry by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Replace every nested `{"$type": "blob"}` object with a [`BlobRef`].
    ///
    /// Best effort: when a blob's identifier does not parse, a warning with
    /// the enclosing object is logged and the walk of that object stops,
    /// leaving the remaining siblings untouched. Returns `false` if any
    /// blob reference was left unresolved.
    pub fn resolve_blob_refs(&mut self) -> bool {
        match self {
            Value::Array(items) => items
                .iter_mut()
                .fold(true, |ok, item| resolve_child(item) && ok),
            Value::Map(map) => {
                let mut failed = None;
                let mut ok = true;
                for (key, value) in map.iter_mut() {
                    if !resolve_child(value) {
                        if value.is_blob_tagged() {
                            failed = Some(key.clone());
                            break;
                        }
                        ok = false;
                    }
                }

                if let Some(key) = failed {
                    tracing::warn!(
                        key = %key,
                        record = %map_to_json(map),
                        "failed to parse blob CID, leaving record partially converted"
                    );
                    return false;
                }
                ok
            }
            _ => true,
        }
    }

    fn is_blob_tagged(&self) -> bool {
        matches!(self.get(TYPE_KEY), Some(Value::String(t)) if t == BLOB_TYPE)
    }
}

/// Resolve a child value: convert it if it is a blob, otherwise walk into it.
fn resolve_child(value: &mut Value) -> bool {
    if value.is_blob_tagged() {
        match BlobRef::from_tagged(value) {
            Some(blob) => {
                *value = Value::Blob(blob);
                true
            }
            None => false,
        }
    } else {
        value.resolve_blob_refs()
    }
}

impl BlobRef {
    /// Build a blob reference from a `{"$type": "blob"}` object.
    fn from_tagged(value: &Value) -> Option<Self> {
        let cid = match value.get("ref")? {
            Value::Link(cid) => *cid,
            Value::Map(map) => match map.get(LINK_KEY)? {
                Value::String(s) => s.parse::<Cid>().ok()?,
                _ => return None,
            },
            Value::String(s) => s.parse::<Cid>().ok()?,
            _ => return None,
        };

        let mime_type = match value.get("mimeType") {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        let size = match value.get("size") {
            Some(Value::Integer(n)) => u64::try_from(*n).unwrap_or(0),
            _ => 0,
        };

        Some(Self {
            cid,
            mime_type,
            size,
        })
    }
}

fn map_to_json(map: &BTreeMap<String, Value>) -> serde_json::Value {
    serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}
