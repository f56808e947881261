//! CRDT runtime adapter. Everything above this module treats a document as
//! an opaque [`Replica`] with typed containers; everything below it is the
//! `yrs` wire machinery (v1 update encoding, state vectors).
//!
//! The one structural rule this module exists to enforce: every nested
//! container inside a document must itself be a CRDT container. The
//! upstream tags wrapper maps with a sentinel `type` key; building the
//! wrapper as a plain JSON object silently corrupts serialization, so the
//! wrapper helpers here are the only way call sites create or open one.

use std::collections::HashMap;

use serde_json::Value as Json;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector,
    Text, TextRef, Transact, TransactionMut, Update,
};

use crate::error::ApiError;

/// Sentinel value of the `type` key on wrapper maps around native CRDT
/// containers, as used by the upstream's block schema.
pub const NATIVE_WRAPPER_TYPE: &str = "$blocksuite:internal:native$";

/// A local replica of one upstream document.
///
/// Mutation is synchronous CPU work; the owner is responsible for not
/// interleaving mutations of the same replica (the composer keeps one
/// replica per request, the broadcast fabric wraps shared replicas in an
/// async lock).
pub struct Replica {
    doc: Doc,
}

impl Replica {
    pub fn new() -> Replica {
        Replica { doc: Doc::new() }
    }

    /// Builds a replica from a full update, as returned by `space:load-doc`.
    pub fn from_update(update: &[u8]) -> Result<Replica, ApiError> {
        let replica = Replica::new();
        replica.apply_update(update)?;
        Ok(replica)
    }

    pub fn apply_update(&self, update: &[u8]) -> Result<(), ApiError> {
        let update = Update::decode_v1(update).map_err(ApiError::crdt)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(ApiError::crdt)?;
        Ok(())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Encodes the diff since `base`, or the whole state when `base` is
    /// `None`.
    pub fn encode_update_since(&self, base: Option<&[u8]>) -> Result<Vec<u8>, ApiError> {
        let sv = match base {
            Some(bytes) => StateVector::decode_v1(bytes).map_err(ApiError::crdt)?,
            None => StateVector::default(),
        };
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn map(&self, name: &str) -> MapRef {
        self.doc.get_or_insert_map(name)
    }

    pub fn array(&self, name: &str) -> ArrayRef {
        self.doc.get_or_insert_array(name)
    }

    pub fn text(&self, name: &str) -> TextRef {
        self.doc.get_or_insert_text(name)
    }

    pub fn transact(&self) -> yrs::Transaction<'_> {
        self.doc.transact()
    }

    pub fn transact_mut(&self) -> TransactionMut<'_> {
        self.doc.transact_mut()
    }
}

impl Default for Replica {
    fn default() -> Self {
        Replica::new()
    }
}

/// Creates a sentinel-tagged wrapper under `key` and returns the inner
/// `value` map. Both levels are CRDT maps.
pub fn create_wrapped_map(txn: &mut TransactionMut<'_>, parent: &MapRef, key: &str) -> MapRef {
    let wrapper = parent.insert(txn, key, MapPrelim::default());
    wrapper.insert(txn, "type", NATIVE_WRAPPER_TYPE);
    wrapper.insert(txn, "value", MapPrelim::default())
}

/// Opens the inner `value` map of a sentinel-tagged wrapper.
pub fn open_wrapped_map<T: ReadTxn>(txn: &T, parent: &MapRef, key: &str) -> Option<MapRef> {
    let wrapper = as_map(parent.get(txn, key)?)?;
    as_map(wrapper.get(txn, "value")?)
}

pub fn as_map(out: Out) -> Option<MapRef> {
    match out {
        Out::YMap(map) => Some(map),
        _ => None,
    }
}

pub fn as_array(out: Out) -> Option<ArrayRef> {
    match out {
        Out::YArray(array) => Some(array),
        _ => None,
    }
}

pub fn as_text(out: Out) -> Option<TextRef> {
    match out {
        Out::YText(text) => Some(text),
        _ => None,
    }
}

pub fn get_map<T: ReadTxn>(txn: &T, parent: &MapRef, key: &str) -> Option<MapRef> {
    parent.get(txn, key).and_then(as_map)
}

pub fn get_array<T: ReadTxn>(txn: &T, parent: &MapRef, key: &str) -> Option<ArrayRef> {
    parent.get(txn, key).and_then(as_array)
}

pub fn get_text<T: ReadTxn>(txn: &T, parent: &MapRef, key: &str) -> Option<TextRef> {
    parent.get(txn, key).and_then(as_text)
}

pub fn get_str<T: ReadTxn>(txn: &T, parent: &MapRef, key: &str) -> Option<String> {
    match parent.get(txn, key)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        Out::YText(text) => Some(text.get_string(txn)),
        _ => None,
    }
}

pub fn get_bool<T: ReadTxn>(txn: &T, parent: &MapRef, key: &str) -> Option<bool> {
    match parent.get(txn, key)? {
        Out::Any(Any::Bool(b)) => Some(b),
        _ => None,
    }
}

pub fn get_number<T: ReadTxn>(txn: &T, parent: &MapRef, key: &str) -> Option<f64> {
    match parent.get(txn, key)? {
        Out::Any(Any::Number(n)) => Some(n),
        Out::Any(Any::BigInt(n)) => Some(n as f64),
        _ => None,
    }
}

/// JSON → `Any`, for scalar and plain-structure values. Containers that
/// must be collaborative are created through CRDT prelims instead; this is
/// only for leaf values (numbers, strings, plain arrays like `xywh`
/// payloads, plain records like theme colors).
pub fn any_from_json(value: &Json) -> Any {
    match value {
        Json::Null => Any::Null,
        Json::Bool(b) => Any::Bool(*b),
        Json::Number(n) => Any::Number(n.as_f64().unwrap_or(0.0)),
        Json::String(s) => Any::from(s.as_str()),
        Json::Array(items) => {
            let items: Vec<Any> = items.iter().map(any_from_json).collect();
            Any::Array(items.into())
        }
        Json::Object(fields) => {
            let fields: HashMap<String, Any> = fields
                .iter()
                .map(|(k, v)| (k.clone(), any_from_json(v)))
                .collect();
            Any::Map(fields.into())
        }
    }
}

pub fn any_to_json(value: &Any) -> Json {
    match value {
        Any::Null | Any::Undefined => Json::Null,
        Any::Bool(b) => Json::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Any::BigInt(n) => Json::from(*n),
        Any::String(s) => Json::String(s.to_string()),
        Any::Buffer(bytes) => {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine as _;
            Json::String(STANDARD.encode(bytes.as_ref()))
        }
        Any::Array(items) => Json::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => {
            let mut out = serde_json::Map::new();
            for (key, value) in fields.iter() {
                out.insert(key.clone(), any_to_json(value));
            }
            Json::Object(out)
        }
    }
}

/// Materialises any container value as JSON: CRDT maps become objects,
/// CRDT arrays become arrays, CRDT text becomes its string content.
pub fn out_to_json<T: ReadTxn>(txn: &T, out: &Out) -> Json {
    match out {
        Out::Any(any) => any_to_json(any),
        Out::YText(text) => Json::String(text.get_string(txn)),
        Out::YArray(array) => Json::Array(array.iter(txn).map(|v| out_to_json(txn, &v)).collect()),
        Out::YMap(map) => {
            let mut object = serde_json::Map::new();
            for (key, value) in map.iter(txn) {
                object.insert(key.to_string(), out_to_json(txn, &value));
            }
            Json::Object(object)
        }
        _ => Json::Null,
    }
}

pub fn map_to_json<T: ReadTxn>(txn: &T, map: &MapRef) -> Json {
    out_to_json(txn, &Out::YMap(map.clone()))
}

/// Replaces the whole content of a CRDT text atomically within the current
/// transaction: delete everything, insert the new string.
pub fn replace_text(txn: &mut TransactionMut<'_>, text: &TextRef, content: &str) {
    let len = text.len(txn);
    if len > 0 {
        text.remove_range(txn, 0, len);
    }
    if !content.is_empty() {
        text.insert(txn, 0, content);
    }
}

/// Applies a structured rich-text value (a delta-style list of inserts,
/// each optionally attributed) onto an empty CRDT text.
pub fn apply_text_delta(
    txn: &mut TransactionMut<'_>,
    text: &TextRef,
    delta: &[Json],
) -> Result<(), ApiError> {
    for op in delta {
        let insert = op
            .get("insert")
            .and_then(Json::as_str)
            .ok_or_else(|| ApiError::invalid("rich-text delta op is missing `insert`"))?;

        let index = text.len(txn);
        match op.get("attributes").and_then(Json::as_object) {
            Some(attributes) if !attributes.is_empty() => {
                let attrs: yrs::types::Attrs = attributes
                    .iter()
                    .map(|(k, v)| (k.as_str().into(), any_from_json(v)))
                    .collect();
                text.insert_with_attributes(txn, index, insert, attrs);
            }
            _ => text.insert(txn, index, insert),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_round_trip_between_replicas() {
        let source = Replica::new();
        {
            let map = source.map("meta");
            let mut txn = source.transact_mut();
            map.insert(&mut txn, "name", "Workspace One");
        }

        let update = source.encode_update_since(None).unwrap();
        let copy = Replica::from_update(&update).unwrap();

        let map = copy.map("meta");
        let txn = copy.transact();
        assert_eq!(
            get_str(&txn, &map, "name").as_deref(),
            Some("Workspace One")
        );
    }

    #[test]
    fn encode_since_state_vector_is_incremental() {
        let replica = Replica::new();
        {
            let map = replica.map("meta");
            let mut txn = replica.transact_mut();
            map.insert(&mut txn, "first", 1.0);
        }
        let sv = replica.state_vector();
        {
            let map = replica.map("meta");
            let mut txn = replica.transact_mut();
            map.insert(&mut txn, "second", 2.0);
        }

        let diff = replica.encode_update_since(Some(&sv)).unwrap();
        let full = replica.encode_update_since(None).unwrap();
        assert!(diff.len() < full.len());

        // The diff alone carries the second key when applied on top of a
        // replica that already has the first.
        let peer = Replica::new();
        peer.apply_update(&full).unwrap();
        let map = peer.map("meta");
        let txn = peer.transact();
        assert_eq!(get_number(&txn, &map, "second"), Some(2.0));
    }

    #[test]
    fn wrapped_map_survives_serialization() {
        let replica = Replica::new();
        {
            let root = replica.map("blocks");
            let mut txn = replica.transact_mut();
            let surface = root.insert(&mut txn, "surface-1", MapPrelim::default());
            let elements = create_wrapped_map(&mut txn, &surface, "prop:elements");
            let element = elements.insert(&mut txn, "el-1", MapPrelim::default());
            element.insert(&mut txn, "type", "shape");
        }

        let update = replica.encode_update_since(None).unwrap();
        let decoded = Replica::from_update(&update).unwrap();

        let root = decoded.map("blocks");
        let txn = decoded.transact();
        let surface = get_map(&txn, &root, "surface-1").unwrap();
        let elements = open_wrapped_map(&txn, &surface, "prop:elements").unwrap();
        let element = get_map(&txn, &elements, "el-1").unwrap();
        assert_eq!(get_str(&txn, &element, "type").as_deref(), Some("shape"));

        // The wrapper decodes by element id, not as CRDT-internal fields.
        let wrapper = get_map(&txn, &surface, "prop:elements").unwrap();
        let json = map_to_json(&txn, &wrapper);
        assert_eq!(json["type"], json!(NATIVE_WRAPPER_TYPE));
        assert_eq!(json["value"]["el-1"]["type"], json!("shape"));
    }

    #[test]
    fn json_any_round_trip() {
        let value = json!({
            "string": "s",
            "number": 4.5,
            "bool": true,
            "null": null,
            "array": [1.0, "two"],
            "nested": {"dark": "#fff", "light": "#000"},
        });
        assert_eq!(any_to_json(&any_from_json(&value)), value);
    }

    #[test]
    fn replace_text_is_atomic_per_transaction() {
        let replica = Replica::new();
        let text = replica.text("title");
        {
            let mut txn = replica.transact_mut();
            text.insert(&mut txn, 0, "old title");
        }
        {
            let mut txn = replica.transact_mut();
            replace_text(&mut txn, &text, "new");
        }
        let txn = replica.transact();
        assert_eq!(text.get_string(&txn), "new");
    }
}
