//! CRUD over the spatial elements living inside a document's surface block.
//!
//! Elements sit in the CRDT map at `surface.prop:elements.value`; the
//! wrapper and the inner map are both CRDT maps (see the sentinel-wrapper
//! helpers in [`crate::crdt`]). Factories assign a fresh id, a 31-bit
//! random seed, and a layer index strictly above every existing one.

use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as Json};
use yrs::{Map, MapPrelim, MapRef, ReadTxn, Text, TextPrelim, TransactionMut};

use crate::crdt::{
    self, any_from_json, create_wrapped_map, get_str, open_wrapped_map, out_to_json,
};
use crate::doc::blocks::BlockTree;
use crate::error::{ApiError, ErrorCode};
use crate::fractional;

fn new_element_id() -> String {
    nanoid::nanoid!(10)
}

fn new_seed() -> f64 {
    let seed: u32 = rand::thread_rng().gen::<u32>() & 0x7fff_ffff;
    seed as f64
}

/// Formats an `[x, y, w, h]` box the way the upstream serialises it: a JSON
/// array in a string, integers without a trailing `.0`.
pub fn xywh_to_string(xywh: &[f64]) -> String {
    let parts: Vec<String> = xywh
        .iter()
        .map(|n| {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{n}")
            }
        })
        .collect();
    format!("[{}]", parts.join(","))
}

pub fn xywh_from_string(raw: &str) -> Option<Vec<f64>> {
    serde_json::from_str::<Vec<f64>>(raw).ok()
}

fn require_xywh(xywh: &[f64]) -> Result<[f64; 4], ApiError> {
    <[f64; 4]>::try_from(xywh)
        .map_err(|_| ApiError::invalid("xywh must be a four-number array [x, y, w, h]"))
}

/// Creation payload for one edgeless element, tagged by type.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ElementInput {
    #[serde(rename_all = "camelCase")]
    Shape {
        shape_type: String,
        xywh: Vec<f64>,
        #[serde(default, alias = "fill")]
        fill_color: Option<Json>,
        #[serde(default, alias = "stroke")]
        stroke_color: Option<Json>,
        #[serde(default)]
        stroke_width: Option<f64>,
        #[serde(default)]
        filled: Option<bool>,
        #[serde(flatten)]
        extra: JsonMap<String, Json>,
    },
    #[serde(rename_all = "camelCase")]
    Connector {
        source_id: String,
        target_id: String,
        #[serde(default)]
        source_pos: Option<[f64; 2]>,
        #[serde(default)]
        target_pos: Option<[f64; 2]>,
        #[serde(default)]
        stroke: Option<Json>,
        #[serde(flatten)]
        extra: JsonMap<String, Json>,
    },
    #[serde(rename_all = "camelCase")]
    Text {
        text: String,
        xywh: Vec<f64>,
        #[serde(default)]
        font_size: Option<f64>,
        #[serde(default)]
        color: Option<Json>,
        #[serde(flatten)]
        extra: JsonMap<String, Json>,
    },
    #[serde(rename_all = "camelCase")]
    Brush {
        points: Vec<Vec<f64>>,
        #[serde(default)]
        color: Option<Json>,
        #[serde(default)]
        line_width: Option<f64>,
        #[serde(flatten)]
        extra: JsonMap<String, Json>,
    },
    Group {
        title: String,
        #[serde(default)]
        children: Vec<String>,
        #[serde(flatten)]
        extra: JsonMap<String, Json>,
    },
    #[serde(rename_all = "camelCase")]
    Mindmap {
        root_node_id: String,
        #[serde(flatten)]
        extra: JsonMap<String, Json>,
    },
}

/// The inner elements map of a document's surface block.
pub struct SurfaceElements {
    elements: MapRef,
}

impl SurfaceElements {
    /// Opens the elements map behind the surface block's wrapper.
    pub fn open<T: ReadTxn>(txn: &T, tree: &BlockTree) -> Result<SurfaceElements, ApiError> {
        let surface_id = tree.surface_id(txn).ok_or_else(|| {
            ApiError::new(ErrorCode::CrdtApplyFailed, "document has no surface block")
        })?;
        let surface = tree.block(txn, &surface_id).expect("surface id resolved");
        let elements = open_wrapped_map(txn, &surface, "prop:elements").ok_or_else(|| {
            ApiError::new(
                ErrorCode::CrdtApplyFailed,
                "surface block has no elements container",
            )
        })?;
        Ok(SurfaceElements { elements })
    }

    /// Like [`SurfaceElements::open`] but repairs a missing wrapper, for
    /// documents created by older writers.
    pub fn open_or_create(
        txn: &mut TransactionMut<'_>,
        tree: &BlockTree,
    ) -> Result<SurfaceElements, ApiError> {
        if let Ok(open) = Self::open(txn, tree) {
            return Ok(open);
        }
        let surface_id = tree.surface_id(txn).ok_or_else(|| {
            ApiError::new(ErrorCode::CrdtApplyFailed, "document has no surface block")
        })?;
        let surface = tree.block(txn, &surface_id).expect("surface id resolved");
        let elements = create_wrapped_map(txn, &surface, "prop:elements");
        Ok(SurfaceElements { elements })
    }

    fn element<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<MapRef> {
        crdt::get_map(txn, &self.elements, id)
    }

    fn require_element<T: ReadTxn>(&self, txn: &T, id: &str) -> Result<MapRef, ApiError> {
        self.element(txn, id)
            .ok_or_else(|| ApiError::not_found(ErrorCode::ElementNotFound, "element", id))
    }

    /// A fresh layer index strictly greater than every existing one.
    fn next_index<T: ReadTxn>(&self, txn: &T) -> String {
        let indices: Vec<String> = self
            .elements
            .iter(txn)
            .filter_map(|(_, value)| crdt::as_map(value))
            .filter_map(|map| get_str(txn, &map, "index"))
            .collect();
        fractional::append_token(indices.iter().map(String::as_str))
    }

    /// Creates an element from its typed input; returns its id and JSON view.
    pub fn create(
        &self,
        txn: &mut TransactionMut<'_>,
        input: ElementInput,
    ) -> Result<(String, Json), ApiError> {
        let id = new_element_id();
        let index = self.next_index(txn);
        let seed = new_seed();

        let element = self.elements.insert(txn, id.as_str(), MapPrelim::default());
        element.insert(txn, "id", id.as_str());
        element.insert(txn, "index", index.as_str());
        element.insert(txn, "seed", seed);

        match input {
            ElementInput::Shape {
                shape_type,
                xywh,
                fill_color,
                stroke_color,
                stroke_width,
                filled,
                extra,
            } => {
                let xywh = require_xywh(&xywh)?;
                element.insert(txn, "type", "shape");
                element.insert(txn, "shapeType", shape_type.as_str());
                element.insert(txn, "xywh", xywh_to_string(&xywh).as_str());
                element.insert(
                    txn,
                    "fillColor",
                    any_from_json(&fill_color.unwrap_or_else(|| json!("#fff"))),
                );
                element.insert(
                    txn,
                    "strokeColor",
                    any_from_json(&stroke_color.unwrap_or_else(|| json!("#000"))),
                );
                element.insert(txn, "strokeWidth", stroke_width.unwrap_or(2.0));
                element.insert(txn, "filled", filled.unwrap_or(true));
                element.insert(txn, "strokeStyle", "solid");
                element.insert(txn, "rotate", 0.0);
                write_extra(txn, &element, &extra);
            }
            ElementInput::Connector {
                source_id,
                target_id,
                source_pos,
                target_pos,
                stroke,
                extra,
            } => {
                element.insert(txn, "type", "connector");
                element.insert(
                    txn,
                    "source",
                    any_from_json(&json!({
                        "id": source_id,
                        "position": source_pos.unwrap_or([1.0, 0.5]),
                    })),
                );
                element.insert(
                    txn,
                    "target",
                    any_from_json(&json!({
                        "id": target_id,
                        "position": target_pos.unwrap_or([0.0, 0.5]),
                    })),
                );
                element.insert(
                    txn,
                    "stroke",
                    any_from_json(&stroke.unwrap_or_else(|| json!("#929292"))),
                );
                element.insert(txn, "frontEndpointStyle", "None");
                element.insert(txn, "rearEndpointStyle", "Arrow");
                write_extra(txn, &element, &extra);
            }
            ElementInput::Text {
                text,
                xywh,
                font_size,
                color,
                extra,
            } => {
                let xywh = require_xywh(&xywh)?;
                element.insert(txn, "type", "text");
                let content = element.insert(txn, "text", TextPrelim::new(""));
                if !text.is_empty() {
                    content.insert(txn, 0, &text);
                }
                element.insert(txn, "xywh", xywh_to_string(&xywh).as_str());
                element.insert(txn, "fontSize", font_size.unwrap_or(16.0));
                element.insert(txn, "fontFamily", "blocksuite:surface:Inter");
                element.insert(
                    txn,
                    "color",
                    any_from_json(
                        &color.unwrap_or_else(|| json!({"dark": "#ffffff", "light": "#000000"})),
                    ),
                );
                write_extra(txn, &element, &extra);
            }
            ElementInput::Brush {
                points,
                color,
                line_width,
                extra,
            } => {
                if points.is_empty() {
                    return Err(ApiError::invalid("brush requires at least one point"));
                }
                let (xywh, rebased) = rebase_points(&points)?;
                element.insert(txn, "type", "brush");
                element.insert(txn, "points", any_from_json(&json!(rebased)));
                element.insert(txn, "xywh", xywh_to_string(&xywh).as_str());
                element.insert(
                    txn,
                    "color",
                    any_from_json(&color.unwrap_or_else(|| json!("#000000"))),
                );
                element.insert(txn, "lineWidth", line_width.unwrap_or(4.0));
                write_extra(txn, &element, &extra);
            }
            ElementInput::Group {
                title,
                children,
                extra,
            } => {
                element.insert(txn, "type", "group");
                element.insert(txn, "title", title.as_str());
                let child_map = create_wrapped_map(txn, &element, "children");
                for child in children {
                    child_map.insert(txn, child.as_str(), true);
                }
                write_extra(txn, &element, &extra);
            }
            ElementInput::Mindmap {
                root_node_id,
                extra,
            } => {
                element.insert(txn, "type", "mindmap");
                element.insert(txn, "layoutType", 0.0);
                element.insert(txn, "style", 1.0);
                let child_map = create_wrapped_map(txn, &element, "children");
                let root = child_map.insert(txn, root_node_id.as_str(), MapPrelim::default());
                root.insert(txn, "index", "a0");
                write_extra(txn, &element, &extra);
            }
        }

        let view = self
            .get(txn, &id)
            .expect("element was just created");
        Ok((id, view))
    }

    /// Shallow merge: provided keys assign; arrays and nested objects
    /// replace atomically. `xywh` arrays convert to the stored string form.
    pub fn update(
        &self,
        txn: &mut TransactionMut<'_>,
        id: &str,
        changes: &JsonMap<String, Json>,
    ) -> Result<Json, ApiError> {
        let element = self.require_element(txn, id)?;

        for (key, value) in changes {
            if key == "id" {
                continue;
            }
            if key == "xywh" {
                if let Json::Array(_) = value {
                    let xywh: Vec<f64> = serde_json::from_value(value.clone())
                        .map_err(|_| ApiError::invalid("xywh must contain numbers"))?;
                    let xywh = require_xywh(&xywh)?;
                    element.insert(txn, "xywh", xywh_to_string(&xywh).as_str());
                    continue;
                }
            }
            if let (Some(text), Json::String(content)) =
                (crdt::get_text(txn, &element, key), value)
            {
                crdt::replace_text(txn, &text, content);
                continue;
            }
            element.insert(txn, key.as_str(), any_from_json(value));
        }

        self.get(txn, id)
            .ok_or_else(|| ApiError::not_found(ErrorCode::ElementNotFound, "element", id))
    }

    pub fn delete(&self, txn: &mut TransactionMut<'_>, id: &str) -> Result<(), ApiError> {
        self.require_element(txn, id)?;
        self.elements.remove(txn, id);
        Ok(())
    }

    /// Removes references to the given ids from connectors, groups and
    /// mindmaps. Used by cascading block deletion and the optional element
    /// cleanup pass.
    pub fn scrub_references(&self, txn: &mut TransactionMut<'_>, removed: &[String]) {
        let ids: Vec<String> = self
            .elements
            .iter(txn)
            .map(|(id, _)| id.to_string())
            .collect();

        for element_id in ids {
            let Some(element) = self.element(txn, &element_id) else {
                continue;
            };
            match get_str(txn, &element, "type").as_deref() {
                Some("connector") => {
                    for endpoint in ["source", "target"] {
                        let reference = element
                            .get(txn, endpoint)
                            .map(|out| out_to_json(txn, &out))
                            .unwrap_or(Json::Null);
                        let Some(end_id) = reference.get("id").and_then(Json::as_str) else {
                            continue;
                        };
                        if removed.iter().any(|r| r == end_id) {
                            let mut scrubbed = reference.clone();
                            scrubbed.as_object_mut().unwrap().remove("id");
                            element.insert(txn, endpoint, any_from_json(&scrubbed));
                        }
                    }
                }
                Some("group") | Some("mindmap") => {
                    if let Some(children) = open_wrapped_map(txn, &element, "children") {
                        for removed_id in removed {
                            children.remove(txn, removed_id);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    pub fn ids<T: ReadTxn>(&self, txn: &T) -> Vec<String> {
        let mut ids: Vec<String> = self.elements.iter(txn).map(|(id, _)| id.to_string()).collect();
        ids.sort();
        ids
    }

    pub fn get<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<Json> {
        let element = self.element(txn, id)?;
        Some(element_view(txn, &element))
    }

    /// All elements, ordered by layer index.
    pub fn list<T: ReadTxn>(&self, txn: &T) -> Vec<Json> {
        let mut views: Vec<Json> = self
            .elements
            .iter(txn)
            .filter_map(|(_, value)| crdt::as_map(value))
            .map(|element| element_view(txn, &element))
            .collect();
        views.sort_by(|a, b| {
            let ka = a.get("index").and_then(Json::as_str).unwrap_or("");
            let kb = b.get("index").and_then(Json::as_str).unwrap_or("");
            ka.cmp(kb)
        });
        views
    }
}

/// Caller-facing view of one element: `xywh` exposed as a four-number
/// array, rich text as a string, children wrappers as their inner map.
fn element_view<T: ReadTxn>(txn: &T, element: &MapRef) -> Json {
    let mut view = match crdt::map_to_json(txn, element) {
        Json::Object(map) => map,
        _ => JsonMap::new(),
    };

    if let Some(Json::String(raw)) = view.get("xywh") {
        if let Some(xywh) = xywh_from_string(raw) {
            view.insert("xywh".to_owned(), json!(xywh));
        }
    }

    if let Some(children) = view.get("children") {
        if let Some(inner) = children.get("value") {
            let inner = inner.clone();
            view.insert("children".to_owned(), inner);
        }
    }

    Json::Object(view)
}

/// Stores caller-provided fields beyond the factory vocabulary as given
/// (palette tokens, rotation, roughness and the like). Engine-assigned
/// identity fields cannot be overridden.
fn write_extra(
    txn: &mut TransactionMut<'_>,
    element: &MapRef,
    extra: &JsonMap<String, Json>,
) {
    for (key, value) in extra {
        if matches!(key.as_str(), "id" | "index" | "seed" | "type") {
            continue;
        }
        if key == "xywh" && value.is_array() {
            if let Ok(xywh) = serde_json::from_value::<Vec<f64>>(value.clone()) {
                if let Ok(xywh) = require_xywh(&xywh) {
                    element.insert(txn, "xywh", xywh_to_string(&xywh).as_str());
                    continue;
                }
            }
        }
        element.insert(txn, key.as_str(), any_from_json(value));
    }
}

/// Computes the bounding box of a stroke and rebases its points to be
/// relative to it. Points are `[x, y, pressure?]`.
fn rebase_points(points: &[Vec<f64>]) -> Result<([f64; 4], Vec<Vec<f64>>), ApiError> {
    let mut min_x = f64::INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut max_y = f64::NEG_INFINITY;

    for point in points {
        let (x, y) = match point.as_slice() {
            [x, y, ..] => (*x, *y),
            _ => return Err(ApiError::invalid("brush points must be [x, y] pairs")),
        };
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }

    let rebased = points
        .iter()
        .map(|point| {
            let mut moved = point.clone();
            moved[0] -= min_x;
            moved[1] -= min_y;
            moved
        })
        .collect();

    Ok(([min_x, min_y, max_x - min_x, max_y - min_y], rebased))
}
