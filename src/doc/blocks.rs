//! The in-memory shape of a content document: a connected block tree rooted
//! at a single page block, stored in the replica's root `blocks` map. Each
//! block is a CRDT map carrying `sys:*` structure fields and `prop:*`
//! payload fields; rich content is CRDT text end-to-end.

use serde_json::{json, Map as JsonMap, Value as Json};
use yrs::{Any, Array, ArrayPrelim, ArrayRef, Map, MapPrelim, MapRef, ReadTxn, Text, TextPrelim, TransactionMut};

use crate::crdt::{
    self, any_from_json, apply_text_delta, create_wrapped_map, get_array, get_str, out_to_json,
    replace_text, Replica,
};
use crate::doc::markdown::BlockSpec;
use crate::error::{ApiError, ErrorCode};

pub mod flavours {
    pub const PAGE: &str = "affine:page";
    pub const NOTE: &str = "affine:note";
    pub const SURFACE: &str = "affine:surface";
    pub const PARAGRAPH: &str = "affine:paragraph";
    pub const LIST: &str = "affine:list";
    pub const CODE: &str = "affine:code";
    pub const TABLE: &str = "affine:table";
    pub const IMAGE: &str = "affine:image";
    pub const LINKED_DOC: &str = "affine:embed-linked-doc";
}

/// Authorship identity and clock stamped onto every block mutation.
#[derive(Debug, Clone)]
pub struct Stamp {
    pub user_id: String,
    pub at_ms: i64,
}

impl Stamp {
    pub fn now(user_id: impl Into<String>) -> Stamp {
        Stamp {
            user_id: user_id.into(),
            at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Where to attach a new block among its parent's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    Start,
    #[default]
    End,
    At(u32),
}

impl Position {
    /// Accepts `"start"`, `"end"` or a numeric index.
    pub fn from_json(value: &Json) -> Result<Position, ApiError> {
        match value {
            Json::String(s) if s == "start" => Ok(Position::Start),
            Json::String(s) if s == "end" => Ok(Position::End),
            Json::Number(n) => n
                .as_u64()
                .map(|i| Position::At(i as u32))
                .ok_or_else(|| ApiError::invalid("position index must be a non-negative integer")),
            _ => Err(ApiError::invalid(
                "position must be \"start\", \"end\" or an index",
            )),
        }
    }
}

/// A decoded block, with children resolved recursively.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BlockNode {
    pub id: String,
    pub flavour: String,
    pub props: Json,
    pub children: Vec<BlockNode>,
}

/// Ids of the fixed scaffold blocks of a fresh document.
#[derive(Debug, Clone)]
pub struct DocScaffold {
    pub page: String,
    pub surface: String,
    pub note: String,
    pub paragraph: String,
}

fn new_block_id() -> String {
    nanoid::nanoid!(10)
}

fn prop_key(key: &str) -> String {
    if key.starts_with("prop:") || key.starts_with("sys:") {
        key.to_owned()
    } else {
        format!("prop:{key}")
    }
}

fn has_rich_text(flavour: &str) -> bool {
    matches!(
        flavour,
        flavours::PARAGRAPH | flavours::LIST | flavours::CODE | flavours::PAGE
    )
}

/// Typed access to a content document's block tree.
pub struct BlockTree {
    blocks: MapRef,
}

impl BlockTree {
    pub fn new(replica: &Replica) -> BlockTree {
        BlockTree {
            blocks: replica.map("blocks"),
        }
    }

    pub fn block<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<MapRef> {
        crdt::get_map(txn, &self.blocks, id)
    }

    fn require_block<T: ReadTxn>(&self, txn: &T, id: &str) -> Result<MapRef, ApiError> {
        self.block(txn, id)
            .ok_or_else(|| ApiError::not_found(ErrorCode::BlockNotFound, "block", id))
    }

    /// Id of the root page block.
    pub fn page_id<T: ReadTxn>(&self, txn: &T) -> Option<String> {
        self.find_by_flavour(txn, flavours::PAGE).into_iter().next()
    }

    pub fn surface_id<T: ReadTxn>(&self, txn: &T) -> Option<String> {
        self.find_by_flavour(txn, flavours::SURFACE)
            .into_iter()
            .next()
    }

    pub fn note_id<T: ReadTxn>(&self, txn: &T) -> Option<String> {
        self.find_by_flavour(txn, flavours::NOTE).into_iter().next()
    }

    pub fn find_by_flavour<T: ReadTxn>(&self, txn: &T, flavour: &str) -> Vec<String> {
        let mut out = Vec::new();
        for (id, value) in self.blocks.iter(txn) {
            if let Some(map) = crdt::as_map(value) {
                if get_str(txn, &map, "sys:flavour").as_deref() == Some(flavour) {
                    out.push(id.to_string());
                }
            }
        }
        out.sort();
        out
    }

    /// Builds the fixed initial tree of a fresh document: a page with a
    /// title, a surface with a correctly wrapped empty elements map, and a
    /// note holding one empty paragraph.
    pub fn scaffold(
        &self,
        txn: &mut TransactionMut<'_>,
        title: &str,
        stamp: &Stamp,
    ) -> DocScaffold {
        let page = new_block_id();
        let surface = new_block_id();
        let note = new_block_id();
        let paragraph = new_block_id();

        let page_block = self.bare_block(txn, &page, flavours::PAGE, None, stamp);
        let title_text = page_block.insert(txn, "prop:title", TextPrelim::new(""));
        if !title.is_empty() {
            title_text.insert(txn, 0, title);
        }

        let surface_block = self.bare_block(txn, &surface, flavours::SURFACE, Some(&page), stamp);
        create_wrapped_map(txn, &surface_block, "prop:elements");

        let note_block = self.bare_block(txn, &note, flavours::NOTE, Some(&page), stamp);
        note_block.insert(txn, "prop:xywh", "[0,0,800,95]");
        note_block.insert(txn, "prop:index", "a0");

        let paragraph_block =
            self.bare_block(txn, &paragraph, flavours::PARAGRAPH, Some(&note), stamp);
        paragraph_block.insert(txn, "prop:type", "text");
        paragraph_block.insert(txn, "prop:text", TextPrelim::new(""));

        self.attach(txn, &page, &surface, Position::End)
            .expect("page exists");
        self.attach(txn, &page, &note, Position::End)
            .expect("page exists");
        self.attach(txn, &note, &paragraph, Position::End)
            .expect("note exists");

        DocScaffold {
            page,
            surface,
            note,
            paragraph,
        }
    }

    /// Inserts the block map with its `sys:*` fields and meta stamps; the
    /// caller wires children and flavour-specific props.
    fn bare_block(
        &self,
        txn: &mut TransactionMut<'_>,
        id: &str,
        flavour: &str,
        parent: Option<&str>,
        stamp: &Stamp,
    ) -> MapRef {
        let block = self.blocks.insert(txn, id, MapPrelim::default());
        block.insert(txn, "sys:id", id);
        block.insert(txn, "sys:flavour", flavour);
        block.insert(txn, "sys:version", 1.0);
        block.insert(txn, "sys:children", ArrayPrelim::default());
        if let Some(parent) = parent {
            block.insert(txn, "sys:parent", parent);
        }
        block.insert(txn, "prop:meta:createdAt", stamp.at_ms as f64);
        block.insert(txn, "prop:meta:createdBy", stamp.user_id.as_str());
        block.insert(txn, "prop:meta:updatedAt", stamp.at_ms as f64);
        block.insert(txn, "prop:meta:updatedBy", stamp.user_id.as_str());
        block
    }

    fn children_array<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<ArrayRef> {
        let block = self.block(txn, id)?;
        get_array(txn, &block, "sys:children")
    }

    fn attach(
        &self,
        txn: &mut TransactionMut<'_>,
        parent: &str,
        child: &str,
        position: Position,
    ) -> Result<(), ApiError> {
        let children = self
            .children_array(txn, parent)
            .ok_or_else(|| ApiError::not_found(ErrorCode::BlockNotFound, "block", parent))?;
        let len = children.len(txn);
        let index = match position {
            Position::Start => 0,
            Position::End => len,
            Position::At(i) => i.min(len),
        };
        children.insert(txn, index, child);
        Ok(())
    }

    /// Adds a block under `parent` and returns its engine-generated id.
    pub fn add_block(
        &self,
        txn: &mut TransactionMut<'_>,
        parent: &str,
        flavour: &str,
        props: &JsonMap<String, Json>,
        position: Position,
        stamp: &Stamp,
    ) -> Result<String, ApiError> {
        self.require_block(txn, parent)?;

        let id = new_block_id();
        let block = self.bare_block(txn, &id, flavour, Some(parent), stamp);

        if has_rich_text(flavour) {
            let text = block.insert(txn, "prop:text", TextPrelim::new(""));
            match props.get("text") {
                Some(Json::String(content)) => {
                    if !content.is_empty() {
                        text.insert(txn, 0, content);
                    }
                }
                Some(Json::Array(delta)) => apply_text_delta(txn, &text, delta)?,
                Some(other) => {
                    return Err(ApiError::invalid(format!(
                        "text must be a string or a delta array, got {other}"
                    )));
                }
                None => {}
            }
        }

        for (key, value) in props {
            if key == "text" || key == "children" {
                continue;
            }
            if key == "rows" {
                write_rows(txn, &block, value)?;
                continue;
            }
            block.insert(txn, prop_key(key).as_str(), any_from_json(value));
        }

        if flavour == flavours::PARAGRAPH && !props.contains_key("type") {
            block.insert(txn, "prop:type", "text");
        }

        self.attach(txn, parent, &id, position)?;
        Ok(id)
    }

    /// Shallow-merges `props` into a block. A string value for a rich-text
    /// property replaces the text atomically; scalars assign.
    pub fn update_block(
        &self,
        txn: &mut TransactionMut<'_>,
        id: &str,
        props: &JsonMap<String, Json>,
        stamp: &Stamp,
    ) -> Result<(), ApiError> {
        let block = self.require_block(txn, id)?;

        for (key, value) in props {
            let key = prop_key(key);
            let existing_text = crdt::get_text(txn, &block, &key);
            match (existing_text, value) {
                (Some(text), Json::String(content)) => replace_text(txn, &text, content),
                (Some(text), Json::Array(delta)) => {
                    replace_text(txn, &text, "");
                    apply_text_delta(txn, &text, delta)?;
                }
                (None, Json::String(content)) if key == "prop:text" || key == "prop:title" => {
                    let text = block.insert(txn, key.as_str(), TextPrelim::new(""));
                    if !content.is_empty() {
                        text.insert(txn, 0, content);
                    }
                }
                (_, value) if key == "prop:rows" => write_rows(txn, &block, value)?,
                (_, value) => {
                    block.insert(txn, key.as_str(), any_from_json(value));
                }
            }
        }

        block.insert(txn, "prop:meta:updatedAt", stamp.at_ms as f64);
        block.insert(txn, "prop:meta:updatedBy", stamp.user_id.as_str());
        Ok(())
    }

    /// Removes a block and every descendant, detaching it from its parent's
    /// children array. Returns every removed id so the caller can scrub
    /// edgeless references to them.
    pub fn delete_block(
        &self,
        txn: &mut TransactionMut<'_>,
        id: &str,
    ) -> Result<Vec<String>, ApiError> {
        let block = self.require_block(txn, id)?;

        if let Some(parent) = get_str(txn, &block, "sys:parent") {
            if let Some(children) = self.children_array(txn, &parent) {
                let index = children
                    .iter(txn)
                    .position(|v| matches!(v, yrs::Out::Any(Any::String(ref s)) if s.as_ref() == id));
                if let Some(index) = index {
                    children.remove(txn, index as u32);
                }
            }
        }

        let mut removed = Vec::new();
        let mut queue = vec![id.to_owned()];
        while let Some(current) = queue.pop() {
            if let Some(children) = self.children_array(txn, &current) {
                for value in children.iter(txn) {
                    if let yrs::Out::Any(Any::String(child)) = value {
                        queue.push(child.to_string());
                    }
                }
            }
            self.blocks.remove(txn, &current);
            removed.push(current);
        }
        Ok(removed)
    }

    pub fn child_ids<T: ReadTxn>(&self, txn: &T, id: &str) -> Vec<String> {
        match self.children_array(txn, id) {
            Some(children) => children
                .iter(txn)
                .filter_map(|v| match v {
                    yrs::Out::Any(Any::String(s)) => Some(s.to_string()),
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn read_block<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<BlockNode> {
        let block = self.block(txn, id)?;
        let flavour = get_str(txn, &block, "sys:flavour")?;

        let mut props = JsonMap::new();
        for (key, value) in block.iter(txn) {
            if let Some(name) = key.strip_prefix("prop:") {
                props.insert(name.to_owned(), out_to_json(txn, &value));
            }
        }

        let children = self
            .child_ids(txn, id)
            .iter()
            .filter_map(|child| self.read_block(txn, child))
            .collect();

        Some(BlockNode {
            id: id.to_owned(),
            flavour,
            props: Json::Object(props),
            children,
        })
    }

    /// The whole tree from the page block down.
    pub fn read_tree<T: ReadTxn>(&self, txn: &T) -> Option<BlockNode> {
        let page = self.page_id(txn)?;
        self.read_block(txn, &page)
    }

    pub fn title<T: ReadTxn>(&self, txn: &T) -> Option<String> {
        let page = self.page_id(txn)?;
        let block = self.block(txn, &page)?;
        crdt::get_text(txn, &block, "prop:title").map(|text| {
            use yrs::GetString;
            text.get_string(txn)
        })
    }

    pub fn set_title(&self, txn: &mut TransactionMut<'_>, title: &str) -> Result<(), ApiError> {
        let page = self
            .page_id(txn)
            .ok_or_else(|| ApiError::new(ErrorCode::CrdtApplyFailed, "document has no page block"))?;
        let block = self.require_block(txn, &page)?;
        match crdt::get_text(txn, &block, "prop:title") {
            Some(text) => replace_text(txn, &text, title),
            None => {
                let text = block.insert(txn, "prop:title", TextPrelim::new(""));
                if !title.is_empty() {
                    text.insert(txn, 0, title);
                }
            }
        }
        Ok(())
    }

    /// Lowers parsed Markdown under the note block, in order.
    pub fn append_markdown(
        &self,
        txn: &mut TransactionMut<'_>,
        note: &str,
        specs: &[BlockSpec],
        stamp: &Stamp,
    ) -> Result<Vec<String>, ApiError> {
        let mut ids = Vec::new();
        for spec in specs {
            let (flavour, props) = match spec {
                BlockSpec::Paragraph { level: 0, text } => (
                    flavours::PARAGRAPH,
                    json_props(&[("type", json!("text")), ("text", json!(text))]),
                ),
                BlockSpec::Paragraph { level, text } => (
                    flavours::PARAGRAPH,
                    json_props(&[("type", json!(format!("h{level}"))), ("text", json!(text))]),
                ),
                BlockSpec::Quote { text } => (
                    flavours::PARAGRAPH,
                    json_props(&[("type", json!("quote")), ("text", json!(text))]),
                ),
                BlockSpec::ListItem { ordered, text } => (
                    flavours::LIST,
                    json_props(&[
                        ("type", json!(if *ordered { "numbered" } else { "bulleted" })),
                        ("text", json!(text)),
                        ("checked", json!(false)),
                    ]),
                ),
                BlockSpec::Code { language, code } => (
                    flavours::CODE,
                    json_props(&[("language", json!(language)), ("text", json!(code))]),
                ),
                BlockSpec::Table { rows } => {
                    (flavours::TABLE, json_props(&[("rows", json!(rows))]))
                }
            };
            ids.push(self.add_block(txn, note, flavour, &props, Position::End, stamp)?);
        }
        Ok(ids)
    }

    /// Reads the note subtree back as block specs, the inverse of
    /// [`BlockTree::append_markdown`].
    pub fn to_specs<T: ReadTxn>(&self, txn: &T, note: &str) -> Vec<BlockSpec> {
        use yrs::GetString;

        let mut specs = Vec::new();
        for child in self.child_ids(txn, note) {
            let Some(block) = self.block(txn, &child) else {
                continue;
            };
            let flavour = get_str(txn, &block, "sys:flavour").unwrap_or_default();
            let text = crdt::get_text(txn, &block, "prop:text")
                .map(|t| t.get_string(txn))
                .unwrap_or_default();

            match flavour.as_str() {
                flavours::PARAGRAPH => {
                    let kind = get_str(txn, &block, "prop:type").unwrap_or_default();
                    let spec = match kind.as_str() {
                        "quote" => BlockSpec::Quote { text },
                        "h1" => BlockSpec::Paragraph { level: 1, text },
                        "h2" => BlockSpec::Paragraph { level: 2, text },
                        "h3" => BlockSpec::Paragraph { level: 3, text },
                        _ => BlockSpec::Paragraph { level: 0, text },
                    };
                    specs.push(spec);
                }
                flavours::LIST => {
                    let ordered =
                        get_str(txn, &block, "prop:type").as_deref() == Some("numbered");
                    specs.push(BlockSpec::ListItem { ordered, text });
                }
                flavours::CODE => {
                    specs.push(BlockSpec::Code {
                        language: get_str(txn, &block, "prop:language").unwrap_or_default(),
                        code: text,
                    });
                }
                flavours::TABLE => {
                    specs.push(BlockSpec::Table {
                        rows: read_rows(txn, &block),
                    });
                }
                _ => {}
            }
        }
        specs
    }

    /// Doc ids referenced by linked-page embeds anywhere in the tree.
    pub fn linked_doc_ids<T: ReadTxn>(&self, txn: &T) -> Vec<String> {
        let mut out = Vec::new();
        for (_, value) in self.blocks.iter(txn) {
            let Some(block) = crdt::as_map(value) else {
                continue;
            };
            let flavour = get_str(txn, &block, "sys:flavour").unwrap_or_default();
            if flavour == flavours::LINKED_DOC || flavour.contains("linkedPage") {
                if let Some(page_id) = get_str(txn, &block, "prop:pageId") {
                    out.push(page_id);
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }
}

fn json_props(entries: &[(&str, Json)]) -> JsonMap<String, Json> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

/// Table rows are stored as a CRDT array of CRDT arrays of strings.
fn write_rows(
    txn: &mut TransactionMut<'_>,
    block: &MapRef,
    value: &Json,
) -> Result<(), ApiError> {
    let rows = value
        .as_array()
        .ok_or_else(|| ApiError::invalid("rows must be an array of arrays of strings"))?;

    let rows_array = block.insert(txn, "prop:rows", ArrayPrelim::default());
    for row in rows {
        let cells = row
            .as_array()
            .ok_or_else(|| ApiError::invalid("each table row must be an array of strings"))?;
        let row_array = rows_array.push_back(txn, ArrayPrelim::default());
        for cell in cells {
            let cell = cell
                .as_str()
                .ok_or_else(|| ApiError::invalid("table cells must be strings"))?;
            row_array.push_back(txn, cell);
        }
    }
    Ok(())
}

fn read_rows<T: ReadTxn>(txn: &T, block: &MapRef) -> Vec<Vec<String>> {
    let Some(rows) = get_array(txn, block, "prop:rows") else {
        return Vec::new();
    };
    rows.iter(txn)
        .filter_map(crdt::as_array)
        .map(|row| {
            row.iter(txn)
                .filter_map(|cell| match cell {
                    yrs::Out::Any(Any::String(s)) => Some(s.to_string()),
                    _ => None,
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::markdown;
    use pretty_assertions::assert_eq;

    fn stamp() -> Stamp {
        Stamp {
            user_id: "user-1".to_owned(),
            at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn scaffold_builds_the_fixed_initial_tree() {
        let replica = Replica::new();
        let tree = BlockTree::new(&replica);
        let scaffold = {
            let mut txn = replica.transact_mut();
            tree.scaffold(&mut txn, "Hello", &stamp())
        };

        let txn = replica.transact();
        assert_eq!(tree.page_id(&txn), Some(scaffold.page.clone()));
        assert_eq!(tree.title(&txn).as_deref(), Some("Hello"));
        assert_eq!(
            tree.child_ids(&txn, &scaffold.page),
            vec![scaffold.surface.clone(), scaffold.note.clone()]
        );
        assert_eq!(
            tree.child_ids(&txn, &scaffold.note),
            vec![scaffold.paragraph.clone()]
        );

        // The surface's elements wrapper is a CRDT map holding a CRDT map.
        let surface = tree.block(&txn, &scaffold.surface).unwrap();
        assert!(crdt::open_wrapped_map(&txn, &surface, "prop:elements").is_some());
    }

    #[test]
    fn markdown_survives_lowering_and_reading_back() {
        let replica = Replica::new();
        let tree = BlockTree::new(&replica);
        let markdown_source = "# Hello\n\nworld";
        let specs = markdown::parse(markdown_source);

        let scaffold = {
            let mut txn = replica.transact_mut();
            let scaffold = tree.scaffold(&mut txn, "Hello", &stamp());
            // The scaffold paragraph is a placeholder; markdown content
            // replaces it.
            tree.delete_block(&mut txn, &scaffold.paragraph).unwrap();
            tree.append_markdown(&mut txn, &scaffold.note, &specs, &stamp())
                .unwrap();
            scaffold
        };

        let txn = replica.transact();
        let read_back = tree.to_specs(&txn, &scaffold.note);
        assert_eq!(read_back, specs);
        assert_eq!(markdown::render(&read_back), markdown_source);
    }

    #[test]
    fn add_block_wires_parent_and_position() {
        let replica = Replica::new();
        let tree = BlockTree::new(&replica);
        let (scaffold, first, second) = {
            let mut txn = replica.transact_mut();
            let scaffold = tree.scaffold(&mut txn, "T", &stamp());
            let first = tree
                .add_block(
                    &mut txn,
                    &scaffold.note,
                    flavours::PARAGRAPH,
                    &json_props(&[("text", json!("first"))]),
                    Position::End,
                    &stamp(),
                )
                .unwrap();
            let second = tree
                .add_block(
                    &mut txn,
                    &scaffold.note,
                    flavours::PARAGRAPH,
                    &json_props(&[("text", json!("second"))]),
                    Position::Start,
                    &stamp(),
                )
                .unwrap();
            (scaffold, first, second)
        };

        let txn = replica.transact();
        assert_eq!(
            tree.child_ids(&txn, &scaffold.note),
            vec![second.clone(), scaffold.paragraph.clone(), first.clone()]
        );
        let block = tree.block(&txn, &first).unwrap();
        assert_eq!(get_str(&txn, &block, "sys:parent"), Some(scaffold.note));
    }

    #[test]
    fn update_block_replaces_rich_text_atomically() {
        let replica = Replica::new();
        let tree = BlockTree::new(&replica);
        let id = {
            let mut txn = replica.transact_mut();
            let scaffold = tree.scaffold(&mut txn, "T", &stamp());
            tree.add_block(
                &mut txn,
                &scaffold.note,
                flavours::PARAGRAPH,
                &json_props(&[("text", json!("before"))]),
                Position::End,
                &stamp(),
            )
            .unwrap()
        };

        {
            let mut txn = replica.transact_mut();
            tree.update_block(
                &mut txn,
                &id,
                &json_props(&[("text", json!("after")), ("type", json!("h2"))]),
                &stamp(),
            )
            .unwrap();
        }

        let txn = replica.transact();
        let node = tree.read_block(&txn, &id).unwrap();
        assert_eq!(node.props["text"], json!("after"));
        assert_eq!(node.props["type"], json!("h2"));
    }

    #[test]
    fn delete_block_removes_descendants() {
        let replica = Replica::new();
        let tree = BlockTree::new(&replica);
        let (scaffold, removed) = {
            let mut txn = replica.transact_mut();
            let scaffold = tree.scaffold(&mut txn, "T", &stamp());
            let removed = tree.delete_block(&mut txn, &scaffold.note).unwrap();
            (scaffold, removed)
        };

        let txn = replica.transact();
        assert!(removed.contains(&scaffold.note));
        assert!(removed.contains(&scaffold.paragraph));
        assert!(tree.block(&txn, &scaffold.note).is_none());
        assert!(tree.block(&txn, &scaffold.paragraph).is_none());
        assert_eq!(tree.child_ids(&txn, &scaffold.page), vec![scaffold.surface]);
    }

    #[test]
    fn missing_block_is_reported_with_its_id() {
        let replica = Replica::new();
        let tree = BlockTree::new(&replica);
        {
            let mut txn = replica.transact_mut();
            tree.scaffold(&mut txn, "T", &stamp());
        }
        let mut txn = replica.transact_mut();
        let err = tree
            .update_block(&mut txn, "missing", &JsonMap::new(), &stamp())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BlockNotFound);
    }
}
