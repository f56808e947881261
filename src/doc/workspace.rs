//! Accessors for the three auxiliary CRDT documents every workspace carries:
//! the index document (the workspace root: `meta.name`, `meta.avatar`,
//! `meta.pages`), the per-document properties document and the folder-tree
//! document. The latter two are keyed `db$<workspace>$<table>`.

use serde_json::Value as Json;
use yrs::{Any, Array, ArrayPrelim, ArrayRef, Map, MapPrelim, MapRef, Out, ReadTxn, TransactionMut};

use crate::crdt::{self, any_from_json, get_str, map_to_json, Replica};
use crate::error::{ApiError, ErrorCode};
use crate::fractional;

pub fn properties_doc_id(workspace_id: &str) -> String {
    format!("db${workspace_id}$docProperties")
}

pub fn folders_doc_id(workspace_id: &str) -> String {
    format!("db${workspace_id}$folders")
}

/// One entry of the workspace index's `meta.pages` array.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub id: String,
    pub title: String,
    pub create_date: i64,
    pub updated_date: Option<i64>,
    pub tags: Vec<String>,
    pub trash: bool,
}

/// The workspace root document.
pub struct WorkspaceIndex {
    meta: MapRef,
}

impl WorkspaceIndex {
    pub fn new(replica: &Replica) -> WorkspaceIndex {
        WorkspaceIndex {
            meta: replica.map("meta"),
        }
    }

    pub fn name<T: ReadTxn>(&self, txn: &T) -> Option<String> {
        get_str(txn, &self.meta, "name")
    }

    pub fn avatar<T: ReadTxn>(&self, txn: &T) -> Option<String> {
        get_str(txn, &self.meta, "avatar")
    }

    fn pages<T: ReadTxn>(&self, txn: &T) -> Option<ArrayRef> {
        crdt::get_array(txn, &self.meta, "pages")
    }

    fn ensure_pages(&self, txn: &mut TransactionMut<'_>) -> ArrayRef {
        match crdt::get_array(txn, &self.meta, "pages") {
            Some(pages) => pages,
            None => self.meta.insert(txn, "pages", ArrayPrelim::default()),
        }
    }

    fn entry_map<T: ReadTxn>(&self, txn: &T, doc_id: &str) -> Option<(u32, MapRef)> {
        let pages = self.pages(txn)?;
        for (position, value) in pages.iter(txn).enumerate() {
            if let Some(map) = crdt::as_map(value) {
                if get_str(txn, &map, "id").as_deref() == Some(doc_id) {
                    return Some((position as u32, map));
                }
            }
        }
        None
    }

    pub fn contains<T: ReadTxn>(&self, txn: &T, doc_id: &str) -> bool {
        self.entry_map(txn, doc_id).is_some()
    }

    pub fn entries<T: ReadTxn>(&self, txn: &T) -> Vec<IndexEntry> {
        let Some(pages) = self.pages(txn) else {
            return Vec::new();
        };
        pages
            .iter(txn)
            .filter_map(crdt::as_map)
            .filter_map(|map| self.decode_entry(txn, &map))
            .collect()
    }

    pub fn entry<T: ReadTxn>(&self, txn: &T, doc_id: &str) -> Option<IndexEntry> {
        let (_, map) = self.entry_map(txn, doc_id)?;
        self.decode_entry(txn, &map)
    }

    fn decode_entry<T: ReadTxn>(&self, txn: &T, map: &MapRef) -> Option<IndexEntry> {
        let id = get_str(txn, map, "id")?;
        let tags = match map.get(txn, "tags") {
            Some(out) => match crdt::out_to_json(txn, &out) {
                Json::Array(items) => items
                    .into_iter()
                    .filter_map(|tag| tag.as_str().map(str::to_owned))
                    .collect(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        Some(IndexEntry {
            id,
            title: get_str(txn, map, "title").unwrap_or_default(),
            create_date: crdt::get_number(txn, map, "createDate").unwrap_or(0.0) as i64,
            updated_date: crdt::get_number(txn, map, "updatedDate").map(|n| n as i64),
            tags,
            trash: crdt::get_bool(txn, map, "trash").unwrap_or(false),
        })
    }

    /// Appends a fresh entry. The caller guarantees the doc id is new.
    pub fn append_entry(
        &self,
        txn: &mut TransactionMut<'_>,
        doc_id: &str,
        title: &str,
        created_ms: i64,
        tags: &[String],
    ) {
        let pages = self.ensure_pages(txn);
        let entry = pages.push_back(txn, MapPrelim::default());
        entry.insert(txn, "id", doc_id);
        entry.insert(txn, "title", title);
        entry.insert(txn, "createDate", created_ms as f64);
        entry.insert(txn, "updatedDate", created_ms as f64);
        let tag_array = entry.insert(txn, "tags", ArrayPrelim::default());
        for tag in tags {
            tag_array.push_back(txn, tag.as_str());
        }
    }

    pub fn set_title(
        &self,
        txn: &mut TransactionMut<'_>,
        doc_id: &str,
        title: &str,
        updated_ms: i64,
    ) -> Result<(), ApiError> {
        let (_, entry) = self
            .entry_map(txn, doc_id)
            .ok_or_else(|| ApiError::not_found(ErrorCode::DocNotFound, "document", doc_id))?;
        entry.insert(txn, "title", title);
        entry.insert(txn, "updatedDate", updated_ms as f64);
        Ok(())
    }

    pub fn set_tags(
        &self,
        txn: &mut TransactionMut<'_>,
        doc_id: &str,
        tags: &[String],
        updated_ms: i64,
    ) -> Result<(), ApiError> {
        let (_, entry) = self
            .entry_map(txn, doc_id)
            .ok_or_else(|| ApiError::not_found(ErrorCode::DocNotFound, "document", doc_id))?;
        let tag_array = entry.insert(txn, "tags", ArrayPrelim::default());
        for tag in tags {
            tag_array.push_back(txn, tag.as_str());
        }
        entry.insert(txn, "updatedDate", updated_ms as f64);
        Ok(())
    }

    pub fn remove_entry(&self, txn: &mut TransactionMut<'_>, doc_id: &str) -> bool {
        let Some((position, _)) = self.entry_map(txn, doc_id) else {
            return false;
        };
        if let Some(pages) = crdt::get_array(txn, &self.meta, "pages") {
            pages.remove(txn, position);
            return true;
        }
        false
    }
}

/// The per-document properties document (`db$<ws>$docProperties`), one CRDT
/// map per document keyed by doc id.
pub struct DocProperties {
    root: MapRef,
}

impl DocProperties {
    pub fn new(replica: &Replica) -> DocProperties {
        DocProperties {
            root: replica.map("docProperties"),
        }
    }

    fn entry<T: ReadTxn>(&self, txn: &T, doc_id: &str) -> Option<MapRef> {
        crdt::get_map(txn, &self.root, doc_id)
    }

    fn ensure_entry(&self, txn: &mut TransactionMut<'_>, doc_id: &str) -> MapRef {
        match crdt::get_map(txn, &self.root, doc_id) {
            Some(entry) => entry,
            None => {
                let entry = self.root.insert(txn, doc_id, MapPrelim::default());
                entry.insert(txn, "id", doc_id);
                entry
            }
        }
    }

    pub fn read<T: ReadTxn>(&self, txn: &T, doc_id: &str) -> Option<Json> {
        self.entry(txn, doc_id).map(|entry| map_to_json(txn, &entry))
    }

    pub fn all<T: ReadTxn>(&self, txn: &T) -> Vec<(String, Json)> {
        self.root
            .iter(txn)
            .filter_map(|(id, value)| {
                crdt::as_map(value).map(|map| (id.to_string(), map_to_json(txn, &map)))
            })
            .collect()
    }

    /// Initial property record for a freshly created document.
    pub fn initialize(
        &self,
        txn: &mut TransactionMut<'_>,
        doc_id: &str,
        user_id: &str,
        updated_ms: i64,
        primary_mode: &str,
    ) {
        let entry = self.ensure_entry(txn, doc_id);
        entry.insert(txn, "primaryMode", primary_mode);
        entry.insert(txn, "edgelessColorTheme", "light");
        entry.insert(txn, "createdBy", user_id);
        entry.insert(txn, "updatedBy", user_id);
        entry.insert(txn, "updatedAt", updated_ms as f64);
    }

    pub fn merge(
        &self,
        txn: &mut TransactionMut<'_>,
        doc_id: &str,
        fields: &serde_json::Map<String, Json>,
        user_id: &str,
        updated_ms: i64,
    ) {
        let entry = self.ensure_entry(txn, doc_id);
        for (key, value) in fields {
            if key == "id" {
                continue;
            }
            if key == "tags" {
                self.write_tags_into(txn, &entry, value);
                continue;
            }
            entry.insert(txn, key.as_str(), any_from_json(value));
        }
        entry.insert(txn, "updatedBy", user_id);
        entry.insert(txn, "updatedAt", updated_ms as f64);
    }

    fn write_tags_into(&self, txn: &mut TransactionMut<'_>, entry: &MapRef, tags: &Json) {
        let tag_array = entry.insert(txn, "tags", ArrayPrelim::default());
        if let Json::Array(tags) = tags {
            for tag in tags {
                if let Some(tag) = tag.as_str() {
                    tag_array.push_back(txn, tag);
                }
            }
        }
    }

    pub fn set_tags(
        &self,
        txn: &mut TransactionMut<'_>,
        doc_id: &str,
        tags: &[String],
        user_id: &str,
        updated_ms: i64,
    ) {
        let entry = self.ensure_entry(txn, doc_id);
        self.write_tags_into(txn, &entry, &serde_json::json!(tags));
        entry.insert(txn, "updatedBy", user_id);
        entry.insert(txn, "updatedAt", updated_ms as f64);
    }

    /// Logical deletion: flag the record and clear its tags.
    pub fn mark_deleted(
        &self,
        txn: &mut TransactionMut<'_>,
        doc_id: &str,
        user_id: &str,
        updated_ms: i64,
    ) {
        let entry = self.ensure_entry(txn, doc_id);
        entry.insert(txn, "deleted", true);
        entry.insert(txn, "tags", ArrayPrelim::default());
        entry.insert(txn, "updatedBy", user_id);
        entry.insert(txn, "updatedAt", updated_ms as f64);
    }

    pub fn is_deleted<T: ReadTxn>(&self, txn: &T, doc_id: &str) -> bool {
        self.entry(txn, doc_id)
            .and_then(|entry| crdt::get_bool(txn, &entry, "deleted"))
            .unwrap_or(false)
    }
}

/// One node of the folder document.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    pub id: String,
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Folder name for `type = "folder"`, referenced doc id for `type = "doc"`.
    pub data: String,
    pub index: String,
    pub deleted: bool,
}

/// The folder-tree document (`db$<ws>$folders`), one CRDT map per node.
pub struct FolderTree {
    root: MapRef,
}

impl FolderTree {
    pub fn new(replica: &Replica) -> FolderTree {
        FolderTree {
            root: replica.map("folders"),
        }
    }

    fn node_map<T: ReadTxn>(&self, txn: &T, node_id: &str) -> Option<MapRef> {
        crdt::get_map(txn, &self.root, node_id)
    }

    fn decode<T: ReadTxn>(&self, txn: &T, id: &str, map: &MapRef) -> FolderNode {
        let parent_id = match map.get(txn, "parentId") {
            Some(Out::Any(Any::String(parent))) => Some(parent.to_string()),
            _ => None,
        };
        FolderNode {
            id: id.to_owned(),
            parent_id,
            node_type: get_str(txn, map, "type").unwrap_or_default(),
            data: get_str(txn, map, "data").unwrap_or_default(),
            index: get_str(txn, map, "index").unwrap_or_default(),
            deleted: crdt::get_bool(txn, map, "deleted").unwrap_or(false),
        }
    }

    pub fn node<T: ReadTxn>(&self, txn: &T, node_id: &str) -> Option<FolderNode> {
        let map = self.node_map(txn, node_id)?;
        Some(self.decode(txn, node_id, &map))
    }

    pub fn nodes<T: ReadTxn>(&self, txn: &T) -> Vec<FolderNode> {
        let mut nodes: Vec<FolderNode> = self
            .root
            .iter(txn)
            .filter_map(|(id, value)| {
                let id = id.to_string();
                crdt::as_map(value).map(|map| self.decode(txn, &id, &map))
            })
            .collect();
        nodes.sort_by(|a, b| a.index.cmp(&b.index));
        nodes
    }

    /// The node referencing a document, if the document is placed.
    pub fn doc_node<T: ReadTxn>(&self, txn: &T, doc_id: &str) -> Option<FolderNode> {
        self.nodes(txn)
            .into_iter()
            .find(|node| node.node_type == "doc" && node.data == doc_id && !node.deleted)
    }

    pub fn folder_exists<T: ReadTxn>(&self, txn: &T, folder_id: &str) -> bool {
        self.node(txn, folder_id)
            .map(|node| node.node_type == "folder" && !node.deleted)
            .unwrap_or(false)
    }

    /// An ordering token placing a new node after its siblings.
    pub fn next_index<T: ReadTxn>(&self, txn: &T, parent_id: Option<&str>) -> String {
        let siblings: Vec<String> = self
            .nodes(txn)
            .into_iter()
            .filter(|node| node.parent_id.as_deref() == parent_id && !node.deleted)
            .map(|node| node.index)
            .collect();
        fractional::append_token(siblings.iter().map(String::as_str))
    }

    pub fn insert_node(&self, txn: &mut TransactionMut<'_>, node: &FolderNode) {
        let map = self.root.insert(txn, node.id.as_str(), MapPrelim::default());
        map.insert(txn, "id", node.id.as_str());
        match &node.parent_id {
            Some(parent) => {
                map.insert(txn, "parentId", parent.as_str());
            }
            None => {
                map.insert(txn, "parentId", Any::Null);
            }
        }
        map.insert(txn, "type", node.node_type.as_str());
        map.insert(txn, "data", node.data.as_str());
        map.insert(txn, "index", node.index.as_str());
    }

    pub fn set_parent(
        &self,
        txn: &mut TransactionMut<'_>,
        node_id: &str,
        parent_id: Option<&str>,
    ) -> Result<(), ApiError> {
        let map = self
            .node_map(txn, node_id)
            .ok_or_else(|| ApiError::not_found(ErrorCode::FolderNotFound, "folder node", node_id))?;
        let index = self.next_index(txn, parent_id);
        match parent_id {
            Some(parent) => {
                map.insert(txn, "parentId", parent);
            }
            None => {
                map.insert(txn, "parentId", Any::Null);
            }
        }
        map.insert(txn, "index", index.as_str());
        Ok(())
    }

    /// Logical deletion: flag the node and detach it from its parent.
    pub fn mark_deleted(&self, txn: &mut TransactionMut<'_>, node_id: &str) -> Result<(), ApiError> {
        let map = self
            .node_map(txn, node_id)
            .ok_or_else(|| ApiError::not_found(ErrorCode::FolderNotFound, "folder node", node_id))?;
        map.insert(txn, "deleted", true);
        map.insert(txn, "parentId", Any::Null);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn db_doc_ids_follow_the_upstream_key_scheme() {
        assert_eq!(properties_doc_id("W1"), "db$W1$docProperties");
        assert_eq!(folders_doc_id("W1"), "db$W1$folders");
    }

    #[test]
    fn index_entries_round_trip() {
        let replica = Replica::new();
        let index = WorkspaceIndex::new(&replica);
        {
            let mut txn = replica.transact_mut();
            index.append_entry(&mut txn, "D1", "Hello", 1_700_000_000_000, &[]);
        }

        let txn = replica.transact();
        let entries = index.entries(&txn);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "D1");
        assert_eq!(entries[0].title, "Hello");
        assert_eq!(entries[0].tags, Vec::<String>::new());
        assert!(!entries[0].trash);
    }

    #[test]
    fn set_tags_replaces_the_tag_array() {
        let replica = Replica::new();
        let index = WorkspaceIndex::new(&replica);
        {
            let mut txn = replica.transact_mut();
            index.append_entry(&mut txn, "D1", "Hello", 0, &["x".to_owned()]);
            index
                .set_tags(&mut txn, "D1", &["a".to_owned(), "b".to_owned()], 1)
                .unwrap();
        }

        let txn = replica.transact();
        assert_eq!(index.entry(&txn, "D1").unwrap().tags, vec!["a", "b"]);
    }

    #[test]
    fn remove_entry_deletes_exactly_one() {
        let replica = Replica::new();
        let index = WorkspaceIndex::new(&replica);
        {
            let mut txn = replica.transact_mut();
            index.append_entry(&mut txn, "D1", "One", 0, &[]);
            index.append_entry(&mut txn, "D2", "Two", 0, &[]);
        }
        {
            let mut txn = replica.transact_mut();
            assert!(index.remove_entry(&mut txn, "D1"));
            assert!(!index.remove_entry(&mut txn, "D1"));
        }

        let txn = replica.transact();
        let ids: Vec<String> = index.entries(&txn).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["D2"]);
    }

    #[test]
    fn properties_lifecycle() {
        let replica = Replica::new();
        let properties = DocProperties::new(&replica);
        {
            let mut txn = replica.transact_mut();
            properties.initialize(&mut txn, "D1", "user-1", 42, "page");
        }

        {
            let txn = replica.transact();
            let record = properties.read(&txn, "D1").unwrap();
            assert_eq!(record["primaryMode"], "page");
            assert_eq!(record["edgelessColorTheme"], "light");
            assert_eq!(record["createdBy"], "user-1");
            assert!(!properties.is_deleted(&txn, "D1"));
        }

        {
            let mut txn = replica.transact_mut();
            properties.mark_deleted(&mut txn, "D1", "user-1", 43);
        }
        let txn = replica.transact();
        assert!(properties.is_deleted(&txn, "D1"));
        let record = properties.read(&txn, "D1").unwrap();
        assert_eq!(record["tags"], serde_json::json!([]));
    }

    #[test]
    fn folder_nodes_and_sibling_ordering() {
        let replica = Replica::new();
        let folders = FolderTree::new(&replica);
        {
            let mut txn = replica.transact_mut();
            let index = folders.next_index(&txn, None);
            folders.insert_node(
                &mut txn,
                &FolderNode {
                    id: "F1".to_owned(),
                    parent_id: None,
                    node_type: "folder".to_owned(),
                    data: "Inbox".to_owned(),
                    index,
                    deleted: false,
                },
            );
            let index = folders.next_index(&txn, Some("F1"));
            folders.insert_node(
                &mut txn,
                &FolderNode {
                    id: "N1".to_owned(),
                    parent_id: Some("F1".to_owned()),
                    node_type: "doc".to_owned(),
                    data: "D1".to_owned(),
                    index,
                    deleted: false,
                },
            );
        }

        let txn = replica.transact();
        assert!(folders.folder_exists(&txn, "F1"));
        let node = folders.doc_node(&txn, "D1").unwrap();
        assert_eq!(node.parent_id.as_deref(), Some("F1"));
        assert_eq!(node.node_type, "doc");

        let second = folders.next_index(&txn, Some("F1"));
        assert!(second > node.index);
    }

    #[test]
    fn mark_deleted_detaches_the_node() {
        let replica = Replica::new();
        let folders = FolderTree::new(&replica);
        {
            let mut txn = replica.transact_mut();
            folders.insert_node(
                &mut txn,
                &FolderNode {
                    id: "N1".to_owned(),
                    parent_id: Some("F1".to_owned()),
                    node_type: "doc".to_owned(),
                    data: "D1".to_owned(),
                    index: "a0".to_owned(),
                    deleted: false,
                },
            );
            folders.mark_deleted(&mut txn, "N1").unwrap();
        }

        let txn = replica.transact();
        let node = folders.node(&txn, "N1").unwrap();
        assert!(node.deleted);
        assert_eq!(node.parent_id, None);
    }
}
