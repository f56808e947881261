//! Read-side navigation: synthesises caller-facing views of a workspace by
//! joining the three auxiliary CRDT documents (index, properties, folders)
//! and, where asked, the content documents themselves.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use serde_json::Value as Json;

use crate::crdt::Replica;
use crate::doc::blocks::{BlockNode, BlockTree};
use crate::doc::elements::SurfaceElements;
use crate::doc::markdown;
use crate::doc::workspace::{
    folders_doc_id, properties_doc_id, DocProperties, FolderNode, FolderTree, WorkspaceIndex,
};
use crate::error::{ApiError, ErrorCode};
use crate::upstream::SpaceChannel;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub create_date: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_date: Option<i64>,
    pub tags: Vec<String>,
    pub primary_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceOverview {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub doc_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyNode {
    pub id: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Set on documents reached through in-content linked-page references
    /// rather than the folder tree.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub linked: bool,
    pub children: Vec<HierarchyNode>,
}

/// Read-side access to one workspace over an already-joined channel.
pub struct Navigator<'a> {
    channel: &'a dyn SpaceChannel,
    workspace_id: &'a str,
}

impl<'a> Navigator<'a> {
    pub fn new(channel: &'a dyn SpaceChannel, workspace_id: &'a str) -> Navigator<'a> {
        Navigator {
            channel,
            workspace_id,
        }
    }

    async fn load(&self, doc_id: &str) -> Result<Replica, ApiError> {
        let loaded = self.channel.load_doc(self.workspace_id, doc_id).await?;
        Replica::from_update(&loaded.missing)
    }

    async fn load_or_fresh(&self, doc_id: &str) -> Result<Replica, ApiError> {
        match self.load(doc_id).await {
            Ok(replica) => Ok(replica),
            Err(err) if err.code == ErrorCode::DocNotFound => Ok(Replica::new()),
            Err(err) => Err(err),
        }
    }

    /// Workspace name and avatar come from its root document; the control
    /// plane does not expose them.
    pub async fn overview(&self) -> Result<WorkspaceOverview, ApiError> {
        let root = self.load(self.workspace_id).await?;
        let index = WorkspaceIndex::new(&root);
        let txn = root.transact();
        let entries = index.entries(&txn);
        Ok(WorkspaceOverview {
            id: self.workspace_id.to_owned(),
            name: index.name(&txn),
            avatar: index.avatar(&txn),
            doc_count: entries.iter().filter(|entry| !entry.trash).count(),
        })
    }

    /// Joins index entries, property records and folder nodes by doc id.
    /// The default view filters documents flagged deleted or trashed.
    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>, ApiError> {
        let root = self.load(self.workspace_id).await?;
        let properties_replica = self.load_or_fresh(&properties_doc_id(self.workspace_id)).await?;
        let folders_replica = self.load_or_fresh(&folders_doc_id(self.workspace_id)).await?;

        let index = WorkspaceIndex::new(&root);
        let properties = DocProperties::new(&properties_replica);
        let folders = FolderTree::new(&folders_replica);

        let root_txn = root.transact();
        let props_txn = properties_replica.transact();
        let folders_txn = folders_replica.transact();

        let placement: HashMap<String, String> = folders
            .nodes(&folders_txn)
            .into_iter()
            .filter(|node| node.node_type == "doc" && !node.deleted)
            .filter_map(|node| Some((node.data.clone(), node.parent_id?)))
            .collect();

        let mut out = Vec::new();
        for entry in index.entries(&root_txn) {
            if entry.trash || properties.is_deleted(&props_txn, &entry.id) {
                continue;
            }
            let record = properties.read(&props_txn, &entry.id).unwrap_or(Json::Null);
            out.push(DocumentSummary {
                folder_id: placement.get(&entry.id).cloned(),
                primary_mode: record
                    .get("primaryMode")
                    .and_then(Json::as_str)
                    .unwrap_or("page")
                    .to_owned(),
                created_by: record
                    .get("createdBy")
                    .and_then(Json::as_str)
                    .map(str::to_owned),
                updated_by: record
                    .get("updatedBy")
                    .and_then(Json::as_str)
                    .map(str::to_owned),
                id: entry.id,
                title: entry.title,
                create_date: entry.create_date,
                updated_date: entry.updated_date,
                tags: entry.tags,
            });
        }
        Ok(out)
    }

    pub async fn document_summary(&self, doc_id: &str) -> Result<DocumentSummary, ApiError> {
        // The joined view includes trashed documents here: a direct get by
        // id is how callers inspect partially-created or deleted docs.
        let root = self.load(self.workspace_id).await?;
        let index = WorkspaceIndex::new(&root);
        let entry = {
            let root_txn = root.transact();
            index.entry(&root_txn, doc_id)
        };
        let entry = match entry {
            Some(entry) => entry,
            None => {
                // Not indexed (e.g. step 2 of creation failed); fall back
                // to the content document so the caller can still see it.
                let content = self.load(doc_id).await?;
                let tree = BlockTree::new(&content);
                let txn = content.transact();
                return Ok(DocumentSummary {
                    id: doc_id.to_owned(),
                    title: tree.title(&txn).unwrap_or_default(),
                    create_date: 0,
                    updated_date: None,
                    tags: Vec::new(),
                    primary_mode: "page".to_owned(),
                    folder_id: None,
                    created_by: None,
                    updated_by: None,
                });
            }
        };

        let properties_replica = self.load_or_fresh(&properties_doc_id(self.workspace_id)).await?;
        let folders_replica = self.load_or_fresh(&folders_doc_id(self.workspace_id)).await?;
        let properties = DocProperties::new(&properties_replica);
        let folders = FolderTree::new(&folders_replica);
        let props_txn = properties_replica.transact();
        let folders_txn = folders_replica.transact();

        let record = properties.read(&props_txn, doc_id).unwrap_or(Json::Null);
        Ok(DocumentSummary {
            folder_id: folders
                .doc_node(&folders_txn, doc_id)
                .and_then(|node| node.parent_id),
            primary_mode: record
                .get("primaryMode")
                .and_then(Json::as_str)
                .unwrap_or("page")
                .to_owned(),
            created_by: record
                .get("createdBy")
                .and_then(Json::as_str)
                .map(str::to_owned),
            updated_by: record
                .get("updatedBy")
                .and_then(Json::as_str)
                .map(str::to_owned),
            id: entry.id,
            title: entry.title,
            create_date: entry.create_date,
            updated_date: entry.updated_date,
            tags: entry.tags,
        })
    }

    /// The decoded block tree of a content document.
    pub async fn content(&self, doc_id: &str) -> Result<BlockNode, ApiError> {
        let content = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        let txn = content.transact();
        tree.read_tree(&txn).ok_or_else(|| {
            ApiError::new(
                ErrorCode::CrdtApplyFailed,
                format!("document {doc_id} has no page block"),
            )
        })
    }

    /// The note content rendered back to Markdown.
    pub async fn content_markdown(&self, doc_id: &str) -> Result<String, ApiError> {
        let content = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        let txn = content.transact();
        let note = tree.note_id(&txn).ok_or_else(|| {
            ApiError::new(ErrorCode::CrdtApplyFailed, "document has no note block")
        })?;
        Ok(markdown::render(&tree.to_specs(&txn, &note)))
    }

    pub async fn elements(&self, doc_id: &str) -> Result<Vec<Json>, ApiError> {
        let content = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        let txn = content.transact();
        let elements = SurfaceElements::open(&txn, &tree)?;
        Ok(elements.list(&txn))
    }

    pub async fn element(&self, doc_id: &str, element_id: &str) -> Result<Json, ApiError> {
        let content = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        let txn = content.transact();
        let elements = SurfaceElements::open(&txn, &tree)?;
        elements
            .get(&txn, element_id)
            .ok_or_else(|| ApiError::not_found(ErrorCode::ElementNotFound, "element", element_id))
    }

    /// Folder nodes of the workspace, deleted ones filtered out.
    pub async fn folders(&self) -> Result<Vec<FolderNode>, ApiError> {
        let folders_replica = self.load_or_fresh(&folders_doc_id(self.workspace_id)).await?;
        let folders = FolderTree::new(&folders_replica);
        let txn = folders_replica.transact();
        Ok(folders
            .nodes(&txn)
            .into_iter()
            .filter(|node| !node.deleted)
            .collect())
    }

    /// Children of one folder, resolved against the document index so doc
    /// children carry a title and mode.
    pub async fn folder_contents(&self, folder_id: &str) -> Result<Vec<HierarchyNode>, ApiError> {
        let folders_replica = self.load_or_fresh(&folders_doc_id(self.workspace_id)).await?;
        let folders = FolderTree::new(&folders_replica);
        {
            let txn = folders_replica.transact();
            if !folders.folder_exists(&txn, folder_id) {
                return Err(ApiError::not_found(
                    ErrorCode::FolderNotFound,
                    "folder",
                    folder_id,
                ));
            }
        }

        let documents = self.list_documents().await?;
        let by_id: HashMap<&str, &DocumentSummary> =
            documents.iter().map(|doc| (doc.id.as_str(), doc)).collect();

        let txn = folders_replica.transact();
        let children = folders
            .nodes(&txn)
            .into_iter()
            .filter(|node| !node.deleted && node.parent_id.as_deref() == Some(folder_id))
            .map(|node| folder_child(&node, &by_id))
            .collect();
        Ok(children)
    }

    /// The full folder+document tree. With `follow_links`, each document
    /// node also surfaces documents referenced from its content as nested
    /// children, which the folder tree alone does not capture.
    pub async fn hierarchy(&self, follow_links: bool) -> Result<Vec<HierarchyNode>, ApiError> {
        let folders_replica = self.load_or_fresh(&folders_doc_id(self.workspace_id)).await?;
        let folders = FolderTree::new(&folders_replica);
        let documents = self.list_documents().await?;
        let by_id: HashMap<&str, &DocumentSummary> =
            documents.iter().map(|doc| (doc.id.as_str(), doc)).collect();

        let nodes = {
            let txn = folders_replica.transact();
            folders.nodes(&txn)
        };
        let live: Vec<&FolderNode> = nodes.iter().filter(|node| !node.deleted).collect();

        // Resolve linked-page edges up front; tree assembly stays sync.
        let mut links: HashMap<String, Vec<String>> = HashMap::new();
        if follow_links {
            let mut queue: VecDeque<String> = live
                .iter()
                .filter(|node| node.node_type == "doc")
                .map(|node| node.data.clone())
                .collect();
            let mut visited: HashSet<String> = queue.iter().cloned().collect();

            while let Some(doc_id) = queue.pop_front() {
                let Ok(content) = self.load(&doc_id).await else {
                    continue;
                };
                let tree = BlockTree::new(&content);
                let txn = content.transact();
                let targets = tree.linked_doc_ids(&txn);
                for target in &targets {
                    if visited.insert(target.clone()) {
                        queue.push_back(target.clone());
                    }
                }
                links.insert(doc_id, targets);
            }
        }

        let mut children_of: HashMap<Option<&str>, Vec<&FolderNode>> = HashMap::new();
        for &node in &live {
            children_of
                .entry(node.parent_id.as_deref())
                .or_default()
                .push(node);
        }

        fn build(
            parent: Option<&str>,
            children_of: &HashMap<Option<&str>, Vec<&FolderNode>>,
            by_id: &HashMap<&str, &DocumentSummary>,
            links: &HashMap<String, Vec<String>>,
        ) -> Vec<HierarchyNode> {
            let Some(nodes) = children_of.get(&parent) else {
                return Vec::new();
            };
            nodes
                .iter()
                .map(|node| {
                    if node.node_type == "folder" {
                        HierarchyNode {
                            id: node.id.clone(),
                            kind: "folder".to_owned(),
                            name: node.data.clone(),
                            doc_id: None,
                            mode: None,
                            linked: false,
                            children: build(Some(node.id.as_str()), children_of, by_id, links),
                        }
                    } else {
                        let mut doc = doc_hierarchy_node(&node.data, node.id.clone(), by_id, false);
                        doc.children =
                            linked_children(&node.data, by_id, links, &mut HashSet::new());
                        doc
                    }
                })
                .collect()
        }

        Ok(build(None, &children_of, &by_id, &links))
    }
}

fn doc_hierarchy_node(
    doc_id: &str,
    node_id: String,
    by_id: &HashMap<&str, &DocumentSummary>,
    linked: bool,
) -> HierarchyNode {
    let summary = by_id.get(doc_id);
    HierarchyNode {
        id: node_id,
        kind: "doc".to_owned(),
        name: summary.map(|doc| doc.title.clone()).unwrap_or_default(),
        doc_id: Some(doc_id.to_owned()),
        mode: summary.map(|doc| doc.primary_mode.clone()),
        linked,
        children: Vec::new(),
    }
}

fn linked_children(
    doc_id: &str,
    by_id: &HashMap<&str, &DocumentSummary>,
    links: &HashMap<String, Vec<String>>,
    seen: &mut HashSet<String>,
) -> Vec<HierarchyNode> {
    seen.insert(doc_id.to_owned());
    let Some(targets) = links.get(doc_id) else {
        return Vec::new();
    };
    let filtered: Vec<&String> = targets.iter().filter(|target| !seen.contains(*target)).collect();
    filtered
        .into_iter()
        .map(|target| {
            let mut node = doc_hierarchy_node(target, target.clone(), by_id, true);
            node.children = linked_children(target, by_id, links, seen);
            node
        })
        .collect()
}

fn folder_child(
    node: &FolderNode,
    by_id: &HashMap<&str, &DocumentSummary>,
) -> HierarchyNode {
    if node.node_type == "folder" {
        HierarchyNode {
            id: node.id.clone(),
            kind: "folder".to_owned(),
            name: node.data.clone(),
            doc_id: None,
            mode: None,
            linked: false,
            children: Vec::new(),
        }
    } else {
        doc_hierarchy_node(&node.data, node.id.clone(), by_id, false)
    }
}
