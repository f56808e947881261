//! The transaction composer: one user intent becomes one ordered sequence
//! of document writes. The upstream has no cross-document transactions, so
//! the model is monotonic (earlier steps are durable) and a failing step
//! surfaces a [`TransactionFailure`] naming the step and carrying the doc
//! id the earlier steps already created. No automatic compensation:
//! retrying is safer than destructive cleanup.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as Json};

use crate::crdt::Replica;
use crate::doc::blocks::{flavours, BlockTree, Position, Stamp};
use crate::doc::elements::{ElementInput, SurfaceElements};
use crate::doc::markdown;
use crate::doc::workspace::{
    folders_doc_id, properties_doc_id, DocProperties, FolderNode, FolderTree, WorkspaceIndex,
};
use crate::error::{ApiError, ErrorCode, TransactionFailure, TxStep};
use crate::upstream::{BlobStore, SpaceChannel};
use yrs::Map;

fn new_doc_id() -> String {
    nanoid::nanoid!()
}

fn new_node_id() -> String {
    nanoid::nanoid!(10)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentSpec {
    pub title: Option<String>,
    pub markdown: Option<String>,
    pub folder_id: Option<String>,
    /// Caller-supplied id for idempotent creation; an existing id fails
    /// with `DOCUMENT_ALREADY_EXISTS` instead of overwriting.
    pub doc_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedDocument {
    pub doc_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_node_id: Option<String>,
    pub timestamp: i64,
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDocumentPatch {
    pub title: Option<String>,
    /// Replaces the note's content wholesale.
    pub markdown: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Absent: leave placement alone. `null`: detach from any folder.
    /// String: move under that folder.
    #[serde(default, deserialize_with = "present_json")]
    pub folder_id: Option<Json>,
    /// `page` or `edgeless`.
    pub mode: Option<String>,
}

/// Keeps an explicit `null` distinguishable from an absent field: a present
/// value of any kind, `null` included, becomes `Some`.
fn present_json<'de, D>(deserializer: D) -> Result<Option<Json>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Json::deserialize(deserializer).map(Some)
}

impl UpdateDocumentPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.markdown.is_none()
            && self.tags.is_none()
            && self.folder_id.is_none()
            && self.mode.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ImageInsert {
    pub data: Vec<u8>,
    pub mime: String,
    pub parent_block_id: Option<String>,
    pub caption: Option<String>,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertedImage {
    pub block_id: String,
    pub blob_id: String,
}

/// Composes multi-document writes over an already-joined channel.
pub struct Composer<'a> {
    channel: &'a dyn SpaceChannel,
    workspace_id: &'a str,
    user_id: &'a str,
}

impl<'a> Composer<'a> {
    pub fn new(
        channel: &'a dyn SpaceChannel,
        workspace_id: &'a str,
        user_id: &'a str,
    ) -> Composer<'a> {
        Composer {
            channel,
            workspace_id,
            user_id,
        }
    }

    fn stamp(&self) -> Stamp {
        Stamp::now(self.user_id)
    }

    /// Loads a document into a fresh replica, returning it with the state
    /// vector to diff later pushes against.
    async fn load(&self, doc_id: &str) -> Result<(Replica, Vec<u8>), ApiError> {
        let loaded = self.channel.load_doc(self.workspace_id, doc_id).await?;
        let replica = Replica::from_update(&loaded.missing)?;
        let base = replica.state_vector();
        Ok((replica, base))
    }

    /// Auxiliary `db$…` documents are created lazily by their first writer,
    /// so a missing one is an empty replica rather than an error.
    async fn load_or_fresh(&self, doc_id: &str) -> Result<(Replica, Vec<u8>), ApiError> {
        match self.load(doc_id).await {
            Ok(loaded) => Ok(loaded),
            Err(err) if err.code == ErrorCode::DocNotFound => {
                let replica = Replica::new();
                let base = replica.state_vector();
                Ok((replica, base))
            }
            Err(err) => Err(err),
        }
    }

    async fn push(&self, doc_id: &str, replica: &Replica, base: &[u8]) -> Result<i64, ApiError> {
        let update = replica.encode_update_since(Some(base))?;
        self.channel
            .push_update(self.workspace_id, doc_id, &update)
            .await
    }

    /// Creates a document: content, then index entry, then properties,
    /// then (optionally) folder placement, in exactly that order, each
    /// step acknowledged before the next begins.
    pub async fn create_document(
        &self,
        spec: CreateDocumentSpec,
    ) -> Result<CreatedDocument, TransactionFailure> {
        let step = |step: TxStep, doc_id: Option<&str>| {
            let doc_id = doc_id.map(str::to_owned);
            move |error: ApiError| TransactionFailure::new(step, doc_id.clone(), error)
        };

        let title = spec.title.clone().unwrap_or_default();
        let stamp = self.stamp();

        let doc_id = match &spec.doc_id {
            Some(requested) => {
                match self.channel.load_doc(self.workspace_id, requested).await {
                    Ok(_) => {
                        return Err(TransactionFailure::new(
                            TxStep::Content,
                            None,
                            ApiError::new(
                                ErrorCode::DocumentAlreadyExists,
                                format!("document {requested} already exists"),
                            ),
                        ));
                    }
                    Err(err) if err.code == ErrorCode::DocNotFound => requested.clone(),
                    Err(err) => return Err(TransactionFailure::new(TxStep::Content, None, err)),
                }
            }
            None => new_doc_id(),
        };

        // Step 1: content document.
        let content = Replica::new();
        let tree = BlockTree::new(&content);
        {
            let mut txn = content.transact_mut();
            let scaffold = tree.scaffold(&mut txn, &title, &stamp);
            if let Some(source) = &spec.markdown {
                let specs = markdown::parse(source);
                if !specs.is_empty() {
                    tree.delete_block(&mut txn, &scaffold.paragraph)
                        .map_err(step(TxStep::Content, None))?;
                    tree.append_markdown(&mut txn, &scaffold.note, &specs, &stamp)
                        .map_err(step(TxStep::Content, None))?;
                }
            }
        }
        let full = content
            .encode_update_since(None)
            .map_err(step(TxStep::Content, None))?;
        let timestamp = self
            .channel
            .push_update(self.workspace_id, &doc_id, &full)
            .await
            .map_err(step(TxStep::Content, None))?;
        log::debug!("created content doc {doc_id} in {}", self.workspace_id);

        // Step 2: workspace index entry.
        let (index_replica, base) = self
            .load(self.workspace_id)
            .await
            .map_err(step(TxStep::WorkspaceIndex, Some(&doc_id)))?;
        let index = WorkspaceIndex::new(&index_replica);
        {
            let mut txn = index_replica.transact_mut();
            index.append_entry(&mut txn, &doc_id, &title, stamp.at_ms, &spec.tags);
        }
        self.push(self.workspace_id, &index_replica, &base)
            .await
            .map_err(step(TxStep::WorkspaceIndex, Some(&doc_id)))?;

        // Step 3: per-document properties.
        let properties_id = properties_doc_id(self.workspace_id);
        let (properties_replica, base) = self
            .load_or_fresh(&properties_id)
            .await
            .map_err(step(TxStep::Properties, Some(&doc_id)))?;
        let properties = DocProperties::new(&properties_replica);
        {
            let mut txn = properties_replica.transact_mut();
            properties.initialize(&mut txn, &doc_id, self.user_id, stamp.at_ms, "page");
            if !spec.tags.is_empty() {
                properties.set_tags(&mut txn, &doc_id, &spec.tags, self.user_id, stamp.at_ms);
            }
        }
        self.push(&properties_id, &properties_replica, &base)
            .await
            .map_err(step(TxStep::Properties, Some(&doc_id)))?;

        // Step 4: folder placement, when requested.
        let folder_node_id = match &spec.folder_id {
            Some(folder_id) => {
                let folders_id = folders_doc_id(self.workspace_id);
                let (folders_replica, base) = self
                    .load_or_fresh(&folders_id)
                    .await
                    .map_err(step(TxStep::Folder, Some(&doc_id)))?;
                let folders = FolderTree::new(&folders_replica);

                let node_id = {
                    let mut txn = folders_replica.transact_mut();
                    if !folders.folder_exists(&txn, folder_id) {
                        return Err(TransactionFailure::new(
                            TxStep::Folder,
                            Some(doc_id),
                            ApiError::not_found(ErrorCode::FolderNotFound, "folder", folder_id),
                        ));
                    }
                    let node_id = new_node_id();
                    let index_token = folders.next_index(&txn, Some(folder_id));
                    folders.insert_node(
                        &mut txn,
                        &FolderNode {
                            id: node_id.clone(),
                            parent_id: Some(folder_id.clone()),
                            node_type: "doc".to_owned(),
                            data: doc_id.clone(),
                            index: index_token,
                            deleted: false,
                        },
                    );
                    node_id
                };
                self.push(&folders_id, &folders_replica, &base)
                    .await
                    .map_err(step(TxStep::Folder, Some(&doc_id)))?;
                Some(node_id)
            }
            None => None,
        };

        Ok(CreatedDocument {
            doc_id,
            folder_node_id,
            timestamp,
            title,
        })
    }

    /// Applies a partial update, mirroring the creation order: content,
    /// index, properties, folder.
    pub async fn update_document(
        &self,
        doc_id: &str,
        patch: &UpdateDocumentPatch,
    ) -> Result<i64, TransactionFailure> {
        let step = |step: TxStep| {
            let doc_id = doc_id.to_owned();
            move |error: ApiError| TransactionFailure::new(step, Some(doc_id.clone()), error)
        };
        let stamp = self.stamp();
        let mut timestamp = stamp.at_ms;

        if patch.title.is_some() || patch.markdown.is_some() {
            let (content, base) = self.load(doc_id).await.map_err(step(TxStep::Content))?;
            let tree = BlockTree::new(&content);
            {
                let mut txn = content.transact_mut();
                if let Some(title) = &patch.title {
                    tree.set_title(&mut txn, title).map_err(step(TxStep::Content))?;
                }
                if let Some(source) = &patch.markdown {
                    let note = tree.note_id(&txn).ok_or_else(|| {
                        step(TxStep::Content)(ApiError::new(
                            ErrorCode::CrdtApplyFailed,
                            "document has no note block",
                        ))
                    })?;
                    for child in tree.child_ids(&txn, &note) {
                        tree.delete_block(&mut txn, &child)
                            .map_err(step(TxStep::Content))?;
                    }
                    tree.append_markdown(&mut txn, &note, &markdown::parse(source), &stamp)
                        .map_err(step(TxStep::Content))?;
                }
            }
            timestamp = self
                .push(doc_id, &content, &base)
                .await
                .map_err(step(TxStep::Content))?;
        }

        if patch.title.is_some() || patch.tags.is_some() {
            let (index_replica, base) = self
                .load(self.workspace_id)
                .await
                .map_err(step(TxStep::WorkspaceIndex))?;
            let index = WorkspaceIndex::new(&index_replica);
            {
                let mut txn = index_replica.transact_mut();
                if let Some(title) = &patch.title {
                    index
                        .set_title(&mut txn, doc_id, title, stamp.at_ms)
                        .map_err(step(TxStep::WorkspaceIndex))?;
                }
                if let Some(tags) = &patch.tags {
                    index
                        .set_tags(&mut txn, doc_id, tags, stamp.at_ms)
                        .map_err(step(TxStep::WorkspaceIndex))?;
                }
            }
            timestamp = self
                .push(self.workspace_id, &index_replica, &base)
                .await
                .map_err(step(TxStep::WorkspaceIndex))?;
        }

        if patch.tags.is_some() || patch.mode.is_some() {
            let properties_id = properties_doc_id(self.workspace_id);
            let (properties_replica, base) = self
                .load_or_fresh(&properties_id)
                .await
                .map_err(step(TxStep::Properties))?;
            let properties = DocProperties::new(&properties_replica);
            {
                let mut txn = properties_replica.transact_mut();
                if let Some(tags) = &patch.tags {
                    properties.set_tags(&mut txn, doc_id, tags, self.user_id, stamp.at_ms);
                }
                if let Some(mode) = &patch.mode {
                    let mut fields = JsonMap::new();
                    fields.insert("primaryMode".to_owned(), Json::String(mode.clone()));
                    properties.merge(&mut txn, doc_id, &fields, self.user_id, stamp.at_ms);
                }
            }
            timestamp = self
                .push(&properties_id, &properties_replica, &base)
                .await
                .map_err(step(TxStep::Properties))?;
        }

        if let Some(folder_id) = &patch.folder_id {
            let target = match folder_id {
                Json::Null => None,
                Json::String(folder_id) => Some(folder_id.clone()),
                _ => {
                    return Err(step(TxStep::Folder)(ApiError::invalid(
                        "folderId must be a string or null",
                    )))
                }
            };

            let folders_id = folders_doc_id(self.workspace_id);
            let (folders_replica, base) = self
                .load_or_fresh(&folders_id)
                .await
                .map_err(step(TxStep::Folder))?;
            let folders = FolderTree::new(&folders_replica);
            {
                let mut txn = folders_replica.transact_mut();
                if let Some(folder) = &target {
                    if !folders.folder_exists(&txn, folder) {
                        return Err(step(TxStep::Folder)(ApiError::not_found(
                            ErrorCode::FolderNotFound,
                            "folder",
                            folder,
                        )));
                    }
                }
                match folders.doc_node(&txn, doc_id) {
                    Some(node) => {
                        folders
                            .set_parent(&mut txn, &node.id, target.as_deref())
                            .map_err(step(TxStep::Folder))?;
                    }
                    None => {
                        if let Some(folder) = &target {
                            let index_token = folders.next_index(&txn, Some(folder));
                            folders.insert_node(
                                &mut txn,
                                &FolderNode {
                                    id: new_node_id(),
                                    parent_id: Some(folder.clone()),
                                    node_type: "doc".to_owned(),
                                    data: doc_id.to_owned(),
                                    index: index_token,
                                    deleted: false,
                                },
                            );
                        }
                    }
                }
            }
            timestamp = self
                .push(&folders_id, &folders_replica, &base)
                .await
                .map_err(step(TxStep::Folder))?;
        }

        Ok(timestamp)
    }

    /// Logical deletion across all four documents.
    pub async fn delete_document(&self, doc_id: &str) -> Result<(), TransactionFailure> {
        let step = |step: TxStep| {
            let doc_id = doc_id.to_owned();
            move |error: ApiError| TransactionFailure::new(step, Some(doc_id.clone()), error)
        };
        let stamp = self.stamp();

        // Step 1: flag the content document itself.
        let (content, base) = self.load(doc_id).await.map_err(step(TxStep::Content))?;
        {
            let meta = content.map("meta");
            let mut txn = content.transact_mut();
            meta.insert(&mut txn, "deleted", true);
        }
        self.push(doc_id, &content, &base)
            .await
            .map_err(step(TxStep::Content))?;

        // Step 2: drop the workspace index entry.
        let (index_replica, base) = self
            .load(self.workspace_id)
            .await
            .map_err(step(TxStep::WorkspaceIndex))?;
        let index = WorkspaceIndex::new(&index_replica);
        let removed = {
            let mut txn = index_replica.transact_mut();
            index.remove_entry(&mut txn, doc_id)
        };
        if removed {
            self.push(self.workspace_id, &index_replica, &base)
                .await
                .map_err(step(TxStep::WorkspaceIndex))?;
        }

        // Step 3: flag the properties record and clear its tags.
        let properties_id = properties_doc_id(self.workspace_id);
        let (properties_replica, base) = self
            .load_or_fresh(&properties_id)
            .await
            .map_err(step(TxStep::Properties))?;
        let properties = DocProperties::new(&properties_replica);
        {
            let mut txn = properties_replica.transact_mut();
            properties.mark_deleted(&mut txn, doc_id, self.user_id, stamp.at_ms);
        }
        self.push(&properties_id, &properties_replica, &base)
            .await
            .map_err(step(TxStep::Properties))?;

        // Step 4: detach and flag the folder node, when placed.
        let folders_id = folders_doc_id(self.workspace_id);
        let (folders_replica, base) = self
            .load_or_fresh(&folders_id)
            .await
            .map_err(step(TxStep::Folder))?;
        let folders = FolderTree::new(&folders_replica);
        let flagged = {
            let mut txn = folders_replica.transact_mut();
            match folders.doc_node(&txn, doc_id) {
                Some(node) => {
                    folders
                        .mark_deleted(&mut txn, &node.id)
                        .map_err(step(TxStep::Folder))?;
                    true
                }
                None => false,
            }
        };
        if flagged {
            self.push(&folders_id, &folders_replica, &base)
                .await
                .map_err(step(TxStep::Folder))?;
        }

        Ok(())
    }

    /// Creates a folder node; a single-document write.
    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<FolderNode, ApiError> {
        let folders_id = folders_doc_id(self.workspace_id);
        let (folders_replica, base) = self.load_or_fresh(&folders_id).await?;
        let folders = FolderTree::new(&folders_replica);

        let node = {
            let mut txn = folders_replica.transact_mut();
            if let Some(parent) = parent_id {
                if !folders.folder_exists(&txn, parent) {
                    return Err(ApiError::not_found(
                        ErrorCode::FolderNotFound,
                        "folder",
                        parent,
                    ));
                }
            }
            let node = FolderNode {
                id: new_node_id(),
                parent_id: parent_id.map(str::to_owned),
                node_type: "folder".to_owned(),
                data: name.to_owned(),
                index: folders.next_index(&txn, parent_id),
                deleted: false,
            };
            folders.insert_node(&mut txn, &node);
            node
        };
        self.push(&folders_id, &folders_replica, &base).await?;
        Ok(node)
    }

    /// Adds a block to the content document. Defaults to the note block as
    /// the parent when none is given.
    pub async fn add_block(
        &self,
        doc_id: &str,
        parent: Option<&str>,
        flavour: &str,
        props: &JsonMap<String, Json>,
        position: Position,
    ) -> Result<String, ApiError> {
        let (content, base) = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        let stamp = self.stamp();

        let block_id = {
            let mut txn = content.transact_mut();
            let parent = match parent {
                Some(parent) => parent.to_owned(),
                None => tree.note_id(&txn).ok_or_else(|| {
                    ApiError::new(ErrorCode::CrdtApplyFailed, "document has no note block")
                })?,
            };
            tree.add_block(&mut txn, &parent, flavour, props, position, &stamp)?
        };

        self.push(doc_id, &content, &base).await?;
        Ok(block_id)
    }

    pub async fn update_block(
        &self,
        doc_id: &str,
        block_id: &str,
        props: &JsonMap<String, Json>,
    ) -> Result<(), ApiError> {
        let (content, base) = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        let stamp = self.stamp();
        {
            let mut txn = content.transact_mut();
            tree.update_block(&mut txn, block_id, props, &stamp)?;
        }
        self.push(doc_id, &content, &base).await?;
        Ok(())
    }

    /// Deletes a block subtree. With `cascade` (the default), references to
    /// the removed blocks are scrubbed from connectors, groups and
    /// mindmaps; without it dangling references are left in place.
    pub async fn delete_block(
        &self,
        doc_id: &str,
        block_id: &str,
        cascade: bool,
    ) -> Result<(), ApiError> {
        let (content, base) = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        {
            let mut txn = content.transact_mut();
            let removed = tree.delete_block(&mut txn, block_id)?;
            if cascade {
                if let Ok(elements) = SurfaceElements::open(&txn, &tree) {
                    elements.scrub_references(&mut txn, &removed);
                }
            }
        }
        self.push(doc_id, &content, &base).await?;
        Ok(())
    }

    /// Uploads image content to the blob store and inserts the referencing
    /// image block as one composite operation.
    pub async fn insert_image(
        &self,
        doc_id: &str,
        blobs: &dyn BlobStore,
        insert: ImageInsert,
    ) -> Result<InsertedImage, ApiError> {
        let blob_id = blobs
            .put_blob(self.workspace_id, insert.data, &insert.mime)
            .await?;

        let mut props = JsonMap::new();
        props.insert("sourceId".to_owned(), Json::String(blob_id.clone()));
        if let Some(caption) = insert.caption {
            props.insert("caption".to_owned(), Json::String(caption));
        }
        if let Some(width) = insert.width {
            props.insert("width".to_owned(), Json::from(width));
        }
        if let Some(height) = insert.height {
            props.insert("height".to_owned(), Json::from(height));
        }

        let block_id = self
            .add_block(
                doc_id,
                insert.parent_block_id.as_deref(),
                flavours::IMAGE,
                &props,
                Position::End,
            )
            .await?;

        Ok(InsertedImage { block_id, blob_id })
    }

    pub async fn create_element(
        &self,
        doc_id: &str,
        input: ElementInput,
    ) -> Result<(String, Json), ApiError> {
        let (content, base) = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        let created = {
            let mut txn = content.transact_mut();
            let elements = SurfaceElements::open_or_create(&mut txn, &tree)?;
            elements.create(&mut txn, input)?
        };
        self.push(doc_id, &content, &base).await?;
        Ok(created)
    }

    pub async fn update_element(
        &self,
        doc_id: &str,
        element_id: &str,
        changes: &JsonMap<String, Json>,
    ) -> Result<Json, ApiError> {
        let (content, base) = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        let view = {
            let mut txn = content.transact_mut();
            let elements = SurfaceElements::open_or_create(&mut txn, &tree)?;
            elements.update(&mut txn, element_id, changes)?
        };
        self.push(doc_id, &content, &base).await?;
        Ok(view)
    }

    /// Deletes an element; with `cleanup`, also scrubs references to it
    /// from connectors, groups and mindmaps.
    pub async fn delete_element(
        &self,
        doc_id: &str,
        element_id: &str,
        cleanup: bool,
    ) -> Result<(), ApiError> {
        let (content, base) = self.load(doc_id).await?;
        let tree = BlockTree::new(&content);
        {
            let mut txn = content.transact_mut();
            let elements = SurfaceElements::open_or_create(&mut txn, &tree)?;
            elements.delete(&mut txn, element_id)?;
            if cleanup {
                elements.scrub_references(&mut txn, &[element_id.to_owned()]);
            }
        }
        self.push(doc_id, &content, &base).await?;
        Ok(())
    }
}
