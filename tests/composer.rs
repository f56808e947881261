//! End-to-end composer and query behavior against the in-memory upstream:
//! cross-document consistency of creation, logical deletion, tag fan-out,
//! idempotent creation, and honest partial-failure reporting.

mod support;

use affine_bridge::crdt::{self, Replica};
use affine_bridge::doc::blocks::BlockTree;
use affine_bridge::doc::workspace::{
    folders_doc_id, properties_doc_id, DocProperties, FolderTree, WorkspaceIndex,
};
use affine_bridge::error::{ErrorCode, TxStep};
use affine_bridge::query::Navigator;
use affine_bridge::transaction::{Composer, CreateDocumentSpec, UpdateDocumentPatch};
use affine_bridge::upstream::SpaceChannel;
use pretty_assertions::assert_eq;
use serde_json::json;
use support::{session_over, FakeBlobs, FakeUpstream};

const WS: &str = "W1";

async fn workspace_with_folder(upstream: &FakeUpstream) -> String {
    upstream.seed_workspace(WS);

    // Seed a folder the way the engine would have written it.
    let replica = Replica::new();
    let folders = FolderTree::new(&replica);
    {
        let mut txn = replica.transact_mut();
        folders.insert_node(
            &mut txn,
            &affine_bridge::doc::workspace::FolderNode {
                id: "F1".to_owned(),
                parent_id: None,
                node_type: "folder".to_owned(),
                data: "Inbox".to_owned(),
                index: "a0".to_owned(),
                deleted: false,
            },
        );
    }
    upstream.seed(WS, &folders_doc_id(WS), &replica);
    "F1".to_owned()
}

#[tokio::test]
async fn create_document_writes_all_four_documents() {
    let upstream = FakeUpstream::new();
    let folder_id = workspace_with_folder(&upstream).await;
    let channel: &dyn SpaceChannel = upstream.as_ref();

    let composer = Composer::new(channel, WS, "user-1");
    let created = composer
        .create_document(CreateDocumentSpec {
            title: Some("Hello".to_owned()),
            markdown: Some("# Hello\n\nworld".to_owned()),
            folder_id: Some(folder_id.clone()),
            doc_id: None,
            tags: vec![],
        })
        .await
        .unwrap();

    assert_eq!(created.title, "Hello");
    assert!(created.folder_node_id.is_some());
    assert!(created.timestamp > 0);

    // (a) exactly one index entry with the doc id.
    let index_replica = upstream.replica(WS, WS).unwrap();
    let index = WorkspaceIndex::new(&index_replica);
    let txn = index_replica.transact();
    let entries: Vec<_> = index
        .entries(&txn)
        .into_iter()
        .filter(|entry| entry.id == created.doc_id)
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].title, "Hello");
    drop(txn);

    // (b) exactly one properties entry, page mode, creator identity.
    let props_replica = upstream.replica(WS, &properties_doc_id(WS)).unwrap();
    let properties = DocProperties::new(&props_replica);
    let txn = props_replica.transact();
    let record = properties.read(&txn, &created.doc_id).unwrap();
    assert_eq!(record["primaryMode"], json!("page"));
    assert_eq!(record["createdBy"], json!("user-1"));
    drop(txn);

    // (c) exactly one folder node referencing the doc.
    let folders_replica = upstream.replica(WS, &folders_doc_id(WS)).unwrap();
    let folders = FolderTree::new(&folders_replica);
    let txn = folders_replica.transact();
    let node = folders.doc_node(&txn, &created.doc_id).unwrap();
    assert_eq!(node.node_type, "doc");
    assert_eq!(node.data, created.doc_id);
    assert_eq!(node.parent_id.as_deref(), Some(folder_id.as_str()));
    drop(txn);

    // (d) the content page title matches the request.
    let content = upstream.replica(WS, &created.doc_id).unwrap();
    let tree = BlockTree::new(&content);
    let txn = content.transact();
    assert_eq!(tree.title(&txn).as_deref(), Some("Hello"));
}

#[tokio::test]
async fn markdown_round_trips_through_the_content_document() {
    let upstream = FakeUpstream::new();
    upstream.seed_workspace(WS);
    let channel: &dyn SpaceChannel = upstream.as_ref();

    let markdown = "# Hello\n\nworld";
    let created = Composer::new(channel, WS, "user-1")
        .create_document(CreateDocumentSpec {
            title: Some("Hello".to_owned()),
            markdown: Some(markdown.to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();

    let navigator = Navigator::new(channel, WS);
    let rendered = navigator.content_markdown(&created.doc_id).await.unwrap();
    assert_eq!(rendered, markdown);
}

#[tokio::test]
async fn create_then_delete_hides_the_document_from_listing() {
    let upstream = FakeUpstream::new();
    let folder_id = workspace_with_folder(&upstream).await;
    let channel: &dyn SpaceChannel = upstream.as_ref();
    let composer = Composer::new(channel, WS, "user-1");

    let created = composer
        .create_document(CreateDocumentSpec {
            title: Some("Hello".to_owned()),
            markdown: Some("# Hello\n\nworld".to_owned()),
            folder_id: Some(folder_id),
            ..Default::default()
        })
        .await
        .unwrap();

    let navigator = Navigator::new(channel, WS);
    let listed = navigator.list_documents().await.unwrap();
    let entry = listed.iter().find(|doc| doc.id == created.doc_id).unwrap();
    assert_eq!(entry.tags, Vec::<String>::new());
    assert_eq!(entry.primary_mode, "page");

    composer.delete_document(&created.doc_id).await.unwrap();

    // Default listing no longer yields the doc.
    let listed = navigator.list_documents().await.unwrap();
    assert!(listed.iter().all(|doc| doc.id != created.doc_id));

    // Properties carry deleted=true; the folder node is detached.
    let props_replica = upstream.replica(WS, &properties_doc_id(WS)).unwrap();
    let properties = DocProperties::new(&props_replica);
    let txn = props_replica.transact();
    assert!(properties.is_deleted(&txn, &created.doc_id));
    drop(txn);

    let folders_replica = upstream.replica(WS, &folders_doc_id(WS)).unwrap();
    let folders = FolderTree::new(&folders_replica);
    let txn = folders_replica.transact();
    let node = folders
        .nodes(&txn)
        .into_iter()
        .find(|node| node.data == created.doc_id)
        .unwrap();
    assert!(node.deleted);
    assert_eq!(node.parent_id, None);

    // The content document flags itself deleted.
    let content = upstream.replica(WS, &created.doc_id).unwrap();
    let meta = content.map("meta");
    let meta_txn = content.transact();
    assert_eq!(crdt::get_bool(&meta_txn, &meta, "deleted"), Some(true));
}

#[tokio::test]
async fn join_workspace_is_idempotent_per_session() {
    let upstream = FakeUpstream::new();
    upstream.seed_workspace(WS);
    let session = session_over(upstream.clone());

    session.join_workspace(WS).await.unwrap();
    session.join_workspace(WS).await.unwrap();
    session.join_workspace(WS).await.unwrap();

    assert_eq!(upstream.join_count(WS), 1);
}

#[tokio::test]
async fn supplied_doc_id_conflicts_instead_of_overwriting() {
    let upstream = FakeUpstream::new();
    upstream.seed_workspace(WS);
    let channel: &dyn SpaceChannel = upstream.as_ref();
    let composer = Composer::new(channel, WS, "user-1");

    let first = composer
        .create_document(CreateDocumentSpec {
            title: Some("One".to_owned()),
            doc_id: Some("fixed-id".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.doc_id, "fixed-id");

    let failure = composer
        .create_document(CreateDocumentSpec {
            title: Some("Two".to_owned()),
            doc_id: Some("fixed-id".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(failure.error.code, ErrorCode::DocumentAlreadyExists);

    // The original content is untouched.
    let content = upstream.replica(WS, "fixed-id").unwrap();
    let tree = BlockTree::new(&content);
    let txn = content.transact();
    assert_eq!(tree.title(&txn).as_deref(), Some("One"));
}

#[tokio::test]
async fn step_failure_surfaces_the_durable_doc_id() {
    let upstream = FakeUpstream::new();
    upstream.seed_workspace(WS);
    let channel: &dyn SpaceChannel = upstream.as_ref();
    let composer = Composer::new(channel, WS, "user-1");

    // Step 3 (properties) is rejected upstream.
    upstream.fail_next_push(&properties_doc_id(WS), ErrorCode::DocUpdateBlocked);

    let failure = composer
        .create_document(CreateDocumentSpec {
            title: Some("Hello".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert_eq!(failure.step, TxStep::Properties);
    assert_eq!(failure.error.code, ErrorCode::DocUpdateBlocked);
    let doc_id = failure.doc_id.expect("durable doc id is reported");

    // The earlier steps are durable: the content doc exists and loads.
    assert!(upstream.contains_doc(WS, &doc_id));
    let navigator = Navigator::new(channel, WS);
    let summary = navigator.document_summary(&doc_id).await.unwrap();
    assert_eq!(summary.id, doc_id);
}

#[tokio::test]
async fn tag_updates_reach_index_and_properties() {
    let upstream = FakeUpstream::new();
    upstream.seed_workspace(WS);
    let channel: &dyn SpaceChannel = upstream.as_ref();
    let composer = Composer::new(channel, WS, "user-1");

    let created = composer
        .create_document(CreateDocumentSpec {
            title: Some("Tagged".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();

    composer
        .update_document(
            &created.doc_id,
            &UpdateDocumentPatch {
                tags: Some(vec!["a".to_owned(), "b".to_owned()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let navigator = Navigator::new(channel, WS);
    let listed = navigator.list_documents().await.unwrap();
    let doc = listed.iter().find(|doc| doc.id == created.doc_id).unwrap();
    assert_eq!(doc.tags, vec!["a", "b"]);

    let props_replica = upstream.replica(WS, &properties_doc_id(WS)).unwrap();
    let properties = DocProperties::new(&props_replica);
    let txn = props_replica.transact();
    let record = properties.read(&txn, &created.doc_id).unwrap();
    assert_eq!(record["tags"], json!(["a", "b"]));
}

#[tokio::test]
async fn title_update_rewrites_index_and_page_title() {
    let upstream = FakeUpstream::new();
    upstream.seed_workspace(WS);
    let channel: &dyn SpaceChannel = upstream.as_ref();
    let composer = Composer::new(channel, WS, "user-1");

    let created = composer
        .create_document(CreateDocumentSpec {
            title: Some("Before".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();

    composer
        .update_document(
            &created.doc_id,
            &UpdateDocumentPatch {
                title: Some("After".to_owned()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let content = upstream.replica(WS, &created.doc_id).unwrap();
    let tree = BlockTree::new(&content);
    let txn = content.transact();
    assert_eq!(tree.title(&txn).as_deref(), Some("After"));
    drop(txn);

    let index_replica = upstream.replica(WS, WS).unwrap();
    let index = WorkspaceIndex::new(&index_replica);
    let txn = index_replica.transact();
    assert_eq!(index.entry(&txn, &created.doc_id).unwrap().title, "After");
}

#[tokio::test]
async fn element_update_merges_and_preserves_other_keys() {
    let upstream = FakeUpstream::new();
    upstream.seed_workspace(WS);
    let channel: &dyn SpaceChannel = upstream.as_ref();
    let composer = Composer::new(channel, WS, "user-1");

    let created = composer
        .create_document(CreateDocumentSpec {
            title: Some("Canvas".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();

    let input: affine_bridge::doc::elements::ElementInput = serde_json::from_value(json!({
        "type": "shape",
        "shapeType": "rect",
        "xywh": [0, 0, 100, 100],
    }))
    .unwrap();
    let (element_id, _) = composer.create_element(&created.doc_id, input).await.unwrap();

    let changes = json!({ "xywh": [50, 50, 200, 200], "fillColor": "#fcd34d" });
    let view = composer
        .update_element(
            &created.doc_id,
            &element_id,
            changes.as_object().unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(view["xywh"], json!([50.0, 50.0, 200.0, 200.0]));
    assert_eq!(view["fillColor"], json!("#fcd34d"));
    assert_eq!(view["strokeColor"], json!("#000"));

    // A re-read through the query layer shows the merged element.
    let navigator = Navigator::new(channel, WS);
    let fetched = navigator.element(&created.doc_id, &element_id).await.unwrap();
    assert_eq!(fetched["xywh"], json!([50.0, 50.0, 200.0, 200.0]));
    assert_eq!(fetched["fillColor"], json!("#fcd34d"));
}

#[tokio::test]
async fn image_composite_uploads_then_links_the_block() {
    let upstream = FakeUpstream::new();
    upstream.seed_workspace(WS);
    let channel: &dyn SpaceChannel = upstream.as_ref();
    let composer = Composer::new(channel, WS, "user-1");
    let blobs = FakeBlobs::default();

    let created = composer
        .create_document(CreateDocumentSpec {
            title: Some("Pictures".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();

    let inserted = composer
        .insert_image(
            &created.doc_id,
            &blobs,
            affine_bridge::transaction::ImageInsert {
                data: vec![0x89, 0x50, 0x4e, 0x47, 0, 0, 0, 0, 0, 0, 0, 0],
                mime: "image/png".to_owned(),
                parent_block_id: None,
                caption: Some("a tiny png".to_owned()),
                width: Some(12.0),
                height: Some(8.0),
            },
        )
        .await
        .unwrap();

    assert_eq!(blobs.stored.lock().unwrap().len(), 1);

    let content = upstream.replica(WS, &created.doc_id).unwrap();
    let tree = BlockTree::new(&content);
    let txn = content.transact();
    let node = tree.read_block(&txn, &inserted.block_id).unwrap();
    assert_eq!(node.flavour, "affine:image");
    assert_eq!(node.props["sourceId"], json!(inserted.blob_id));
    assert_eq!(node.props["caption"], json!("a tiny png"));
    assert_eq!(node.props["width"], json!(12.0));

    // The block landed under the note.
    let note = tree.note_id(&txn).unwrap();
    assert!(tree.child_ids(&txn, &note).contains(&inserted.block_id));
}

#[tokio::test]
async fn folder_hierarchy_reflects_creation() {
    let upstream = FakeUpstream::new();
    upstream.seed_workspace(WS);
    let channel: &dyn SpaceChannel = upstream.as_ref();
    let composer = Composer::new(channel, WS, "user-1");

    let parent = composer.create_folder("Projects", None).await.unwrap();
    let child = composer
        .create_folder("Archive", Some(&parent.id))
        .await
        .unwrap();
    let created = composer
        .create_document(CreateDocumentSpec {
            title: Some("Doc".to_owned()),
            folder_id: Some(child.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

    let navigator = Navigator::new(channel, WS);
    let hierarchy = navigator.hierarchy(false).await.unwrap();
    assert_eq!(hierarchy.len(), 1);
    assert_eq!(hierarchy[0].name, "Projects");
    assert_eq!(hierarchy[0].children.len(), 1);
    assert_eq!(hierarchy[0].children[0].name, "Archive");
    let docs = &hierarchy[0].children[0].children;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].doc_id.as_deref(), Some(created.doc_id.as_str()));

    let contents = navigator.folder_contents(&child.id).await.unwrap();
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].kind, "doc");
    assert_eq!(contents[0].name, "Doc");
}
