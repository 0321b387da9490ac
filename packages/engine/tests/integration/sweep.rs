use ::common::storage::{Fingerprint, ObjectStore};
use engine::entity::{content_object, organization, user_reference};
use sea_orm::sea_query::Expr;
use sea_orm::EntityTrait;

use crate::common::{TestVault, request_info};

/// Age a reference and its object far past every grace window.
async fn age_rows(t: &TestVault) {
    let old = chrono::Utc::now() - chrono::Duration::days(365);
    user_reference::Entity::update_many()
        .col_expr(user_reference::Column::UpdatedAt, Expr::value(old))
        .exec(&t.db)
        .await
        .unwrap();
    content_object::Entity::update_many()
        .col_expr(content_object::Column::UpdatedAt, Expr::value(old))
        .exec(&t.db)
        .await
        .unwrap();
}

#[tokio::test]
async fn orphan_blobs_are_reconciled() {
    let t = TestVault::spawn().await;
    t.create_org("acme", "alice").await;

    // A blob written without a metadata row: the crash-between-put-and-
    // commit residue.
    let orphan = Fingerprint::compute(b"orphaned bytes");
    t.vault
        .store
        .put_bytes(&orphan.storage_key(), b"orphaned bytes")
        .await
        .unwrap();

    let report = t.vault.sweep_once().await;
    assert_eq!(report.orphan_blobs_removed, 1);

    assert!(matches!(
        t.vault.store.get(&orphan.storage_key()).await,
        Err(::common::storage::StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn live_blobs_survive_the_orphan_sweep() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;

    let upload = t
        .ingest(org.creator.id, "keep.txt", "/", b"keep these bytes")
        .await
        .unwrap();

    let report = t.vault.sweep_once().await;
    assert_eq!(report.orphan_blobs_removed, 0);
    assert_eq!(report.objects_removed, 0);

    assert_eq!(
        t.download(org.creator.id, upload.reference_id).await.unwrap(),
        b"keep these bytes"
    );
}

#[tokio::test]
async fn zero_reference_objects_are_collected_and_quota_returned() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let upload = t
        .ingest(alice, "victim.txt", "/", b"collectible content")
        .await
        .unwrap();
    t.vault
        .delete_reference(alice, upload.reference_id, &request_info())
        .await
        .unwrap();

    // Fresh deletions sit inside the grace windows; nothing moves yet.
    let report = t.vault.sweep_once().await;
    assert_eq!(report.objects_removed, 0);

    age_rows(&t).await;
    let report = t.vault.sweep_once().await;

    assert_eq!(report.references_purged, 1);
    assert_eq!(report.objects_removed, 1);
    assert_eq!(report.bytes_reclaimed, 19);

    // Row, blob and usage are all gone.
    assert!(
        content_object::Entity::find_by_id(upload.object_id)
            .one(&t.db)
            .await
            .unwrap()
            .is_none()
    );
    let object_key = Fingerprint::compute(b"collectible content").storage_key();
    assert!(t.vault.store.get(&object_key).await.is_err());

    let used = organization::Entity::find_by_id(org.organization.id)
        .one(&t.db)
        .await
        .unwrap()
        .unwrap()
        .used_bytes;
    assert_eq!(used, 0);
}

#[tokio::test]
async fn objects_with_surviving_references_are_kept() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    let a = t.ingest(alice, "a.txt", "/", b"still shared").await.unwrap();
    let b = t.ingest(bob, "b.txt", "/", b"still shared").await.unwrap();

    t.vault
        .delete_reference(alice, a.reference_id, &request_info())
        .await
        .unwrap();
    age_rows(&t).await;

    let report = t.vault.sweep_once().await;

    // Alice's dead row is purged, but the object lives on for bob.
    assert_eq!(report.references_purged, 1);
    assert_eq!(report.objects_removed, 0);
    assert_eq!(t.download(bob, b.reference_id).await.unwrap(), b"still shared");
}
