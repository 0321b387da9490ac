use engine::entity::user_reference;
use engine::error::VaultError;
use engine::models::reference::SortOrder;
use sea_orm::EntityTrait;
use uuid::Uuid;

use crate::common::{TestVault, request_info};

#[tokio::test]
async fn listing_is_scoped_and_paginated() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    for i in 0..5 {
        t.ingest(alice, &format!("file-{i}.txt"), "/docs", format!("payload {i}").as_bytes())
            .await
            .unwrap();
    }
    t.ingest(alice, "elsewhere.txt", "/other", b"elsewhere").await.unwrap();
    t.ingest(bob, "bobs.txt", "/docs", b"bob data").await.unwrap();

    let page1 = t
        .vault
        .list_references(alice, Some("/docs"), 1, 2, SortOrder::NameAsc)
        .await
        .unwrap();
    assert_eq!(page1.references.len(), 2);
    assert_eq!(page1.pagination.total, 5);
    assert_eq!(page1.pagination.total_pages, 3);
    assert_eq!(page1.references[0].filename, "file-0.txt");

    // Only alice's own references show up, and only the requested folder.
    let all = t
        .vault
        .list_references(alice, None, 1, 50, SortOrder::CreatedAsc)
        .await
        .unwrap();
    assert_eq!(all.pagination.total, 6);
    assert!(all.references.iter().all(|r| r.filename != "bobs.txt"));
}

#[tokio::test]
async fn listing_carries_effective_permissions() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    t.ingest(alice, "mine.txt", "/", b"data").await.unwrap();

    let list = t
        .vault
        .list_references(alice, None, 1, 10, SortOrder::CreatedDesc)
        .await
        .unwrap();
    let entry = &list.references[0];
    assert_eq!(entry.octal, "644");
    // Owner triad of 0o644.
    assert!(entry.permissions.can_read);
    assert!(entry.permissions.can_write);
    assert!(!entry.permissions.can_execute);
}

#[tokio::test]
async fn metadata_reports_dedup_siblings() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    let a = t.ingest(alice, "a.txt", "/", b"shared").await.unwrap();
    let b = t.ingest(bob, "b.txt", "/", b"shared").await.unwrap();

    let details = t
        .vault
        .get_reference_metadata(alice, a.reference_id)
        .await
        .unwrap();

    assert_eq!(details.reference_count, 2);
    assert_eq!(details.siblings.len(), 1);
    assert_eq!(details.siblings[0].reference_id, b.reference_id);
    assert_eq!(details.siblings[0].username, "bob");
    assert_eq!(
        details.content_hash,
        ::common::storage::Fingerprint::compute(b"shared").to_hex()
    );
}

#[tokio::test]
async fn download_round_trips_and_counts() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let upload = t.ingest(alice, "data.bin", "/", b"round trip bytes").await.unwrap();

    assert_eq!(
        t.download(alice, upload.reference_id).await.unwrap(),
        b"round trip bytes"
    );
    assert_eq!(t.download(alice, upload.reference_id).await.unwrap(), b"round trip bytes");

    let reference = user_reference::Entity::find_by_id(upload.reference_id)
        .one(&t.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reference.download_count, 2);
    assert!(reference.last_accessed.is_some());
}

#[tokio::test]
async fn delete_soft_deletes_and_second_call_is_not_found() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let upload = t.ingest(alice, "gone.txt", "/", b"to delete").await.unwrap();

    t.vault
        .delete_reference(alice, upload.reference_id, &request_info())
        .await
        .unwrap();

    // Soft delete: the row survives, flagged.
    let reference = user_reference::Entity::find_by_id(upload.reference_id)
        .one(&t.db)
        .await
        .unwrap()
        .unwrap();
    assert!(reference.is_deleted);

    let again = t
        .vault
        .delete_reference(alice, upload.reference_id, &request_info())
        .await;
    assert!(matches!(again, Err(VaultError::NotFound)));

    let download = t.download(alice, upload.reference_id).await;
    assert!(matches!(download, Err(VaultError::NotFound)));
}

#[tokio::test]
async fn delete_frees_the_name_for_reuse() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let first = t.ingest(alice, "name.txt", "/", b"v1").await.unwrap();
    t.vault
        .delete_reference(alice, first.reference_id, &request_info())
        .await
        .unwrap();

    // The partial unique index only guards live rows.
    t.ingest(alice, "name.txt", "/", b"v2").await.unwrap();
}

#[tokio::test]
async fn delete_decrements_reference_count() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    let a = t.ingest(alice, "a.txt", "/", b"counted").await.unwrap();
    let b = t.ingest(bob, "b.txt", "/", b"counted").await.unwrap();

    t.vault
        .delete_reference(alice, a.reference_id, &request_info())
        .await
        .unwrap();

    let object = engine::entity::content_object::Entity::find_by_id(a.object_id)
        .one(&t.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(object.reference_count, 1);

    // The surviving reference still reads fine.
    assert_eq!(t.download(bob, b.reference_id).await.unwrap(), b"counted");
}

#[tokio::test]
async fn usage_summary_tracks_logical_vs_physical() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    let payload = vec![0x5Au8; 1000];
    t.ingest(alice, "one.bin", "/", &payload).await.unwrap();
    t.ingest(bob, "two.bin", "/", &payload).await.unwrap();
    t.ingest(alice, "other.bin", "/", &[0x21u8; 500]).await.unwrap();

    let summary = t.vault.usage_summary(alice).await.unwrap();
    assert_eq!(summary.used_bytes, 1500);
    assert_eq!(summary.logical_bytes, 2500);
    assert_eq!(summary.savings_bytes, 1000);
    assert_eq!(summary.reference_count, 3);
    assert_eq!(summary.unique_object_count, 2);
    assert_eq!(summary.allocated_bytes, 64 * 1024 * 1024);
}

#[tokio::test]
async fn unknown_reference_is_not_found() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;

    let result = t.vault.get_reference_metadata(org.creator.id, Uuid::new_v4()).await;
    assert!(matches!(result, Err(VaultError::NotFound)));

    let result = t.download(org.creator.id, Uuid::new_v4()).await;
    assert!(matches!(result, Err(VaultError::NotFound)));
}
