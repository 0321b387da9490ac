use engine::entity::organization;
use engine::error::VaultError;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

use crate::common::TestVault;

/// Pin an organization's persisted usage counter.
async fn set_used_bytes(t: &TestVault, org_id: uuid::Uuid, used: i64) {
    organization::Entity::update_many()
        .col_expr(organization::Column::UsedBytes, Expr::value(used))
        .filter(organization::Column::Id.eq(org_id))
        .exec(&t.db)
        .await
        .unwrap();
}

async fn used_bytes(t: &TestVault, org_id: uuid::Uuid) -> i64 {
    organization::Entity::find_by_id(org_id)
        .one(&t.db)
        .await
        .unwrap()
        .unwrap()
        .used_bytes
}

#[tokio::test]
async fn upload_inside_allocation_is_admitted() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;

    t.ingest(org.creator.id, "ok.bin", "/", &[0u8; 4096])
        .await
        .unwrap();
    assert_eq!(used_bytes(&t, org.organization.id).await, 4096);
}

#[tokio::test]
async fn quota_cliff_rejects_without_state_changes() {
    // 1 MiB allocation, 6 bytes of headroom.
    let t = TestVault::spawn_with(|c| c.quota.default_mb = 1).await;
    let org = t.create_org("tight", "alice").await;
    set_used_bytes(&t, org.organization.id, 1_048_570).await;

    let result = t.ingest(org.creator.id, "seven.bin", "/", b"1234567").await;
    match result {
        Err(VaultError::QuotaExceeded { used, allocated }) => {
            assert_eq!(used, 1_048_570);
            assert_eq!(allocated, 1_048_576);
        }
        other => panic!("expected quota-exceeded, got {other:?}"),
    }

    // Nothing moved: counter unchanged, no object row written.
    assert_eq!(used_bytes(&t, org.organization.id).await, 1_048_570);
    assert!(
        engine::entity::content_object::Entity::find()
            .all(&t.db)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn dedup_hit_is_admitted_even_at_the_cliff() {
    let t = TestVault::spawn_with(|c| c.quota.default_mb = 1).await;
    let org = t.create_org("tight", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    // Seed the content while there is room.
    t.ingest(alice, "seed.bin", "/", b"1234567").await.unwrap();

    // Now the organization is effectively full.
    set_used_bytes(&t, org.organization.id, 1_048_570).await;

    // The same bytes from another principal ride the existing object.
    let outcome = t.ingest(bob, "copy.bin", "/", b"1234567").await.unwrap();
    assert!(outcome.deduplicated);
    assert_eq!(outcome.bytes_saved, 7);
    assert_eq!(used_bytes(&t, org.organization.id).await, 1_048_570);
}

#[tokio::test]
async fn exact_fit_is_admitted() {
    let t = TestVault::spawn_with(|c| c.quota.default_mb = 1).await;
    let org = t.create_org("snug", "alice").await;
    set_used_bytes(&t, org.organization.id, 1_048_576 - 7).await;

    t.ingest(org.creator.id, "fits.bin", "/", b"1234567")
        .await
        .unwrap();
    assert_eq!(used_bytes(&t, org.organization.id).await, 1_048_576);
}

#[tokio::test]
async fn failed_validation_releases_nothing() {
    let t = TestVault::spawn_with(|c| c.quota.default_mb = 1).await;
    let org = t.create_org("acme", "alice").await;

    let _ = t.ingest(org.creator.id, "bad.exe", "/", b"data").await;
    // Headroom is fully available afterwards.
    t.ingest(org.creator.id, "good.bin", "/", &[0u8; 1_000_000])
        .await
        .unwrap();
}

#[tokio::test]
async fn organizations_are_isolated() {
    let t = TestVault::spawn_with(|c| c.quota.default_mb = 1).await;
    let org_a = t.create_org("org-a", "alice").await;
    let org_b = t.create_org("org-b", "bella").await;

    set_used_bytes(&t, org_a.organization.id, 1_048_576).await;

    // A full org-a does not impede org-b.
    t.ingest(org_b.creator.id, "free.bin", "/", b"payload")
        .await
        .unwrap();

    let result = t.ingest(org_a.creator.id, "stuck.bin", "/", b"payload2").await;
    assert!(matches!(result, Err(VaultError::QuotaExceeded { .. })));
}
