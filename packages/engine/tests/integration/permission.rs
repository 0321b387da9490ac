use engine::entity::{content_object, group_member};
use engine::error::VaultError;
use engine::permission::Action;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use crate::common::{TestVault, request_info};

async fn set_object_mask(t: &TestVault, object_id: Uuid, mask: i32) {
    content_object::Entity::update_many()
        .col_expr(content_object::Column::PermissionMask, Expr::value(mask))
        .filter(content_object::Column::Id.eq(object_id))
        .exec(&t.db)
        .await
        .unwrap();
}

/// Drop every group membership a user has (simulates a bare org member).
async fn clear_memberships(t: &TestVault, user_id: Uuid) {
    group_member::Entity::delete_many()
        .filter(group_member::Column::UserId.eq(user_id))
        .exec(&t.db)
        .await
        .unwrap();
}

#[tokio::test]
async fn group_member_reads_but_cannot_write() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    // bob joins `users`, the object's primary group.
    let bob = t.register_member(org.organization.id, "bob").await;

    let upload = t.ingest(alice, "report.txt", "/", b"contents").await.unwrap();
    set_object_mask(&t, upload.object_id, 0o640).await;

    assert!(
        t.vault
            .resolve_permission(bob, upload.reference_id, Action::Read)
            .await
            .unwrap()
    );
    assert!(
        !t.vault
            .resolve_permission(bob, upload.reference_id, Action::Write)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn outsider_gets_others_triad() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let carol = t.register_member(org.organization.id, "carol").await;
    clear_memberships(&t, carol).await;

    let upload = t.ingest(alice, "report.txt", "/", b"contents").await.unwrap();
    set_object_mask(&t, upload.object_id, 0o640).await;

    assert!(
        !t.vault
            .resolve_permission(carol, upload.reference_id, Action::Read)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn org_admin_gets_everything() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    let upload = t.ingest(bob, "private.txt", "/", b"secret").await.unwrap();
    set_object_mask(&t, upload.object_id, 0o600).await;

    // alice created the org, so she sits in the admin system group.
    for action in [Action::Read, Action::Write, Action::Execute] {
        assert!(
            t.vault
                .resolve_permission(alice, upload.reference_id, action)
                .await
                .unwrap(),
            "admin should be allowed {action:?}"
        );
    }
}

#[tokio::test]
async fn owner_follows_owner_triad() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    let upload = t.ingest(bob, "mine.txt", "/", b"mine").await.unwrap();
    // Write-only owner triad: the owner keeps write but loses read.
    set_object_mask(&t, upload.object_id, 0o200).await;

    assert!(
        !t.vault
            .resolve_permission(bob, upload.reference_id, Action::Read)
            .await
            .unwrap()
    );
    assert!(
        t.vault
            .resolve_permission(bob, upload.reference_id, Action::Write)
            .await
            .unwrap()
    );
    let _ = alice;
}

#[tokio::test]
async fn resolve_read_matches_download_outcome() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    let upload = t.ingest(alice, "file.txt", "/", b"payload").await.unwrap();
    set_object_mask(&t, upload.object_id, 0o640).await;

    // bob: read allowed through the primary group, download succeeds.
    assert!(
        t.vault
            .resolve_permission(bob, upload.reference_id, Action::Read)
            .await
            .unwrap()
    );
    assert_eq!(t.download(bob, upload.reference_id).await.unwrap(), b"payload");

    // Narrow the group triad; download turns forbidden with resolve.
    set_object_mask(&t, upload.object_id, 0o600).await;
    assert!(
        !t.vault
            .resolve_permission(bob, upload.reference_id, Action::Read)
            .await
            .unwrap()
    );
    assert!(matches!(
        t.download(bob, upload.reference_id).await,
        Err(VaultError::Forbidden)
    ));
}

#[tokio::test]
async fn group_override_widens_access() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let carol = t.register_member(org.organization.id, "carol").await;
    clear_memberships(&t, carol).await;

    let upload = t.ingest(alice, "shared.txt", "/", b"for the team").await.unwrap();
    set_object_mask(&t, upload.object_id, 0o600).await;

    // Put carol in a dedicated group, grant the group read via override.
    let reviewers = &org.groups[2]; // guests system group, carol joins it
    t.vault
        .add_group_member(reviewers.id, carol, alice)
        .await
        .unwrap();

    assert!(
        !t.vault
            .resolve_permission(carol, upload.reference_id, Action::Read)
            .await
            .unwrap()
    );

    t.vault
        .set_group_permission(alice, upload.object_id, reviewers.id, 0o040, &request_info())
        .await
        .unwrap();

    assert!(
        t.vault
            .resolve_permission(carol, upload.reference_id, Action::Read)
            .await
            .unwrap()
    );
    assert!(
        !t.vault
            .resolve_permission(carol, upload.reference_id, Action::Write)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn cross_organization_access_is_absolute() {
    let t = TestVault::spawn().await;
    let org_a = t.create_org("org-a", "alice").await;
    let org_b = t.create_org("org-b", "bella").await;

    let upload = t
        .ingest(org_a.creator.id, "internal.txt", "/", b"org-a only")
        .await
        .unwrap();
    // Even a wide-open mask stops at the tenant boundary.
    set_object_mask(&t, upload.object_id, 0o777).await;

    assert!(
        !t.vault
            .resolve_permission(org_b.creator.id, upload.reference_id, Action::Read)
            .await
            .unwrap()
    );
    assert!(matches!(
        t.download(org_b.creator.id, upload.reference_id).await,
        Err(VaultError::Forbidden)
    ));
}

#[tokio::test]
async fn cross_org_dedup_holder_keeps_their_copy_readable() {
    let t = TestVault::spawn().await;
    let org_a = t.create_org("org-a", "alice").await;
    let org_b = t.create_org("org-b", "bella").await;

    let first = t
        .ingest(org_a.creator.id, "doc.txt", "/", b"same bytes")
        .await
        .unwrap();
    let second = t
        .ingest(org_b.creator.id, "doc.txt", "/", b"same bytes")
        .await
        .unwrap();

    // One object, anchored in org-a, referenced from org-b.
    assert_eq!(first.object_id, second.object_id);
    assert!(second.deduplicated);

    // The org-b holder reads through their own reference.
    assert_eq!(
        t.download(org_b.creator.id, second.reference_id).await.unwrap(),
        b"same bytes"
    );
}

#[tokio::test]
async fn nonexistent_reference_is_not_found() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;

    let result = t
        .vault
        .resolve_permission(org.creator.id, Uuid::new_v4(), Action::Read)
        .await;
    assert!(matches!(result, Err(VaultError::NotFound)));
}
