use engine::audit::AuditFilters;
use engine::entity::refresh_token;
use engine::error::VaultError;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

use crate::common::{TestVault, request_info};

#[tokio::test]
async fn issue_validate_round_trip() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let secret = t
        .vault
        .issue_refresh_token(alice, &request_info())
        .await
        .unwrap();
    assert_eq!(secret.len(), 64);

    let resolved = t.vault.validate_refresh_token(&secret).await.unwrap();
    assert_eq!(resolved, alice);
}

#[tokio::test]
async fn secret_is_stored_only_as_hash() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;

    let secret = t
        .vault
        .issue_refresh_token(org.creator.id, &request_info())
        .await
        .unwrap();

    let rows = refresh_token::Entity::find().all(&t.db).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_ne!(rows[0].token_hash, secret);
    assert_eq!(rows[0].token_hash.len(), 64);
}

#[tokio::test]
async fn revoked_token_stops_validating() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let secret = t
        .vault
        .issue_refresh_token(alice, &request_info())
        .await
        .unwrap();

    t.vault
        .revoke_refresh_token(&secret, &request_info())
        .await
        .unwrap();
    // Revoking again is harmless.
    t.vault
        .revoke_refresh_token(&secret, &request_info())
        .await
        .unwrap();

    let result = t.vault.validate_refresh_token(&secret).await;
    assert!(matches!(result, Err(VaultError::NotFound)));
}

#[tokio::test]
async fn expired_token_stops_validating() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let secret = t
        .vault
        .issue_refresh_token(alice, &request_info())
        .await
        .unwrap();

    refresh_token::Entity::update_many()
        .col_expr(
            refresh_token::Column::ExpiresAt,
            Expr::value(chrono::Utc::now() - chrono::Duration::hours(1)),
        )
        .filter(refresh_token::Column::UserId.eq(alice))
        .exec(&t.db)
        .await
        .unwrap();

    let result = t.vault.validate_refresh_token(&secret).await;
    assert!(matches!(result, Err(VaultError::NotFound)));
}

#[tokio::test]
async fn unknown_secret_is_not_found() {
    let t = TestVault::spawn().await;
    t.create_org("acme", "alice").await;

    let result = t.vault.validate_refresh_token(&"0".repeat(64)).await;
    assert!(matches!(result, Err(VaultError::NotFound)));
}

#[tokio::test]
async fn revoke_all_invalidates_every_session() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let s1 = t.vault.issue_refresh_token(alice, &request_info()).await.unwrap();
    let s2 = t.vault.issue_refresh_token(alice, &request_info()).await.unwrap();

    let revoked = t.vault.revoke_all_refresh_tokens(alice).await.unwrap();
    assert_eq!(revoked, 2);

    assert!(t.vault.validate_refresh_token(&s1).await.is_err());
    assert!(t.vault.validate_refresh_token(&s2).await.is_err());
}

#[tokio::test]
async fn login_and_logout_reach_the_audit_log() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let secret = t
        .vault
        .issue_refresh_token(alice, &request_info())
        .await
        .unwrap();
    t.vault
        .revoke_refresh_token(&secret, &request_info())
        .await
        .unwrap();
    t.vault.flush_audit().await;

    for action in ["user_login", "user_logout"] {
        let filters = AuditFilters {
            action: Some(action.to_string()),
            user_id: Some(alice),
            ..Default::default()
        };
        let (events, _) = t.vault.query_audit_events(&filters, 1, 10).await.unwrap();
        assert_eq!(events.len(), 1, "expected one {action} event");
    }
}
