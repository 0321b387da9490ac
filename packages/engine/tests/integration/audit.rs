use engine::audit::AuditFilters;
use engine::entity::audit_event::AuditStatus;
use engine::error::VaultError;

use crate::common::{TestVault, request_info};

#[tokio::test]
async fn successful_upload_leaves_a_trail() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let upload = t.ingest(alice, "tracked.txt", "/", b"audit me").await.unwrap();
    t.vault.flush_audit().await;

    let filters = AuditFilters {
        action: Some("file_upload".to_string()),
        ..Default::default()
    };
    let (events, pagination) = t.vault.query_audit_events(&filters, 1, 50).await.unwrap();

    assert_eq!(pagination.total, 1);
    let event = &events[0];
    assert_eq!(event.user_id, Some(alice));
    assert_eq!(event.organization_id, Some(org.organization.id));
    assert_eq!(event.resource_id, Some(upload.reference_id));
    assert_eq!(event.status, AuditStatus::Success);
    assert_eq!(event.ip_address, "203.0.113.7");
    assert_eq!(event.details["filename"], "tracked.txt");
    assert_eq!(event.details["deduplicated"], false);
}

#[tokio::test]
async fn download_and_delete_are_audited() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    let upload = t.ingest(alice, "life.txt", "/", b"cycle").await.unwrap();
    t.download(alice, upload.reference_id).await.unwrap();
    t.vault
        .delete_reference(alice, upload.reference_id, &request_info())
        .await
        .unwrap();
    t.vault.flush_audit().await;

    for action in ["file_download", "file_delete"] {
        let filters = AuditFilters {
            action: Some(action.to_string()),
            resource_id: Some(upload.reference_id),
            ..Default::default()
        };
        let (events, _) = t.vault.query_audit_events(&filters, 1, 10).await.unwrap();
        assert_eq!(events.len(), 1, "expected one {action} event");
    }
}

#[tokio::test]
async fn rejected_upload_is_recorded_as_failure() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;

    let _ = t.ingest(org.creator.id, "virus.exe", "/", b"nope").await;
    t.vault.flush_audit().await;

    let filters = AuditFilters {
        action: Some("file_upload".to_string()),
        ..Default::default()
    };
    let (events, _) = t.vault.query_audit_events(&filters, 1, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, AuditStatus::Failure);
    assert_eq!(events[0].details["error"], "invalid-content");
}

#[tokio::test]
async fn rate_denial_is_recorded() {
    let t = TestVault::spawn_with(|c| {
        c.rate.principal.rps = 1;
        c.rate.principal.burst = 1;
    })
    .await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    t.ingest(alice, "ok.txt", "/", b"fine").await.unwrap();
    let denied = t.ingest(alice, "no.txt", "/", b"denied").await;
    assert!(matches!(denied, Err(VaultError::RateLimited)));
    t.vault.flush_audit().await;

    let filters = AuditFilters {
        action: Some("rate_limit_exceeded".to_string()),
        user_id: Some(alice),
        ..Default::default()
    };
    let (events, _) = t.vault.query_audit_events(&filters, 1, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, AuditStatus::Failure);
}

#[tokio::test]
async fn quota_denial_is_recorded() {
    let t = TestVault::spawn_with(|c| c.quota.default_mb = 1).await;
    let org = t.create_org("tiny", "alice").await;

    let too_big = vec![0u8; 2 * 1024 * 1024];
    let result = t.ingest(org.creator.id, "big.bin", "/", &too_big).await;
    assert!(matches!(result, Err(VaultError::QuotaExceeded { .. })));
    t.vault.flush_audit().await;

    let filters = AuditFilters {
        action: Some("quota_exceeded".to_string()),
        ..Default::default()
    };
    let (events, _) = t.vault.query_audit_events(&filters, 1, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].resource_id, Some(org.organization.id));
}

#[tokio::test]
async fn retention_cleanup_purges_and_audits_itself() {
    use sea_orm::sea_query::Expr;
    use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

    let t = TestVault::spawn_with(|c| c.audit.retention_days = 30).await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    t.ingest(alice, "old.txt", "/", b"old").await.unwrap();
    t.vault.flush_audit().await;

    // Age every event past the retention window.
    engine::entity::audit_event::Entity::update_many()
        .col_expr(
            engine::entity::audit_event::Column::CreatedAt,
            Expr::value(chrono::Utc::now() - chrono::Duration::days(31)),
        )
        .filter(engine::entity::audit_event::Column::UserId.is_not_null())
        .exec(&t.db)
        .await
        .unwrap();

    let purged = t.vault.run_audit_retention().await.unwrap();
    assert!(purged >= 1);
    t.vault.flush_audit().await;

    let filters = AuditFilters {
        action: Some("audit_cleanup".to_string()),
        ..Default::default()
    };
    let (events, _) = t.vault.query_audit_events(&filters, 1, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].details["purged_rows"], purged);
    assert_eq!(events[0].details["retention_days"], 30);
}

#[tokio::test]
async fn no_events_are_dropped_under_normal_load() {
    let t = TestVault::spawn().await;
    let org = t.create_org("acme", "alice").await;

    for i in 0..20 {
        t.ingest(org.creator.id, &format!("f{i}.txt"), "/", format!("{i}").as_bytes())
            .await
            .unwrap();
    }
    assert_eq!(t.vault.audit_events_dropped(), 0);
}
