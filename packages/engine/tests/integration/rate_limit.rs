use std::time::Duration;

use engine::error::VaultError;
use sea_orm::EntityTrait;

use crate::common::TestVault;

/// Default tuning: capacity 5, refill 2/s. Five requests pass, the sixth
/// is denied, and half a second later exactly one token has come back.
#[tokio::test]
async fn principal_bucket_exhaustion_and_refill() {
    let t = TestVault::spawn_with(|c| {
        c.rate.principal.rps = 2;
        c.rate.principal.burst = 5;
        c.rate.org.rps = 1000;
        c.rate.org.burst = 1000;
    })
    .await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;

    for i in 0..5 {
        t.ingest(alice, &format!("f{i}.txt"), "/", format!("payload {i}").as_bytes())
            .await
            .unwrap_or_else(|e| panic!("request {i} should be admitted: {e}"));
    }

    let sixth = t.ingest(alice, "f5.txt", "/", b"payload 5").await;
    assert!(matches!(sixth, Err(VaultError::RateLimited)));

    tokio::time::sleep(Duration::from_millis(600)).await;

    // One token refilled; one request passes, the next is denied again.
    t.ingest(alice, "f6.txt", "/", b"payload 6").await.unwrap();
    let again = t.ingest(alice, "f7.txt", "/", b"payload 7").await;
    assert!(matches!(again, Err(VaultError::RateLimited)));
}

#[tokio::test]
async fn org_bucket_spans_principals() {
    let t = TestVault::spawn_with(|c| {
        c.rate.principal.rps = 1000;
        c.rate.principal.burst = 1000;
        c.rate.org.rps = 1;
        c.rate.org.burst = 3;
    })
    .await;
    let org = t.create_org("acme", "alice").await;
    let alice = org.creator.id;
    let bob = t.register_member(org.organization.id, "bob").await;

    // Org creation and registration do not consume tokens; three uploads do.
    t.ingest(alice, "a.txt", "/", b"one").await.unwrap();
    t.ingest(bob, "b.txt", "/", b"two").await.unwrap();
    t.ingest(alice, "c.txt", "/", b"three").await.unwrap();

    let fourth = t.ingest(bob, "d.txt", "/", b"four").await;
    assert!(matches!(fourth, Err(VaultError::RateLimited)));
}

#[tokio::test]
async fn denied_requests_change_no_state() {
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

    // Only the admitted upload exists.
    let objects = engine::entity::content_object::Entity::find()
        .all(&t.db)
        .await
        .unwrap();
    assert_eq!(objects.len(), 1);
}
