use std::sync::Arc;

use engine::entity::{content_object, organization};
use engine::error::VaultError;
use sea_orm::EntityTrait;

use crate::common::TestVault;

async fn org_used_bytes(t: &TestVault, org_id: uuid::Uuid) -> i64 {
    organization::Entity::find_by_id(org_id)
        .one(&t.db)
        .await
        .unwrap()
        .unwrap()
        .used_bytes
}

async fn reference_count(t: &TestVault, object_id: uuid::Uuid) -> i64 {
    content_object::Entity::find_by_id(object_id)
        .one(&t.db)
        .await
        .unwrap()
        .unwrap()
        .reference_count
}

mod dedup {
    use super::*;

    #[tokio::test]
    async fn identical_bytes_share_one_object() {
        let t = TestVault::spawn().await;
        let org = t.create_org("acme", "alice").await;
        let alice = org.creator.id;
        let bob = t.register_member(org.organization.id, "bob").await;

        let first = t.ingest(alice, "x.bin", "/a", b"helloworld").await.unwrap();
        assert!(!first.deduplicated);
        assert_eq!(first.bytes_saved, 0);
        assert_eq!(first.size_bytes, 10);
        assert_eq!(org_used_bytes(&t, org.organization.id).await, 10);

        let object = content_object::Entity::find_by_id(first.object_id)
            .one(&t.db)
            .await
            .unwrap()
            .unwrap();
        assert!(object.content_hash.starts_with("936a185c"));
        assert_eq!(
            object.storage_path,
            format!(
                "files/{}/{}/{}",
                &object.content_hash[..2],
                &object.content_hash[2..4],
                object.content_hash
            )
        );

        let second = t.ingest(bob, "y.bin", "/b", b"helloworld").await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.bytes_saved, 10);
        assert_eq!(second.object_id, first.object_id);
        assert_ne!(second.reference_id, first.reference_id);

        // The second copy consumed no quota.
        assert_eq!(org_used_bytes(&t, org.organization.id).await, 10);
        assert_eq!(reference_count(&t, first.object_id).await, 2);

        // Both principals read their own references back.
        assert_eq!(t.download(alice, first.reference_id).await.unwrap(), b"helloworld");
        assert_eq!(t.download(bob, second.reference_id).await.unwrap(), b"helloworld");
    }

    #[tokio::test]
    async fn same_principal_same_bytes_different_name_dedups() {
        let t = TestVault::spawn().await;
        let org = t.create_org("acme", "alice").await;
        let alice = org.creator.id;

        let first = t.ingest(alice, "a.txt", "/", b"shared content").await.unwrap();
        let second = t.ingest(alice, "b.txt", "/", b"shared content").await.unwrap();

        assert_eq!(first.object_id, second.object_id);
        assert!(second.deduplicated);
        assert_eq!(reference_count(&t, first.object_id).await, 2);
    }

    #[tokio::test]
    async fn concurrent_identical_ingests_write_once() {
        let t = Arc::new(TestVault::spawn().await);
        let org = t.create_org("acme", "alice").await;
        let alice = org.creator.id;
        let bob = t.register_member(org.organization.id, "bob").await;

        let payload = b"concurrent payload".to_vec();
        let t1 = {
            let t = Arc::clone(&t);
            let payload = payload.clone();
            tokio::spawn(async move { t.ingest(alice, "same.bin", "/", &payload).await })
        };
        let t2 = {
            let t = Arc::clone(&t);
            let payload = payload.clone();
            tokio::spawn(async move { t.ingest(bob, "same.bin", "/", &payload).await })
        };

        let r1 = t1.await.unwrap().unwrap();
        let r2 = t2.await.unwrap().unwrap();

        // One physical object, two references, no refcount anomaly.
        assert_eq!(r1.object_id, r2.object_id);
        assert_ne!(r1.reference_id, r2.reference_id);
        assert_eq!(reference_count(&t, r1.object_id).await, 2);

        // Exactly one of them paid physical bytes.
        assert_eq!(
            org_used_bytes(&t, org.organization.id).await,
            payload.len() as i64
        );

        let objects = content_object::Entity::find().all(&t.db).await.unwrap();
        assert_eq!(objects.len(), 1);
    }
}

mod conflicts {
    use super::*;

    #[tokio::test]
    async fn same_name_same_folder_conflicts() {
        let t = TestVault::spawn().await;
        let org = t.create_org("acme", "alice").await;
        let alice = org.creator.id;

        let first = t.ingest(alice, "file.txt", "/docs", b"one").await.unwrap();

        let second = t.ingest(alice, "file.txt", "/docs", b"two").await;
        assert!(matches!(second, Err(VaultError::NameConflict)));

        // The original reference is untouched.
        assert_eq!(t.download(alice, first.reference_id).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn same_name_different_folder_is_fine() {
        let t = TestVault::spawn().await;
        let org = t.create_org("acme", "alice").await;
        let alice = org.creator.id;

        t.ingest(alice, "file.txt", "/docs", b"one").await.unwrap();
        t.ingest(alice, "file.txt", "/other", b"two").await.unwrap();
    }

    #[tokio::test]
    async fn different_principals_can_use_the_same_name() {
        let t = TestVault::spawn().await;
        let org = t.create_org("acme", "alice").await;
        let alice = org.creator.id;
        let bob = t.register_member(org.organization.id, "bob").await;

        t.ingest(alice, "file.txt", "/", b"one").await.unwrap();
        t.ingest(bob, "file.txt", "/", b"two").await.unwrap();
    }
}

mod validation_boundaries {
    use super::*;

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let t = TestVault::spawn().await;
        let org = t.create_org("acme", "alice").await;

        let result = t.ingest(org.creator.id, "empty.txt", "/", b"").await;
        match result {
            Err(VaultError::InvalidContent(errors)) => {
                assert!(errors.iter().any(|e| e.contains("empty")));
            }
            other => panic!("expected invalid-content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exact_cap_accepted_one_over_rejected() {
        let t = TestVault::spawn_with(|c| c.upload.max_bytes = 1024).await;
        let org = t.create_org("acme", "alice").await;
        let alice = org.creator.id;

        let exact = vec![0x61u8; 1024];
        t.ingest(alice, "exact.bin", "/", &exact).await.unwrap();

        let over = vec![0x61u8; 1025];
        let result = t.ingest(alice, "over.bin", "/", &over).await;
        assert!(matches!(result, Err(VaultError::InvalidContent(_))));
    }

    #[tokio::test]
    async fn traversal_filename_is_rejected() {
        let t = TestVault::spawn().await;
        let org = t.create_org("acme", "alice").await;

        let result = t.ingest(org.creator.id, "..\\evil", "/", b"data").await;
        assert!(matches!(result, Err(VaultError::InvalidContent(_))));
    }

    #[tokio::test]
    async fn blocked_extension_is_rejected_without_state_changes() {
        let t = TestVault::spawn().await;
        let org = t.create_org("acme", "alice").await;

        let result = t.ingest(org.creator.id, "setup.exe", "/", b"MZ fake").await;
        assert!(matches!(result, Err(VaultError::InvalidContent(_))));

        assert_eq!(org_used_bytes(&t, org.organization.id).await, 0);
        assert!(
            content_object::Entity::find()
                .all(&t.db)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn archive_upload_carries_warning() {
        let t = TestVault::spawn().await;
        let org = t.create_org("acme", "alice").await;

        let outcome = t
            .ingest(org.creator.id, "backup.zip", "/", b"PK\x03\x04data")
            .await
            .unwrap();
        assert!(outcome.warnings.iter().any(|w| w.contains("Archive")));
    }
}
