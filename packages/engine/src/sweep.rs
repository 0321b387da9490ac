use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::storage::{Fingerprint, ObjectStore};
use sea_orm::*;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entity::{content_object, group, group_permission, user_reference};
use crate::error::VaultError;
use crate::quota::QuotaLedger;

/// Zero-reference objects younger than this survive the sweep, so an
/// in-flight soft-undelete or dedup retry never races deletion.
const ZERO_REF_GRACE: chrono::Duration = chrono::Duration::hours(24);

/// Soft-deleted references linger this long before the purge.
const SOFT_DELETE_GRACE: chrono::Duration = chrono::Duration::days(30);

/// What one reconciliation pass accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    /// Blobs in the store with no content-object row.
    pub orphan_blobs_removed: usize,
    /// Content objects (and their blobs) garbage-collected.
    pub objects_removed: usize,
    /// Physical bytes returned to their organizations' allocations.
    pub bytes_reclaimed: i64,
    /// Soft-deleted reference rows purged.
    pub references_purged: u64,
}

/// Reconciliation sweeps for the crash windows the ingest pipeline accepts:
/// orphaned blobs, zero-reference objects, lingering soft-deletes.
pub struct Sweeper {
    db: DatabaseConnection,
    store: Arc<dyn ObjectStore>,
    quota: Arc<QuotaLedger>,
}

impl Sweeper {
    pub fn new(db: DatabaseConnection, store: Arc<dyn ObjectStore>, quota: Arc<QuotaLedger>) -> Self {
        Self { db, store, quota }
    }

    /// Run every sweep once. Errors in one phase don't stop the others.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.purge_soft_deleted().await {
            Ok(purged) => report.references_purged = purged,
            Err(e) => warn!("soft-delete purge failed: {e}"),
        }

        match self.sweep_zero_reference_objects().await {
            Ok((removed, bytes)) => {
                report.objects_removed = removed;
                report.bytes_reclaimed = bytes;
            }
            Err(e) => warn!("zero-reference sweep failed: {e}"),
        }

        match self.sweep_orphan_blobs().await {
            Ok(removed) => report.orphan_blobs_removed = removed,
            Err(e) => warn!("orphan blob sweep failed: {e}"),
        }

        if report.orphan_blobs_removed > 0
            || report.objects_removed > 0
            || report.references_purged > 0
        {
            info!(
                orphans = report.orphan_blobs_removed,
                objects = report.objects_removed,
                bytes = report.bytes_reclaimed,
                references = report.references_purged,
                "sweep pass complete"
            );
        }

        report
    }

    /// Delete blobs whose fingerprint has no content-object row.
    ///
    /// These are the residue of crashes between the object write and the
    /// metadata commit.
    pub async fn sweep_orphan_blobs(&self) -> Result<usize, VaultError> {
        let keys = self.store.list("files/").await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut by_hash: HashMap<String, String> = HashMap::new();
        for key in keys {
            match Fingerprint::from_storage_key(&key) {
                Some(fingerprint) => {
                    by_hash.insert(fingerprint.to_hex(), key);
                }
                None => warn!(key, "foreign key in content-addressed area"),
            }
        }

        let hashes: Vec<String> = by_hash.keys().cloned().collect();
        let mut known: HashSet<String> = HashSet::new();
        for chunk in hashes.chunks(500) {
            let rows = content_object::Entity::find()
                .filter(content_object::Column::ContentHash.is_in(chunk.to_vec()))
                .all(&self.db)
                .await?;
            known.extend(rows.into_iter().map(|o| o.content_hash));
        }

        let mut removed = 0;
        for (hash, key) in by_hash {
            if !known.contains(&hash) {
                match self.store.delete(&key).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(key, "orphan delete failed: {e}"),
                }
            }
        }

        Ok(removed)
    }

    /// Garbage-collect content objects whose last reference is gone.
    ///
    /// Decrement-to-zero never deletes inline (keeping retries idempotent);
    /// this sweep is the only deletion path, and it returns the physical
    /// bytes to the owning organization's allocation.
    pub async fn sweep_zero_reference_objects(&self) -> Result<(usize, i64), VaultError> {
        let cutoff = Utc::now() - ZERO_REF_GRACE;
        let candidates = content_object::Entity::find()
            .filter(content_object::Column::ReferenceCount.eq(0))
            .filter(content_object::Column::UpdatedAt.lt(cutoff))
            .all(&self.db)
            .await?;

        if candidates.is_empty() {
            return Ok((0, 0));
        }

        // Organization attribution goes through the primary group.
        let group_ids: HashSet<Uuid> = candidates.iter().map(|o| o.primary_group_id).collect();
        let orgs_by_group: HashMap<Uuid, Uuid> = group::Entity::find()
            .filter(group::Column::Id.is_in(group_ids))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|g| (g.id, g.organization_id))
            .collect();

        let mut removed = 0;
        let mut bytes = 0i64;
        for object in candidates {
            // Soft-deleted rows may still point here until their purge
            // grace elapses; deleting now would strand them.
            let lingering = user_reference::Entity::find()
                .filter(user_reference::Column::ContentObjectId.eq(object.id))
                .count(&self.db)
                .await?;
            if lingering > 0 {
                continue;
            }

            let txn = self.db.begin().await?;
            group_permission::Entity::delete_many()
                .filter(group_permission::Column::ContentObjectId.eq(object.id))
                .exec(&txn)
                .await?;
            let deleted = content_object::Entity::delete_many()
                .filter(content_object::Column::Id.eq(object.id))
                .filter(content_object::Column::ReferenceCount.eq(0))
                .exec(&txn)
                .await?;
            txn.commit().await?;

            if deleted.rows_affected == 0 {
                // Resurrected by a concurrent upload between the scan and
                // the delete.
                continue;
            }

            if let Err(e) = self.store.delete(&object.storage_path).await {
                // The row is gone; the blob is now an orphan the next pass
                // picks up.
                warn!(key = object.storage_path, "blob delete failed: {e}");
            }

            if let Some(&organization_id) = orgs_by_group.get(&object.primary_group_id) {
                self.quota.debit(organization_id, object.size_bytes).await?;
            }

            removed += 1;
            bytes += object.size_bytes;
        }

        Ok((removed, bytes))
    }

    /// Hard-delete soft-deleted references past their grace window.
    pub async fn purge_soft_deleted(&self) -> Result<u64, VaultError> {
        let cutoff = Utc::now() - SOFT_DELETE_GRACE;
        let result = user_reference::Entity::delete_many()
            .filter(user_reference::Column::IsDeleted.eq(true))
            .filter(user_reference::Column::UpdatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Spawn a periodic sweep. The schedule is the operator's choice; the
    /// engine only provides the mechanism.
    pub fn spawn(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweeper.run_once().await;
            }
        })
    }
}
