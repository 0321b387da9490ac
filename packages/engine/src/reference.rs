use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::storage::ObjectStore;
use sea_orm::sea_query::Expr;
use sea_orm::*;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditRecorder, RequestInfo, actions};
use crate::dedup;
use crate::entity::audit_event::AuditStatus;
use crate::entity::{content_object, group, group_permission, organization, user, user_reference};
use crate::error::VaultError;
use crate::models::Pagination;
use crate::models::reference::{
    DedupSibling, Download, ReferenceDetails, ReferenceList, ReferenceSummary, SortOrder,
    UsageSummary,
};
use crate::permission::{
    self, Action, Effective, Mask, ObjectPermissionMeta, PrincipalContext,
};
use crate::rate_limit::RateLimiter;

/// Read-side and delete-side operations over user references.
pub struct ReferenceOps {
    db: DatabaseConnection,
    store: Arc<dyn ObjectStore>,
    rate: Arc<RateLimiter>,
    audit: Arc<AuditRecorder>,
}

impl ReferenceOps {
    pub fn new(
        db: DatabaseConnection,
        store: Arc<dyn ObjectStore>,
        rate: Arc<RateLimiter>,
        audit: Arc<AuditRecorder>,
    ) -> Self {
        Self {
            db,
            store,
            rate,
            audit,
        }
    }

    /// Folder listing with effective permissions, paginated.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_references(
        &self,
        user_id: Uuid,
        folder: Option<&str>,
        page: u64,
        per_page: u64,
        sort: SortOrder,
    ) -> Result<ReferenceList, VaultError> {
        let principal = permission::load_principal_context(&self.db, user_id).await?;

        if !self
            .rate
            .check(user_id, principal.organization_id)
            .await
            .is_admitted()
        {
            return Err(VaultError::RateLimited);
        }

        let per_page = per_page.clamp(1, 100);
        let page = std::cmp::Ord::max(page, 1);

        let mut query = user_reference::Entity::find()
            .find_also_related(content_object::Entity)
            .filter(user_reference::Column::UserId.eq(user_id))
            .filter(user_reference::Column::IsDeleted.eq(false));

        if let Some(folder) = folder {
            let folder = crate::ingest::normalize_folder(folder)?;
            query = query.filter(user_reference::Column::FolderPath.eq(folder));
        }

        query = match sort {
            SortOrder::NameAsc => query.order_by_asc(user_reference::Column::UserFilename),
            SortOrder::NameDesc => query.order_by_desc(user_reference::Column::UserFilename),
            SortOrder::CreatedAsc => query.order_by_asc(user_reference::Column::CreatedAt),
            SortOrder::CreatedDesc => query.order_by_desc(user_reference::Column::CreatedAt),
            SortOrder::SizeAsc => query.order_by_asc(content_object::Column::SizeBytes),
            SortOrder::SizeDesc => query.order_by_desc(content_object::Column::SizeBytes),
        };

        let paginator = query.paginate(&self.db, per_page);
        let totals = paginator.num_items_and_pages().await?;
        let rows = paginator.fetch_page(page - 1).await?;

        // Page-wide batch loads: overrides and primary groups in one query
        // each, instead of two queries per row.
        let object_ids: Vec<Uuid> = rows
            .iter()
            .filter_map(|(_, object)| object.as_ref().map(|o| o.id))
            .collect();
        let mut overrides = load_overrides_for(&self.db, &object_ids).await?;

        let group_ids: HashSet<Uuid> = rows
            .iter()
            .filter_map(|(_, object)| object.as_ref().map(|o| o.primary_group_id))
            .collect();
        let groups: HashMap<Uuid, group::Model> = group::Entity::find()
            .filter(group::Column::Id.is_in(group_ids))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|g| (g.id, g))
            .collect();

        let mut references = Vec::with_capacity(rows.len());
        for (reference, object) in rows {
            let object = object.ok_or_else(|| {
                VaultError::internal(format!("reference {} has no content object", reference.id))
            })?;
            let primary_group = groups.get(&object.primary_group_id).ok_or_else(|| {
                VaultError::internal(format!("object {} has dangling primary group", object.id))
            })?;

            let meta = ObjectPermissionMeta {
                owner_id: object.owner_id,
                organization_id: primary_group.organization_id,
                primary_group_id: object.primary_group_id,
                mask: Mask::new(object.permission_mask)?,
                overrides: overrides.remove(&object.id).unwrap_or_default(),
            };

            let effective = permission::resolve_for_reference_holder(&principal, &meta);
            references.push(ReferenceSummary::from_parts(
                &reference,
                &object,
                effective,
                meta.mask.to_octal_string(),
            ));
        }

        Ok(ReferenceList {
            references,
            pagination: Pagination {
                page,
                per_page,
                total: totals.number_of_items,
                total_pages: totals.number_of_pages,
            },
        })
    }

    /// Full metadata for one reference, including dedup siblings.
    ///
    /// Works for foreign references too, when the resolver grants read;
    /// that is what group shares are for.
    #[instrument(skip(self), fields(user_id = %user_id, reference_id = %reference_id))]
    pub async fn get_reference_metadata(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
    ) -> Result<ReferenceDetails, VaultError> {
        let (reference, object, principal, meta, effective) =
            self.load_resolved(user_id, reference_id).await?;

        if !effective.allows(Action::Read) {
            return Err(VaultError::Forbidden);
        }

        // Other live references to the same bytes, with their owners.
        let sibling_rows: Vec<(user_reference::Model, Option<user::Model>)> =
            user_reference::Entity::find()
                .find_also_related(user::Entity)
                .filter(user_reference::Column::ContentObjectId.eq(object.id))
                .filter(user_reference::Column::IsDeleted.eq(false))
                .filter(user_reference::Column::Id.ne(reference.id))
                .all(&self.db)
                .await?;

        let siblings = sibling_rows
            .into_iter()
            .map(|(sibling, owner)| DedupSibling {
                reference_id: sibling.id,
                username: owner.map(|u| u.username).unwrap_or_default(),
                user_filename: sibling.user_filename,
                created_at: sibling.created_at,
            })
            .collect();

        Ok(ReferenceDetails {
            summary: ReferenceSummary::from_parts(
                &reference,
                &object,
                effective,
                meta.mask.to_octal_string(),
            ),
            content_hash: object.content_hash.clone(),
            declared_mime: object.declared_mime.clone(),
            reference_count: object.reference_count,
            siblings,
        })
    }

    /// Stream the referenced bytes. Bumps the download counter and records
    /// the access.
    #[instrument(skip(self, request_info), fields(user_id = %user_id, reference_id = %reference_id))]
    pub async fn download_reference(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
        request_info: &RequestInfo,
    ) -> Result<Download, VaultError> {
        let (reference, object, principal, _, effective) =
            self.load_resolved(user_id, reference_id).await?;

        if !effective.allows(Action::Download) {
            self.audit.record(
                AuditEvent::new(actions::FILE_DOWNLOAD, "file")
                    .user(user_id)
                    .organization(principal.organization_id)
                    .resource(reference.id)
                    .request(request_info)
                    .status(AuditStatus::Failure)
                    .details(json!({ "filename": reference.user_filename, "reason": "forbidden" })),
            );
            return Err(VaultError::Forbidden);
        }

        let reader = self.store.get(&object.storage_path).await?;

        user_reference::Entity::update_many()
            .col_expr(
                user_reference::Column::DownloadCount,
                Expr::col(user_reference::Column::DownloadCount).add(1),
            )
            .col_expr(
                user_reference::Column::LastAccessed,
                Expr::value(Some(Utc::now())),
            )
            .filter(user_reference::Column::Id.eq(reference.id))
            .exec(&self.db)
            .await?;

        self.audit.record(
            AuditEvent::new(actions::FILE_DOWNLOAD, "file")
                .user(user_id)
                .organization(principal.organization_id)
                .resource(reference.id)
                .request(request_info)
                .details(json!({
                    "filename": reference.user_filename,
                    "size_bytes": object.size_bytes,
                })),
        );

        Ok(Download::Stream {
            reader,
            size_bytes: object.size_bytes,
            mime: object.detected_mime.clone(),
            filename: reference.user_filename.clone(),
            etag: format!("\"{}\"", object.content_hash),
        })
    }

    /// Presigned-URL variant of download, for adapters that redirect.
    pub async fn presign_reference(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
        ttl: Duration,
        request_info: &RequestInfo,
    ) -> Result<Download, VaultError> {
        let (reference, object, principal, _, effective) =
            self.load_resolved(user_id, reference_id).await?;

        if !effective.allows(Action::Download) {
            return Err(VaultError::Forbidden);
        }

        let url = self.store.presign(&object.storage_path, ttl).await?;

        self.audit.record(
            AuditEvent::new(actions::FILE_DOWNLOAD, "file")
                .user(user_id)
                .organization(principal.organization_id)
                .resource(reference.id)
                .request(request_info)
                .details(json!({
                    "filename": reference.user_filename,
                    "presigned": true,
                })),
        );

        Ok(Download::Url(url))
    }

    /// Soft-delete a reference and release its claim on the object.
    ///
    /// A principal may always delete their own reference (the reference is
    /// theirs exclusively); deleting through a foreign handle needs write
    /// permission on the object. Idempotent from the caller's view: the
    /// second delete of the same id answers `NotFound` rather than an error.
    #[instrument(skip(self, request_info), fields(user_id = %user_id, reference_id = %reference_id))]
    pub async fn delete_reference(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
        request_info: &RequestInfo,
    ) -> Result<(), VaultError> {
        let (reference, object, principal, _, effective) =
            self.load_resolved(user_id, reference_id).await?;

        let own_reference = reference.user_id == user_id;
        if !own_reference && !effective.allows(Action::Delete) {
            return Err(VaultError::Forbidden);
        }

        let txn = self.db.begin().await?;

        // Object row first, then the reference row, matching the ingest
        // paths' lock order.
        dedup::decrement(&txn, object.id).await?;

        // Guard on the live flag so two racing deletes decrement once; a
        // lost race rolls the decrement back with the transaction.
        let marked = user_reference::Entity::update_many()
            .col_expr(user_reference::Column::IsDeleted, Expr::value(true))
            .col_expr(user_reference::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(user_reference::Column::Id.eq(reference.id))
            .filter(user_reference::Column::IsDeleted.eq(false))
            .exec(&txn)
            .await?;

        if marked.rows_affected == 0 {
            txn.rollback().await.ok();
            return Err(VaultError::NotFound);
        }

        txn.commit().await?;

        self.audit.record(
            AuditEvent::new(actions::FILE_DELETE, "file")
                .user(user_id)
                .organization(principal.organization_id)
                .resource(reference.id)
                .request(request_info)
                .details(json!({
                    "filename": reference.user_filename,
                    "size_bytes": object.size_bytes,
                })),
        );

        Ok(())
    }

    /// Answer whether `action` would be allowed, without performing it.
    pub async fn resolve_permission(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
        action: Action,
    ) -> Result<bool, VaultError> {
        let (_, _, _, _, effective) = self.load_resolved(user_id, reference_id).await?;
        Ok(effective.allows(action))
    }

    /// Grant or adjust a group's override mask on an object. Owner or
    /// organization admin only.
    #[instrument(skip(self, request_info), fields(user_id = %user_id, object_id = %object_id))]
    pub async fn set_group_permission(
        &self,
        user_id: Uuid,
        object_id: Uuid,
        group_id: Uuid,
        mask: i32,
        request_info: &RequestInfo,
    ) -> Result<(), VaultError> {
        let mask = Mask::new(mask)?;

        let object = content_object::Entity::find_by_id(object_id)
            .one(&self.db)
            .await?
            .ok_or(VaultError::NotFound)?;

        let principal = permission::load_principal_context(&self.db, user_id).await?;
        let meta = permission::load_object_meta(&self.db, &object).await?;

        if object.owner_id != user_id
            && !(principal.is_org_admin && principal.organization_id == meta.organization_id)
        {
            return Err(VaultError::Forbidden);
        }

        let target_group = group::Entity::find_by_id(group_id)
            .one(&self.db)
            .await?
            .ok_or(VaultError::NotFound)?;
        if target_group.organization_id != meta.organization_id {
            return Err(VaultError::Forbidden);
        }

        let existing = group_permission::Entity::find()
            .filter(group_permission::Column::ContentObjectId.eq(object_id))
            .filter(group_permission::Column::GroupId.eq(group_id))
            .one(&self.db)
            .await?;

        match existing {
            Some(row) => {
                let mut active: group_permission::ActiveModel = row.into();
                active.permission_mask = Set(mask.value());
                active.granted_by = Set(Some(user_id));
                active.granted_at = Set(Utc::now());
                active.update(&self.db).await?;
            }
            None => {
                group_permission::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    content_object_id: Set(object_id),
                    group_id: Set(group_id),
                    permission_mask: Set(mask.value()),
                    granted_by: Set(Some(user_id)),
                    granted_at: Set(Utc::now()),
                }
                .insert(&self.db)
                .await?;
            }
        }

        self.audit.record(
            AuditEvent::new(actions::PERMISSION_CHANGE, "file")
                .user(user_id)
                .organization(principal.organization_id)
                .resource(object_id)
                .request(request_info)
                .details(json!({
                    "group_id": group_id,
                    "mask": mask.to_octal_string(),
                })),
        );

        Ok(())
    }

    /// Storage accounting for the principal's organization.
    pub async fn usage_summary(&self, user_id: Uuid) -> Result<UsageSummary, VaultError> {
        let principal = user::Entity::find_by_id(user_id)
            .one(&self.db)
            .await?
            .ok_or(VaultError::NotFound)?;

        let org = organization::Entity::find_by_id(principal.organization_id)
            .one(&self.db)
            .await?
            .ok_or(VaultError::NotFound)?;

        let member_ids: Vec<Uuid> = user::Entity::find()
            .filter(user::Column::OrganizationId.eq(org.id))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect();

        let rows: Vec<(user_reference::Model, Option<content_object::Model>)> =
            user_reference::Entity::find()
                .find_also_related(content_object::Entity)
                .filter(user_reference::Column::UserId.is_in(member_ids))
                .filter(user_reference::Column::IsDeleted.eq(false))
                .all(&self.db)
                .await?;

        let mut logical_bytes = 0i64;
        let mut unique_objects: HashSet<Uuid> = HashSet::new();
        let reference_count = rows.len() as u64;
        for (_, object) in &rows {
            if let Some(object) = object {
                logical_bytes += object.size_bytes;
                unique_objects.insert(object.id);
            }
        }

        let allocated_bytes = org.allocated_mb * 1024 * 1024;
        let used_bytes = org.used_bytes;
        let savings_bytes = std::cmp::Ord::max(logical_bytes - used_bytes, 0);

        Ok(UsageSummary {
            allocated_bytes,
            used_bytes,
            available_bytes: std::cmp::Ord::max(allocated_bytes - used_bytes, 0),
            usage_percent: percent(used_bytes, allocated_bytes),
            logical_bytes,
            savings_bytes,
            savings_percent: percent(savings_bytes, logical_bytes),
            reference_count,
            unique_object_count: unique_objects.len() as u64,
        })
    }

    /// Load a live reference, its object, and the caller's resolved
    /// permissions. Deleted and missing references answer `NotFound`; a
    /// holder of the reference resolves through the holder chain, everyone
    /// else through the full cross-tenant wall.
    async fn load_resolved(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
    ) -> Result<
        (
            user_reference::Model,
            content_object::Model,
            PrincipalContext,
            ObjectPermissionMeta,
            Effective,
        ),
        VaultError,
    > {
        let pair = user_reference::Entity::find_by_id(reference_id)
            .find_also_related(content_object::Entity)
            .one(&self.db)
            .await?;

        let Some((reference, object)) = pair else {
            return Err(VaultError::NotFound);
        };
        if reference.is_deleted {
            return Err(VaultError::NotFound);
        }
        let object = object.ok_or_else(|| {
            VaultError::internal(format!("reference {} has no content object", reference.id))
        })?;

        let principal = permission::load_principal_context(&self.db, user_id).await?;
        let meta = permission::load_object_meta(&self.db, &object).await?;

        let effective = if reference.user_id == user_id {
            permission::resolve_for_reference_holder(&principal, &meta)
        } else {
            permission::resolve(&principal, &meta)
        };

        Ok((reference, object, principal, meta, effective))
    }
}

fn percent(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

/// Group permission overrides for a set of objects, keyed by object.
///
/// Loaded in one query to keep listings out of N+1 territory.
async fn load_overrides_for<C: ConnectionTrait>(
    db: &C,
    object_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<(Uuid, Mask)>>, VaultError> {
    let rows = group_permission::Entity::find()
        .filter(group_permission::Column::ContentObjectId.is_in(object_ids.to_vec()))
        .all(db)
        .await?;

    let mut map: HashMap<Uuid, Vec<(Uuid, Mask)>> = HashMap::new();
    for row in rows {
        if let Ok(mask) = Mask::new(row.permission_mask) {
            map.entry(row.content_object_id)
                .or_default()
                .push((row.group_id, mask));
        }
    }
    Ok(map)
}
