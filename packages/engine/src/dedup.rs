use chrono::Utc;
use common::storage::Fingerprint;
use sea_orm::sea_query::Expr;
use sea_orm::*;
use tracing::debug;
use uuid::Uuid;

use crate::entity::content_object;
use crate::error::VaultError;

/// Metadata for a content object about to be created.
pub struct ObjectSpec {
    pub original_filename: String,
    pub declared_mime: Option<String>,
    pub detected_mime: String,
    pub size_bytes: i64,
    pub owner_id: Uuid,
    pub primary_group_id: Uuid,
    pub permission_mask: i32,
}

/// Result of an insert attempt under the fingerprint uniqueness constraint.
pub enum InsertOutcome {
    Created(content_object::Model),
    /// A concurrent upload inserted the same fingerprint first. The caller
    /// re-runs `lookup` and proceeds on the hit path.
    RaceLost,
}

/// Find the content object for a fingerprint, if any.
pub async fn lookup<C: ConnectionTrait>(
    db: &C,
    fingerprint: &Fingerprint,
) -> Result<Option<content_object::Model>, VaultError> {
    let found = content_object::Entity::find()
        .filter(content_object::Column::ContentHash.eq(fingerprint.to_hex()))
        .one(db)
        .await?;
    Ok(found)
}

/// Insert the row for freshly stored content.
///
/// The reference count starts at zero; `increment` moves it when the first
/// user reference lands, which keeps the arithmetic identical for the hit
/// and miss paths.
pub async fn insert_object<C: ConnectionTrait>(
    db: &C,
    fingerprint: &Fingerprint,
    spec: ObjectSpec,
) -> Result<InsertOutcome, VaultError> {
    let now = Utc::now();
    let model = content_object::ActiveModel {
        id: Set(Uuid::new_v4()),
        content_hash: Set(fingerprint.to_hex()),
        original_filename: Set(spec.original_filename),
        declared_mime: Set(spec.declared_mime),
        detected_mime: Set(spec.detected_mime),
        size_bytes: Set(spec.size_bytes),
        storage_path: Set(fingerprint.storage_key()),
        owner_id: Set(spec.owner_id),
        primary_group_id: Set(spec.primary_group_id),
        permission_mask: Set(spec.permission_mask),
        reference_count: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    };

    match model.insert(db).await {
        Ok(created) => Ok(InsertOutcome::Created(created)),
        Err(e) => match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                debug!(
                    fingerprint = %fingerprint,
                    "concurrent upload won the fingerprint race"
                );
                Ok(InsertOutcome::RaceLost)
            }
            _ => Err(e.into()),
        },
    }
}

/// Count a new live reference against the object.
pub async fn increment<C: ConnectionTrait>(db: &C, object_id: Uuid) -> Result<(), VaultError> {
    content_object::Entity::update_many()
        .col_expr(
            content_object::Column::ReferenceCount,
            Expr::col(content_object::Column::ReferenceCount).add(1),
        )
        .col_expr(content_object::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(content_object::Column::Id.eq(object_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Drop one live reference. Floors at zero and returns the new count.
///
/// Reaching zero does not delete anything here; the garbage sweep owns
/// deletion, which keeps decrements idempotent-friendly and lets
/// soft-undelete restore without resurrection anomalies.
pub async fn decrement<C: ConnectionTrait>(db: &C, object_id: Uuid) -> Result<i64, VaultError> {
    content_object::Entity::update_many()
        .col_expr(
            content_object::Column::ReferenceCount,
            Expr::cust("GREATEST(\"reference_count\" - 1, 0)"),
        )
        .col_expr(content_object::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(content_object::Column::Id.eq(object_id))
        .exec(db)
        .await?;

    let count = content_object::Entity::find_by_id(object_id)
        .one(db)
        .await?
        .map(|obj| obj.reference_count)
        .unwrap_or(0);
    Ok(count)
}
