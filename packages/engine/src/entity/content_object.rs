use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// The deduplicated storage unit: one row per unique byte sequence.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "content_object")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// SHA-256 content fingerprint, lowercase hex. The uniqueness
    /// constraint here is what makes concurrent dedup races detectable.
    #[sea_orm(unique)]
    pub content_hash: String,

    /// Filename of the first upload. Informational only.
    pub original_filename: String,

    pub declared_mime: Option<String>,
    pub detected_mime: String,

    pub size_bytes: i64,

    /// Object-store key (`files/<fp[0:2]>/<fp[2:4]>/<fp>`).
    pub storage_path: String,

    pub owner_id: Uuid,
    #[sea_orm(belongs_to, from = "owner_id", to = "id")]
    pub owner: HasOne<super::user::Entity>,

    pub primary_group_id: Uuid,
    #[sea_orm(belongs_to, from = "primary_group_id", to = "id")]
    pub primary_group: HasOne<super::group::Entity>,

    /// Octal permission mask (owner/group/others triads). Default 0o644.
    pub permission_mask: i32,

    /// Count of live user references. Maintained by the dedup index;
    /// zero means sweepable, never negative.
    pub reference_count: i64,

    #[sea_orm(has_many)]
    pub user_references: HasMany<super::user_reference::Entity>,
    #[sea_orm(has_many)]
    pub group_permissions: HasMany<super::group_permission::Entity>,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
