use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A principal's named handle on a content object.
///
/// Many references may point at one object; that is the deduplication
/// payoff. `(user_id, folder_path, user_filename)` is unique among
/// non-deleted rows via a partial index created by `ensure_indexes`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user_reference")]
pub struct Model {
    /// UUIDv7 primary key.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,
    #[sea_orm(belongs_to, from = "user_id", to = "id")]
    pub user: HasOne<super::user::Entity>,

    pub content_object_id: Uuid,
    #[sea_orm(belongs_to, from = "content_object_id", to = "id")]
    pub content_object: HasOne<super::content_object::Entity>,

    /// Filename as this principal sees it.
    pub user_filename: String,

    /// Virtual folder, always starting with `/`.
    pub folder_path: String,

    pub is_deleted: bool,

    pub download_count: i64,
    pub last_accessed: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
