use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-object permission override for one group.
///
/// When present, members of the group get this mask's group triad instead
/// of the object's own group triad.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "group_permission")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub content_object_id: Uuid,
    #[sea_orm(belongs_to, from = "content_object_id", to = "id")]
    pub content_object: HasOne<super::content_object::Entity>,

    pub group_id: Uuid,
    #[sea_orm(belongs_to, from = "group_id", to = "id")]
    pub group: HasOne<super::group::Entity>,

    pub permission_mask: i32,

    pub granted_by: Option<Uuid>,
    pub granted_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
