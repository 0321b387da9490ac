use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub username: String,

    /// Credential hash. Issuance and verification live in the auth adapter;
    /// the engine only stores the column.
    pub password_hash: String,

    /// Primary organization. Every principal belongs to exactly one.
    pub organization_id: Uuid,
    #[sea_orm(belongs_to, from = "organization_id", to = "id")]
    pub organization: HasOne<super::organization::Entity>,

    #[sea_orm(has_many)]
    pub user_references: HasMany<super::user_reference::Entity>,

    #[sea_orm(has_many, via = "group_member")]
    pub groups: HasMany<super::group::Entity>,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
