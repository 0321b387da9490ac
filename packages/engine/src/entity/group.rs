use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Names of the groups every organization is created with.
pub const SYSTEM_ADMIN: &str = "admin";
pub const SYSTEM_USERS: &str = "users";
pub const SYSTEM_GUESTS: &str = "guests";

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "group")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub organization_id: Uuid,
    #[sea_orm(belongs_to, from = "organization_id", to = "id")]
    pub organization: HasOne<super::organization::Entity>,

    /// Unique within the organization (enforced by `ensure_indexes`).
    pub name: String,

    pub description: String,

    /// Default octal permission mask applied through this group (0..=0o777).
    pub permission_mask: i32,

    /// System groups are created with the organization and protected from
    /// deletion.
    pub is_system: bool,

    #[sea_orm(has_many, via = "group_member")]
    pub members: HasMany<super::user::Entity>,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
