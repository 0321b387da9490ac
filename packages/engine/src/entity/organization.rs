use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "organization")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub name: String,

    /// Creating user. Stored as a bare ID to keep the user/organization
    /// reference acyclic.
    pub created_by: Uuid,

    /// Storage allocation in mebibytes.
    pub allocated_mb: i64,

    /// Authoritative physical usage counter in bytes. Only mutated through
    /// the quota ledger's commit path.
    pub used_bytes: i64,

    #[sea_orm(has_many)]
    pub users: HasMany<super::user::Entity>,
    #[sea_orm(has_many)]
    pub groups: HasMany<super::group::Entity>,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
