use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Continuation record for an authenticated session.
///
/// Only the SHA-256 of the secret is stored; the secret itself exists
/// nowhere but in the client's hands.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "refresh_token")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,
    #[sea_orm(belongs_to, from = "user_id", to = "id")]
    pub user: HasOne<super::user::Entity>,

    #[sea_orm(unique)]
    pub token_hash: String,

    pub expires_at: DateTimeUtc,
    pub revoked_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
