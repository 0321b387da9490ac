use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Outcome recorded with an audit event.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, DeriveActiveEnum, EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "failure")]
    Failure,
    #[sea_orm(string_value = "error")]
    Error,
}

/// Append-only security event record. Rows are never mutated; retention
/// cleanup is the only deletion path.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "audit_event")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Acting principal; NULL for unauthenticated or system actions.
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,

    /// One of the closed action vocabulary (`file_upload`, `file_download`,
    /// `file_delete`, `user_login`, `user_logout`, `permission_change`,
    /// `rate_limit_exceeded`, `security_violation`, `quota_exceeded`,
    /// `audit_cleanup`).
    pub action: String,

    pub resource_type: String,
    pub resource_id: Option<Uuid>,

    pub ip_address: String,
    pub user_agent: String,
    pub request_id: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub details: serde_json::Value,

    pub status: AuditStatus,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
