use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use sea_orm::*;
use sha2::{Digest, Sha256};
use tracing::instrument;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditRecorder, RequestInfo, actions};
use crate::entity::refresh_token;
use crate::error::VaultError;

/// Refresh token lifetime.
const REFRESH_TTL_DAYS: i64 = 7;

/// Issues and validates session-continuation secrets.
///
/// The secret travels to the client once and is stored only as its SHA-256,
/// so a metadata-store leak cannot replay sessions.
pub struct TokenService {
    db: DatabaseConnection,
    audit: Arc<AuditRecorder>,
}

impl TokenService {
    pub fn new(db: DatabaseConnection, audit: Arc<AuditRecorder>) -> Self {
        Self { db, audit }
    }

    /// Mint a refresh token for a freshly authenticated principal.
    ///
    /// Returns the secret; it exists nowhere else.
    #[instrument(skip(self, request_info), fields(user_id = %user_id))]
    pub async fn issue(
        &self,
        user_id: Uuid,
        request_info: &RequestInfo,
    ) -> Result<String, VaultError> {
        let secret_bytes: [u8; 32] = rand::rng().random();
        let secret = hex::encode(secret_bytes);

        refresh_token::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            token_hash: Set(hash_secret(&secret)),
            expires_at: Set(Utc::now() + Duration::days(REFRESH_TTL_DAYS)),
            revoked_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await?;

        self.audit.record(
            AuditEvent::new(actions::USER_LOGIN, "user")
                .user(user_id)
                .resource(user_id)
                .request(request_info),
        );

        Ok(secret)
    }

    /// Resolve a presented secret to its principal.
    ///
    /// Unknown, expired and revoked secrets are indistinguishable to the
    /// caller.
    pub async fn validate(&self, secret: &str) -> Result<Uuid, VaultError> {
        let record = refresh_token::Entity::find()
            .filter(refresh_token::Column::TokenHash.eq(hash_secret(secret)))
            .one(&self.db)
            .await?
            .ok_or(VaultError::NotFound)?;

        if record.revoked_at.is_some() || record.expires_at <= Utc::now() {
            return Err(VaultError::NotFound);
        }

        Ok(record.user_id)
    }

    /// Revoke one secret (logout). Idempotent.
    pub async fn revoke(&self, secret: &str, request_info: &RequestInfo) -> Result<(), VaultError> {
        let record = refresh_token::Entity::find()
            .filter(refresh_token::Column::TokenHash.eq(hash_secret(secret)))
            .one(&self.db)
            .await?;

        let Some(record) = record else {
            return Ok(());
        };

        if record.revoked_at.is_none() {
            let user_id = record.user_id;
            let mut active: refresh_token::ActiveModel = record.into();
            active.revoked_at = Set(Some(Utc::now()));
            active.update(&self.db).await?;

            self.audit.record(
                AuditEvent::new(actions::USER_LOGOUT, "user")
                    .user(user_id)
                    .resource(user_id)
                    .request(request_info),
            );
        }

        Ok(())
    }

    /// Revoke every live token a principal holds (forced logout).
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, VaultError> {
        let result = refresh_token::Entity::update_many()
            .col_expr(
                refresh_token::Column::RevokedAt,
                sea_orm::sea_query::Expr::value(Some(Utc::now())),
            )
            .filter(refresh_token::Column::UserId.eq(user_id))
            .filter(refresh_token::Column::RevokedAt.is_null())
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Drop rows that can never validate again.
    pub async fn purge_expired(&self) -> Result<u64, VaultError> {
        let result = refresh_token::Entity::delete_many()
            .filter(refresh_token::Column::ExpiresAt.lt(Utc::now()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
