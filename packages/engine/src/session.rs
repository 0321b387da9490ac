use chrono::Utc;
use common::storage::Fingerprint;
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::*;
use tracing::instrument;
use uuid::Uuid;

use crate::dedup;
use crate::entity::upload_session::{self, SessionStatus};
use crate::error::VaultError;
use crate::models::session::{CreatedSession, FileDescriptor, SessionProgress};
use crate::quota::QuotaLedger;

/// Largest accepted batch declaration.
const MAX_FILES_PER_SESSION: usize = 1000;

/// Tracks multi-file upload batches: progress counters and an
/// at-most-once terminal transition.
pub struct SessionCoordinator {
    db: DatabaseConnection,
}

impl SessionCoordinator {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Open a session for a declared batch: pre-count duplicates from any
    /// client-supplied fingerprints, check the fresh bytes against the
    /// organization's headroom, persist the session row.
    #[instrument(skip(self, files, quota), fields(user_id = %user_id, files = files.len()))]
    pub async fn create_session(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        files: &[FileDescriptor],
        total_bytes: i64,
        quota: &QuotaLedger,
    ) -> Result<CreatedSession, VaultError> {
        if files.is_empty() {
            return Err(VaultError::InvalidInput(
                "session must declare at least one file".into(),
            ));
        }
        if files.len() > MAX_FILES_PER_SESSION {
            return Err(VaultError::InvalidInput(format!(
                "session declares too many files (max {MAX_FILES_PER_SESSION})"
            )));
        }
        if total_bytes < 0 {
            return Err(VaultError::InvalidInput(
                "total bytes must be non-negative".into(),
            ));
        }

        let mut duplicate_count = 0;
        let mut fresh_bytes: i64 = 0;
        for descriptor in files {
            let known = if let Some(hex) = &descriptor.fingerprint
                && let Ok(fingerprint) = Fingerprint::from_hex(hex)
            {
                dedup::lookup(&self.db, &fingerprint).await?.is_some()
            } else {
                false
            };

            if known {
                duplicate_count += 1;
            } else {
                fresh_bytes = fresh_bytes.saturating_add(std::cmp::Ord::max(descriptor.size_bytes, 0));
            }
        }

        // Early headroom answer for the uploader; per-file ingests re-check
        // authoritatively. Reserve-and-release so outstanding reservations
        // count against the batch too.
        let probe = quota.check_and_reserve(organization_id, fresh_bytes).await?;
        quota.release(probe).await;

        let token = new_session_token();
        let session = upload_session::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            session_token: Set(token.clone()),
            total_files: Set(files.len() as i32),
            completed_files: Set(0),
            failed_files: Set(0),
            total_bytes: Set(total_bytes),
            uploaded_bytes: Set(0),
            status: Set(SessionStatus::Pending),
            started_at: Set(Utc::now()),
            completed_at: Set(None),
        };
        let session = session.insert(&self.db).await?;

        Ok(CreatedSession {
            session_token: token,
            total_files: session.total_files,
            total_bytes: session.total_bytes,
            duplicate_count,
        })
    }

    /// Record one per-file ingest result against the session.
    ///
    /// The first result moves `pending` to `in_progress`. Results arriving
    /// after a terminal transition are ignored rather than resurrecting the
    /// session.
    pub async fn record_file_result(
        &self,
        user_id: Uuid,
        token: &str,
        bytes: i64,
        success: bool,
    ) -> Result<(), VaultError> {
        let session = self.find_owned(user_id, token).await?;
        if session.status.is_terminal() {
            return Ok(());
        }

        let (completed_delta, failed_delta, bytes_delta) = if success {
            (1, 0, bytes)
        } else {
            (0, 1, 0)
        };

        upload_session::Entity::update_many()
            .col_expr(
                upload_session::Column::Status,
                Expr::value(SessionStatus::InProgress),
            )
            .col_expr(
                upload_session::Column::CompletedFiles,
                Expr::col(upload_session::Column::CompletedFiles).add(completed_delta),
            )
            .col_expr(
                upload_session::Column::FailedFiles,
                Expr::col(upload_session::Column::FailedFiles).add(failed_delta),
            )
            .col_expr(
                upload_session::Column::UploadedBytes,
                Expr::col(upload_session::Column::UploadedBytes).add(bytes_delta),
            )
            .filter(upload_session::Column::Id.eq(session.id))
            .filter(
                upload_session::Column::Status
                    .is_in([SessionStatus::Pending, SessionStatus::InProgress]),
            )
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Terminal transition to `completed`. Idempotent: completing a
    /// completed session succeeds; completing a failed one conflicts.
    #[instrument(skip(self, token), fields(user_id = %user_id))]
    pub async fn complete_session(&self, user_id: Uuid, token: &str) -> Result<(), VaultError> {
        self.finish(user_id, token, SessionStatus::Completed).await
    }

    /// Terminal transition to `failed`, same discipline as completion.
    pub async fn fail_session(&self, user_id: Uuid, token: &str) -> Result<(), VaultError> {
        self.finish(user_id, token, SessionStatus::Failed).await
    }

    async fn finish(
        &self,
        user_id: Uuid,
        token: &str,
        target: SessionStatus,
    ) -> Result<(), VaultError> {
        let session = self.find_owned(user_id, token).await?;

        // Compare-and-set so a racing double-complete resolves to exactly
        // one transition.
        let result = upload_session::Entity::update_many()
            .col_expr(upload_session::Column::Status, Expr::value(target))
            .col_expr(
                upload_session::Column::CompletedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(upload_session::Column::Id.eq(session.id))
            .filter(
                upload_session::Column::Status
                    .is_in([SessionStatus::Pending, SessionStatus::InProgress]),
            )
            .exec(&self.db)
            .await?;

        if result.rows_affected == 1 {
            return Ok(());
        }

        // Lost the race or already terminal: repeating the same outcome is
        // fine, flipping it is not.
        let current = self.find_owned(user_id, token).await?;
        if current.status == target {
            Ok(())
        } else {
            Err(VaultError::AlreadyTerminal)
        }
    }

    /// Owner-only progress view.
    pub async fn get_progress(
        &self,
        user_id: Uuid,
        token: &str,
    ) -> Result<SessionProgress, VaultError> {
        let session = self.find_owned(user_id, token).await?;

        let progress_percent = if session.total_bytes > 0 {
            (session.uploaded_bytes as f64 / session.total_bytes as f64) * 100.0
        } else {
            0.0
        };

        Ok(SessionProgress {
            session_token: session.session_token,
            total_files: session.total_files,
            completed_files: session.completed_files,
            failed_files: session.failed_files,
            total_bytes: session.total_bytes,
            uploaded_bytes: session.uploaded_bytes,
            status: session.status,
            progress_percent,
        })
    }

    /// Look up a session by token, visible only to its owner.
    ///
    /// Foreign tokens answer `NotFound`, never `Forbidden`, so outsiders
    /// cannot probe which tokens exist.
    async fn find_owned(
        &self,
        user_id: Uuid,
        token: &str,
    ) -> Result<upload_session::Model, VaultError> {
        let session = upload_session::Entity::find()
            .filter(upload_session::Column::SessionToken.eq(token))
            .one(&self.db)
            .await?
            .ok_or(VaultError::NotFound)?;

        if session.user_id != user_id {
            return Err(VaultError::NotFound);
        }
        Ok(session)
    }
}

/// 256 bits of randomness, hex-encoded.
fn new_session_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}
