use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::storage::{BoxReader, Fingerprint, ObjectStore};
use sea_orm::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditRecorder, RequestInfo, actions};
use crate::dedup::{self, InsertOutcome, ObjectSpec};
use crate::entity::audit_event::AuditStatus;
use crate::entity::{group, user, user_reference};
use crate::error::VaultError;
use crate::models::upload::{UploadOutcome, UploadRequest};
use crate::permission::Mask;
use crate::quota::QuotaLedger;
use crate::rate_limit::RateLimiter;
use crate::session::SessionCoordinator;
use crate::validate::{FileMeta, SpooledContent, ValidationOutcome, Validator};

/// Budget for the metadata transaction around the dedup decision.
const TXN_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the object-store write.
const PUT_TIMEOUT: Duration = Duration::from_secs(60);

/// Dedup-race retries: lookup again after losing the fingerprint insert.
const MAX_DEDUP_ATTEMPTS: u32 = 3;

/// The upload orchestrator: admission, validation, dedup decision, storage
/// write, reference creation, quota settlement, audit.
pub struct IngestPipeline {
    db: DatabaseConnection,
    store: Arc<dyn ObjectStore>,
    validator: Arc<Validator>,
    quota: Arc<QuotaLedger>,
    rate: Arc<RateLimiter>,
    audit: Arc<AuditRecorder>,
    sessions: Arc<SessionCoordinator>,
}

impl IngestPipeline {
    pub fn new(
        db: DatabaseConnection,
        store: Arc<dyn ObjectStore>,
        validator: Arc<Validator>,
        quota: Arc<QuotaLedger>,
        rate: Arc<RateLimiter>,
        audit: Arc<AuditRecorder>,
        sessions: Arc<SessionCoordinator>,
    ) -> Self {
        Self {
            db,
            store,
            validator,
            quota,
            rate,
            audit,
            sessions,
        }
    }

    /// Ingest one file for `user_id`.
    ///
    /// Ordering per the failure policy: admission, validation, transactional
    /// dedup decision, then audit. A denied or rejected upload changes no
    /// state beyond its audit event.
    #[instrument(
        skip(self, request, stream, request_info, cancel),
        fields(user_id = %user_id, filename = %request.filename)
    )]
    pub async fn upload(
        &self,
        user_id: Uuid,
        request: UploadRequest,
        stream: BoxReader,
        request_info: &RequestInfo,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, VaultError> {
        let principal = user::Entity::find_by_id(user_id)
            .one(&self.db)
            .await?
            .ok_or(VaultError::NotFound)?;
        let organization_id = principal.organization_id;

        let folder = normalize_folder(&request.folder)?;
        let filename = request.filename.trim().to_string();

        if !self
            .rate
            .check(user_id, organization_id)
            .await
            .is_admitted()
        {
            self.audit.record(
                AuditEvent::new(actions::RATE_LIMIT_EXCEEDED, "file")
                    .user(user_id)
                    .organization(organization_id)
                    .request(request_info)
                    .status(AuditStatus::Failure)
                    .details(json!({ "filename": filename })),
            );
            return Err(VaultError::RateLimited);
        }

        let result = self
            .validate_and_persist(user_id, organization_id, &filename, &folder, &request, stream, cancel)
            .await;

        if let Some(token) = &request.session_token {
            let (bytes, success) = match &result {
                Ok(outcome) => (outcome.size_bytes, true),
                Err(_) => (0, false),
            };
            if let Err(e) = self
                .sessions
                .record_file_result(user_id, token, bytes, success)
                .await
            {
                warn!("session progress update failed: {e}");
            }
        }

        self.audit_outcome(user_id, organization_id, &filename, &folder, request_info, &result);

        result
    }

    fn audit_outcome(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        filename: &str,
        folder: &str,
        request_info: &RequestInfo,
        result: &Result<UploadOutcome, VaultError>,
    ) {
        match result {
            Ok(outcome) => {
                self.audit.record(
                    AuditEvent::new(actions::FILE_UPLOAD, "file")
                        .user(user_id)
                        .organization(organization_id)
                        .resource(outcome.reference_id)
                        .request(request_info)
                        .details(json!({
                            "filename": filename,
                            "folder": folder,
                            "size_bytes": outcome.size_bytes,
                            "deduplicated": outcome.deduplicated,
                            "bytes_saved": outcome.bytes_saved,
                        })),
                );
            }
            // Admission denial was audited at the gate; cancellation is the
            // caller walking away, not a security event.
            Err(VaultError::RateLimited) | Err(VaultError::Cancelled) => {}
            Err(VaultError::QuotaExceeded { used, allocated }) => {
                self.audit.record(
                    AuditEvent::new(actions::QUOTA_EXCEEDED, "organization")
                        .user(user_id)
                        .organization(organization_id)
                        .resource(organization_id)
                        .request(request_info)
                        .status(AuditStatus::Failure)
                        .details(json!({
                            "filename": filename,
                            "used": used,
                            "allocated": allocated,
                        })),
                );
            }
            Err(VaultError::Infected(threat)) => {
                self.audit.record(
                    AuditEvent::new(actions::SECURITY_VIOLATION, "file")
                        .user(user_id)
                        .organization(organization_id)
                        .request(request_info)
                        .status(AuditStatus::Failure)
                        .details(json!({
                            "filename": filename,
                            "threat": threat,
                        })),
                );
            }
            Err(e) => {
                let status = if e.is_retryable() {
                    AuditStatus::Error
                } else {
                    AuditStatus::Failure
                };
                self.audit.record(
                    AuditEvent::new(actions::FILE_UPLOAD, "file")
                        .user(user_id)
                        .organization(organization_id)
                        .request(request_info)
                        .status(status)
                        .details(json!({
                            "filename": filename,
                            "error": e.kind(),
                        })),
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn validate_and_persist(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        filename: &str,
        folder: &str,
        request: &UploadRequest,
        stream: BoxReader,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, VaultError> {
        let outcome = self
            .validator
            .validate(filename, request.declared_mime.as_deref(), stream, cancel)
            .await;

        let (meta, content) = match outcome {
            ValidationOutcome::Valid { meta, content } => (meta, content),
            ValidationOutcome::Rejected { errors, .. } => {
                return Err(VaultError::InvalidContent(errors));
            }
            ValidationOutcome::Infected { threat } => return Err(VaultError::Infected(threat)),
            ValidationOutcome::Cancelled => return Err(VaultError::Cancelled),
            ValidationOutcome::ReadError(detail) => {
                return Err(VaultError::InvalidContent(vec![detail]));
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            if cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }

            // Hit path first: cheapest, and where races resolve to.
            if let Some(done) = self.try_hit(user_id, filename, folder, &meta).await? {
                return Ok(done);
            }

            match self
                .try_miss(user_id, organization_id, filename, folder, request, &meta, &content)
                .await?
            {
                Some(done) => return Ok(done),
                None if attempts < MAX_DEDUP_ATTEMPTS => {
                    // Lost the fingerprint race; the winner's row is visible
                    // now, so the next hit attempt succeeds.
                }
                None => {
                    return Err(VaultError::internal(format!(
                        "dedup race did not settle after {MAX_DEDUP_ATTEMPTS} attempts for {}",
                        meta.fingerprint
                    )));
                }
            }
        }
    }

    /// Reference an existing content object, if one matches.
    async fn try_hit(
        &self,
        user_id: Uuid,
        filename: &str,
        folder: &str,
        meta: &FileMeta,
    ) -> Result<Option<UploadOutcome>, VaultError> {
        let txn = self.begin().await?;

        let Some(existing) = dedup::lookup(&txn, &meta.fingerprint).await? else {
            txn.rollback().await.ok();
            return Ok(None);
        };

        // Row locks in the fixed order: content object first, then the
        // reference.
        dedup::increment(&txn, existing.id).await?;
        let reference = insert_reference(&txn, user_id, existing.id, filename, folder).await?;
        self.commit(txn).await?;

        Ok(Some(UploadOutcome {
            reference_id: reference.id,
            object_id: existing.id,
            deduplicated: true,
            size_bytes: meta.size_bytes,
            bytes_saved: meta.size_bytes,
            warnings: meta.warnings.clone(),
        }))
    }

    /// Store new content: reserve quota, write bytes, insert object and
    /// reference. `Ok(None)` means a concurrent upload won the fingerprint
    /// race and the caller should retry as a hit.
    #[allow(clippy::too_many_arguments)]
    async fn try_miss(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        filename: &str,
        folder: &str,
        request: &UploadRequest,
        meta: &FileMeta,
        content: &SpooledContent,
    ) -> Result<Option<UploadOutcome>, VaultError> {
        let reservation = self
            .quota
            .check_and_reserve(organization_id, meta.size_bytes)
            .await?;

        if let Err(e) = self.put_with_retry(&meta.fingerprint, content, meta).await {
            self.quota.release(reservation).await;
            return Err(e);
        }

        let result = self
            .insert_miss_rows(user_id, organization_id, filename, folder, request, meta)
            .await;

        match result {
            Ok(Some(outcome)) => {
                // Usage becomes real only after the metadata committed. A
                // failure here undercounts (repairable), never overcounts.
                if let Err(e) = self.quota.commit(reservation).await {
                    warn!("quota commit failed after successful ingest: {e}");
                }
                Ok(Some(outcome))
            }
            Ok(None) => {
                // Race lost. The bytes we wrote are identical to the
                // winner's (same content-addressed key), so they stay put.
                self.quota.release(reservation).await;
                Ok(None)
            }
            Err(e) => {
                self.quota.release(reservation).await;
                Err(e)
            }
        }
    }

    async fn insert_miss_rows(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        filename: &str,
        folder: &str,
        request: &UploadRequest,
        meta: &FileMeta,
    ) -> Result<Option<UploadOutcome>, VaultError> {
        let txn = self.begin().await?;

        let primary_group = users_group(&txn, organization_id).await?;
        let spec = ObjectSpec {
            original_filename: filename.to_string(),
            declared_mime: request.declared_mime.clone(),
            detected_mime: meta.detected_mime.clone(),
            size_bytes: meta.size_bytes,
            owner_id: user_id,
            primary_group_id: primary_group.id,
            permission_mask: Mask::DEFAULT_OBJECT.value(),
        };

        match dedup::insert_object(&txn, &meta.fingerprint, spec).await? {
            InsertOutcome::Created(object) => {
                dedup::increment(&txn, object.id).await?;
                let reference = insert_reference(&txn, user_id, object.id, filename, folder).await?;
                self.commit(txn).await?;

                Ok(Some(UploadOutcome {
                    reference_id: reference.id,
                    object_id: object.id,
                    deduplicated: false,
                    size_bytes: meta.size_bytes,
                    bytes_saved: 0,
                    warnings: meta.warnings.clone(),
                }))
            }
            InsertOutcome::RaceLost => {
                txn.rollback().await.ok();
                Ok(None)
            }
        }
    }

    async fn begin(&self) -> Result<DatabaseTransaction, VaultError> {
        tokio::time::timeout(TXN_TIMEOUT, self.db.begin())
            .await
            .map_err(|_| VaultError::MetadataUnavailable("transaction open timed out".into()))?
            .map_err(VaultError::from)
    }

    async fn commit(&self, txn: DatabaseTransaction) -> Result<(), VaultError> {
        tokio::time::timeout(TXN_TIMEOUT, txn.commit())
            .await
            .map_err(|_| VaultError::MetadataUnavailable("transaction commit timed out".into()))?
            .map_err(VaultError::from)
    }

    async fn put_with_retry(
        &self,
        fingerprint: &Fingerprint,
        content: &SpooledContent,
        meta: &FileMeta,
    ) -> Result<(), VaultError> {
        let key = fingerprint.storage_key();

        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            let reader = content
                .reader()
                .await
                .map_err(|e| VaultError::internal(format!("spool reopen failed: {e}")))?;

            let put = self.store.put(
                &key,
                reader,
                meta.size_bytes as u64,
                Some(&meta.detected_mime),
            );
            match tokio::time::timeout(PUT_TIMEOUT, put).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    let mapped = VaultError::from(e);
                    if !mapped.is_retryable() {
                        return Err(mapped);
                    }
                    warn!(key, "object write failed: {mapped}");
                    last_err = Some(mapped);
                }
                Err(_) => {
                    warn!(key, "object write timed out");
                    last_err = Some(VaultError::StorageUnavailable(
                        "object write timed out".into(),
                    ));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| VaultError::StorageUnavailable("object write failed".into())))
    }
}

/// Insert the user reference, translating the partial-unique violation into
/// the caller-facing conflict.
async fn insert_reference<C: ConnectionTrait>(
    db: &C,
    user_id: Uuid,
    object_id: Uuid,
    filename: &str,
    folder: &str,
) -> Result<user_reference::Model, VaultError> {
    let now = Utc::now();
    let model = user_reference::ActiveModel {
        id: Set(Uuid::now_v7()),
        user_id: Set(user_id),
        content_object_id: Set(object_id),
        user_filename: Set(filename.to_string()),
        folder_path: Set(folder.to_string()),
        is_deleted: Set(false),
        download_count: Set(0),
        last_accessed: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    model.insert(db).await.map_err(|e| match e.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => VaultError::NameConflict,
        _ => VaultError::from(e),
    })
}

/// The organization's `users` system group, the default primary group for
/// new content objects.
async fn users_group<C: ConnectionTrait>(
    db: &C,
    organization_id: Uuid,
) -> Result<group::Model, VaultError> {
    group::Entity::find()
        .filter(group::Column::OrganizationId.eq(organization_id))
        .filter(group::Column::Name.eq(group::SYSTEM_USERS))
        .one(db)
        .await?
        .ok_or_else(|| {
            VaultError::internal(format!(
                "organization {organization_id} is missing its users system group"
            ))
        })
}

/// Normalize a caller-supplied folder to `/`-rooted canonical form.
pub fn normalize_folder(folder: &str) -> Result<String, VaultError> {
    let trimmed = folder.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return Ok("/".to_string());
    }

    if trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(VaultError::InvalidInput(
            "folder contains forbidden characters".into(),
        ));
    }
    if trimmed.len() > 500 {
        return Err(VaultError::InvalidInput("folder path too long".into()));
    }

    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(VaultError::InvalidInput(
                "folder must not contain traversal segments".into(),
            ));
        }
        segments.push(segment);
    }

    Ok(format!("/{}", segments.join("/")))
}
