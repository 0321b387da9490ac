use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::storage::{AzureObjectStore, BoxReader, LocalObjectStore, ObjectStore};
use sea_orm::{DatabaseConnection, EntityTrait};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditFilters, AuditRecorder, RequestInfo, actions};
use crate::bootstrap::{self, CreatedOrganization};
use crate::config::{StorageBackend, VaultConfig};
use crate::entity::audit_event::{self, AuditStatus};
use crate::entity::user;
use crate::error::VaultError;
use crate::ingest::IngestPipeline;
use crate::models::Pagination;
use crate::models::reference::{Download, ReferenceDetails, ReferenceList, SortOrder, UsageSummary};
use crate::models::session::{CreatedSession, FileDescriptor, SessionProgress};
use crate::models::upload::{UploadOutcome, UploadRequest};
use crate::permission::Action;
use crate::quota::QuotaLedger;
use crate::rate_limit::RateLimiter;
use crate::reference::ReferenceOps;
use crate::session::SessionCoordinator;
use crate::sweep::{SweepReport, Sweeper};
use crate::token::TokenService;
use crate::validate::Validator;

/// The assembled engine: every component constructed once, leaves first,
/// wired by explicit injection. There is no global state; drop the `Vault`
/// and everything it owns goes with it.
pub struct Vault {
    pub db: DatabaseConnection,
    pub store: Arc<dyn ObjectStore>,
    pub config: VaultConfig,

    rate: Arc<RateLimiter>,
    quota: Arc<QuotaLedger>,
    audit: Arc<AuditRecorder>,
    sessions: Arc<SessionCoordinator>,
    sweeper: Arc<Sweeper>,
    tokens: TokenService,
    ingest: IngestPipeline,
    references: ReferenceOps,
}

impl Vault {
    /// Connect to the configured stores and assemble the engine.
    pub async fn connect(config: VaultConfig) -> Result<Self, VaultError> {
        let db = crate::database::init_db(&config.database.url).await?;
        bootstrap::ensure_indexes(&db).await?;

        let store: Arc<dyn ObjectStore> = match config.storage.backend {
            StorageBackend::Local => Arc::new(
                LocalObjectStore::new(PathBuf::from(&config.storage.local.root)).await?,
            ),
            StorageBackend::Blob => {
                let blob = &config.storage.blob;
                Arc::new(AzureObjectStore::new(
                    &blob.account,
                    &blob.key,
                    &blob.container,
                    &blob.endpoint,
                )?)
            }
        };

        Ok(Self::assemble(config, db, store))
    }

    /// Assemble over already-opened connections. Lets tests and embedders
    /// inject their own stores.
    pub fn assemble(
        config: VaultConfig,
        db: DatabaseConnection,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        let rate = Arc::new(RateLimiter::new(config.rate.clone()));
        let quota = Arc::new(QuotaLedger::new(db.clone()));
        let audit = Arc::new(AuditRecorder::new(db.clone(), &config.audit));
        let sessions = Arc::new(SessionCoordinator::new(db.clone()));
        let validator = Arc::new(Validator::new(
            config.upload.max_bytes,
            config.validator.clone(),
        ));
        let sweeper = Arc::new(Sweeper::new(db.clone(), store.clone(), quota.clone()));
        let tokens = TokenService::new(db.clone(), audit.clone());

        let ingest = IngestPipeline::new(
            db.clone(),
            store.clone(),
            validator,
            quota.clone(),
            rate.clone(),
            audit.clone(),
            sessions.clone(),
        );
        let references = ReferenceOps::new(db.clone(), store.clone(), rate.clone(), audit.clone());

        Self {
            db,
            store,
            config,
            rate,
            quota,
            audit,
            sessions,
            sweeper,
            tokens,
            ingest,
            references,
        }
    }

    /// Start the maintenance loops: audit writer and retention, limiter
    /// reaper, reservation sweeper, storage reconciliation.
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.audit.spawn_writer(),
            self.audit.spawn_retention_task(),
            self.rate.spawn_reaper(),
            self.quota.spawn_sweeper(),
            self.sweeper.spawn(Duration::from_secs(60 * 60)),
        ]
    }

    // ----- organizations and principals -----

    pub async fn create_organization(
        &self,
        name: &str,
        creator_username: &str,
        creator_password_hash: &str,
        allocated_mb: Option<i64>,
    ) -> Result<CreatedOrganization, VaultError> {
        bootstrap::create_organization(
            &self.db,
            name,
            creator_username,
            creator_password_hash,
            allocated_mb.unwrap_or(self.config.quota.default_mb),
        )
        .await
    }

    pub async fn register_user(
        &self,
        organization_id: Uuid,
        username: &str,
        password_hash: &str,
    ) -> Result<user::Model, VaultError> {
        bootstrap::register_user(&self.db, organization_id, username, password_hash).await
    }

    pub async fn add_group_member(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        assigned_by: Uuid,
    ) -> Result<(), VaultError> {
        bootstrap::add_group_member(&self.db, group_id, user_id, assigned_by).await
    }

    // ----- upload sessions -----

    pub async fn create_session(
        &self,
        user_id: Uuid,
        files: &[FileDescriptor],
        total_bytes: i64,
        request_info: &RequestInfo,
    ) -> Result<CreatedSession, VaultError> {
        let principal = user::Entity::find_by_id(user_id)
            .one(&self.db)
            .await?
            .ok_or(VaultError::NotFound)?;

        if !self
            .rate
            .check(user_id, principal.organization_id)
            .await
            .is_admitted()
        {
            self.audit.record(
                AuditEvent::new(actions::RATE_LIMIT_EXCEEDED, "upload_session")
                    .user(user_id)
                    .organization(principal.organization_id)
                    .request(request_info)
                    .status(AuditStatus::Failure)
                    .details(json!({ "declared_files": files.len() })),
            );
            return Err(VaultError::RateLimited);
        }

        self.sessions
            .create_session(
                user_id,
                principal.organization_id,
                files,
                total_bytes,
                &self.quota,
            )
            .await
    }

    pub async fn complete_session(&self, user_id: Uuid, token: &str) -> Result<(), VaultError> {
        self.sessions.complete_session(user_id, token).await
    }

    pub async fn fail_session(&self, user_id: Uuid, token: &str) -> Result<(), VaultError> {
        self.sessions.fail_session(user_id, token).await
    }

    pub async fn get_session_progress(
        &self,
        user_id: Uuid,
        token: &str,
    ) -> Result<SessionProgress, VaultError> {
        self.sessions.get_progress(user_id, token).await
    }

    // ----- ingest -----

    pub async fn ingest_file(
        &self,
        user_id: Uuid,
        request: UploadRequest,
        stream: BoxReader,
        request_info: &RequestInfo,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, VaultError> {
        self.ingest
            .upload(user_id, request, stream, request_info, cancel)
            .await
    }

    // ----- references -----

    pub async fn list_references(
        &self,
        user_id: Uuid,
        folder: Option<&str>,
        page: u64,
        per_page: u64,
        sort: SortOrder,
    ) -> Result<ReferenceList, VaultError> {
        self.references
            .list_references(user_id, folder, page, per_page, sort)
            .await
    }

    pub async fn get_reference_metadata(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
    ) -> Result<ReferenceDetails, VaultError> {
        self.references
            .get_reference_metadata(user_id, reference_id)
            .await
    }

    pub async fn download_reference(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
        request_info: &RequestInfo,
    ) -> Result<Download, VaultError> {
        self.references
            .download_reference(user_id, reference_id, request_info)
            .await
    }

    pub async fn presign_reference(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
        ttl: Duration,
        request_info: &RequestInfo,
    ) -> Result<Download, VaultError> {
        self.references
            .presign_reference(user_id, reference_id, ttl, request_info)
            .await
    }

    pub async fn delete_reference(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
        request_info: &RequestInfo,
    ) -> Result<(), VaultError> {
        self.references
            .delete_reference(user_id, reference_id, request_info)
            .await
    }

    pub async fn resolve_permission(
        &self,
        user_id: Uuid,
        reference_id: Uuid,
        action: Action,
    ) -> Result<bool, VaultError> {
        self.references
            .resolve_permission(user_id, reference_id, action)
            .await
    }

    pub async fn set_group_permission(
        &self,
        user_id: Uuid,
        object_id: Uuid,
        group_id: Uuid,
        mask: i32,
        request_info: &RequestInfo,
    ) -> Result<(), VaultError> {
        self.references
            .set_group_permission(user_id, object_id, group_id, mask, request_info)
            .await
    }

    pub async fn usage_summary(&self, user_id: Uuid) -> Result<UsageSummary, VaultError> {
        self.references.usage_summary(user_id).await
    }

    // ----- refresh tokens -----

    pub async fn issue_refresh_token(
        &self,
        user_id: Uuid,
        request_info: &RequestInfo,
    ) -> Result<String, VaultError> {
        self.tokens.issue(user_id, request_info).await
    }

    pub async fn validate_refresh_token(&self, secret: &str) -> Result<Uuid, VaultError> {
        self.tokens.validate(secret).await
    }

    pub async fn revoke_refresh_token(
        &self,
        secret: &str,
        request_info: &RequestInfo,
    ) -> Result<(), VaultError> {
        self.tokens.revoke(secret, request_info).await
    }

    pub async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> Result<u64, VaultError> {
        self.tokens.revoke_all_for_user(user_id).await
    }

    // ----- audit and maintenance -----

    pub async fn query_audit_events(
        &self,
        filters: &AuditFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<audit_event::Model>, Pagination), VaultError> {
        self.audit.query(filters, page, per_page).await
    }

    /// Audit events lost to queue overflow since startup. Overflow loss is
    /// observable here, never silent.
    pub fn audit_events_dropped(&self) -> u64 {
        self.audit.dropped()
    }

    /// Block until the audit queue is durably drained.
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    pub async fn run_audit_retention(&self) -> Result<u64, VaultError> {
        self.audit.cleanup_expired().await
    }

    pub async fn sweep_once(&self) -> SweepReport {
        self.sweeper.run_once().await
    }
}
