use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::*;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::entity::audit_event::{self, AuditStatus};
use crate::error::VaultError;
use crate::models::Pagination;

/// The closed action vocabulary. Nothing else is ever written to the
/// `action` column.
pub mod actions {
    pub const FILE_UPLOAD: &str = "file_upload";
    pub const FILE_DOWNLOAD: &str = "file_download";
    pub const FILE_DELETE: &str = "file_delete";
    pub const USER_LOGIN: &str = "user_login";
    pub const USER_LOGOUT: &str = "user_logout";
    pub const PERMISSION_CHANGE: &str = "permission_change";
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const SECURITY_VIOLATION: &str = "security_violation";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const AUDIT_CLEANUP: &str = "audit_cleanup";
}

/// Transport-supplied request attribution, threaded into every audited
/// operation.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub ip_address: String,
    pub user_agent: String,
    pub request_id: String,
}

/// An event waiting to be persisted.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub action: &'static str,
    pub resource_type: &'static str,
    pub resource_id: Option<Uuid>,
    pub request: RequestInfo,
    pub details: serde_json::Value,
    pub status: AuditStatus,
    /// Stamped at enqueue so persisted order matches observed order.
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &'static str, resource_type: &'static str) -> Self {
        Self {
            user_id: None,
            organization_id: None,
            action,
            resource_type,
            resource_id: None,
            request: RequestInfo::default(),
            details: json!({}),
            status: AuditStatus::Success,
            created_at: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn resource(mut self, resource_id: Uuid) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    pub fn request(mut self, request: &RequestInfo) -> Self {
        self.request = request.clone();
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    fn into_active_model(self) -> audit_event::ActiveModel {
        audit_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(self.user_id),
            organization_id: Set(self.organization_id),
            action: Set(self.action.to_string()),
            resource_type: Set(self.resource_type.to_string()),
            resource_id: Set(self.resource_id),
            ip_address: Set(self.request.ip_address),
            user_agent: Set(self.request.user_agent),
            request_id: Set(self.request.request_id),
            details: Set(self.details),
            status: Set(self.status),
            created_at: Set(self.created_at),
        }
    }
}

/// Bounded in-memory event queue. Overflow drops the oldest entry and
/// counts the loss; enqueue never blocks and never awaits.
struct BoundedQueue {
    inner: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: AuditEvent) {
        let mut queue = self.inner.lock().expect("audit queue poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    fn drain(&self, max: usize) -> Vec<AuditEvent> {
        let mut queue = self.inner.lock().expect("audit queue poisoned");
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().expect("audit queue poisoned").len()
    }
}

/// Filters for the audit query surface.
#[derive(Debug, Clone, Default)]
pub struct AuditFilters {
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Fire-and-forget audit recording with asynchronous batched persistence.
///
/// `record` is safe on the request path: it pushes to a bounded queue and
/// wakes the writer. Durability is best-effort; correctness of the engine
/// never depends on an audit row existing.
pub struct AuditRecorder {
    db: DatabaseConnection,
    queue: BoundedQueue,
    notify: Notify,
    retention_days: i64,
}

/// Writer batch size.
const BATCH: usize = 128;

impl AuditRecorder {
    pub fn new(db: DatabaseConnection, config: &AuditConfig) -> Self {
        Self {
            db,
            queue: BoundedQueue::new(config.queue_size),
            notify: Notify::new(),
            retention_days: config.retention_days,
        }
    }

    /// Queue an event. Never blocks, never fails.
    pub fn record(&self, event: AuditEvent) {
        self.queue.push(event);
        self.notify.notify_one();
    }

    /// Events lost to queue overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Persist one batch. Returns the number of rows written.
    async fn flush_batch(&self) -> usize {
        let batch = self.queue.drain(BATCH);
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();

        let models: Vec<audit_event::ActiveModel> = batch
            .into_iter()
            .map(AuditEvent::into_active_model)
            .collect();

        if let Err(e) = audit_event::Entity::insert_many(models)
            .exec_without_returning(&self.db)
            .await
        {
            // Best-effort: the events are gone, but the engine keeps going.
            warn!("failed to persist audit batch of {count}: {e}");
            return 0;
        }

        count
    }

    /// Drain the queue completely. Used at shutdown and by tests.
    pub async fn flush(&self) {
        while self.queue.len() > 0 {
            if self.flush_batch().await == 0 && self.queue.len() > 0 {
                // Persistence is failing; drop the backlog rather than spin.
                let abandoned = self.queue.drain(usize::MAX).len();
                warn!("abandoning {abandoned} audit events after write failure");
                return;
            }
        }
    }

    /// Spawn the background writer.
    pub fn spawn_writer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                recorder.notify.notified().await;
                while recorder.flush_batch().await > 0 {}
            }
        })
    }

    /// Delete events older than the retention window and audit the purge
    /// itself.
    pub async fn cleanup_expired(&self) -> Result<u64, VaultError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);

        let result = audit_event::Entity::delete_many()
            .filter(audit_event::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            info!(
                purged = result.rows_affected,
                retention_days = self.retention_days,
                "audit retention cleanup"
            );
        }

        self.record(
            AuditEvent::new(actions::AUDIT_CLEANUP, "audit").details(json!({
                "purged_rows": result.rows_affected,
                "retention_days": self.retention_days,
            })),
        );

        Ok(result.rows_affected)
    }

    /// Spawn the daily retention task.
    pub fn spawn_retention_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = recorder.cleanup_expired().await {
                    warn!("audit retention cleanup failed: {e}");
                }
            }
        })
    }

    /// Filtered, newest-first event listing.
    pub async fn query(
        &self,
        filters: &AuditFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<audit_event::Model>, Pagination), VaultError> {
        let per_page = per_page.clamp(1, 200);
        let page = std::cmp::Ord::max(page, 1);

        let mut query = audit_event::Entity::find();
        if let Some(user_id) = filters.user_id {
            query = query.filter(audit_event::Column::UserId.eq(user_id));
        }
        if let Some(org_id) = filters.organization_id {
            query = query.filter(audit_event::Column::OrganizationId.eq(org_id));
        }
        if let Some(action) = &filters.action {
            query = query.filter(audit_event::Column::Action.eq(action));
        }
        if let Some(resource_type) = &filters.resource_type {
            query = query.filter(audit_event::Column::ResourceType.eq(resource_type));
        }
        if let Some(resource_id) = filters.resource_id {
            query = query.filter(audit_event::Column::ResourceId.eq(resource_id));
        }
        if let Some(from) = filters.from {
            query = query.filter(audit_event::Column::CreatedAt.gte(from));
        }
        if let Some(to) = filters.to {
            query = query.filter(audit_event::Column::CreatedAt.lte(to));
        }

        let paginator = query
            .order_by_desc(audit_event::Column::CreatedAt)
            .paginate(&self.db, per_page);
        let totals = paginator.num_items_and_pages().await?;
        let events = paginator.fetch_page(page - 1).await?;

        Ok((
            events,
            Pagination {
                page,
                per_page,
                total: totals.number_of_items,
                total_pages: totals.number_of_pages,
            },
        ))
    }
}
