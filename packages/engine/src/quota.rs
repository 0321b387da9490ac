use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sea_orm::sea_query::Expr;
use sea_orm::*;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entity::organization;
use crate::error::VaultError;

/// How long a reservation stays admissible before the sweeper reclaims it.
const RESERVATION_TTL: Duration = Duration::from_secs(5 * 60);

struct Reservation {
    bytes: i64,
    expires_at: Instant,
}

#[derive(Default)]
struct OrgReservations {
    outstanding: HashMap<Uuid, Reservation>,
}

impl OrgReservations {
    fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.outstanding.len();
        self.outstanding.retain(|_, r| r.expires_at > now);
        before - self.outstanding.len()
    }

    fn total(&self) -> i64 {
        self.outstanding.values().map(|r| r.bytes).sum()
    }
}

/// Handle for an admitted reservation. Must be resolved with
/// [`QuotaLedger::commit`] or [`QuotaLedger::release`]; an abandoned handle
/// expires on its own after the TTL.
#[derive(Debug, Clone, Copy)]
pub struct ReservationId {
    organization_id: Uuid,
    id: Uuid,
    bytes: i64,
}

impl ReservationId {
    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

/// Per-organization storage accounting with check-and-reserve semantics.
///
/// `organization.used_bytes` is the authoritative persisted counter and
/// only moves through `commit` (ingest) and `debit` (garbage collection).
/// In-flight uploads hold in-memory reservations under a per-organization
/// lock, so invariant `used ≤ allocated` holds at every commit point even
/// under concurrency.
pub struct QuotaLedger {
    db: DatabaseConnection,
    orgs: Mutex<HashMap<Uuid, Arc<Mutex<OrgReservations>>>>,
}

impl QuotaLedger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            orgs: Mutex::new(HashMap::new()),
        }
    }

    async fn org_entry(&self, organization_id: Uuid) -> Arc<Mutex<OrgReservations>> {
        let mut orgs = self.orgs.lock().await;
        orgs.entry(organization_id)
            .or_insert_with(|| Arc::new(Mutex::new(OrgReservations::default())))
            .clone()
    }

    /// Admit `delta_bytes` against the organization's allocation, or report
    /// how full it is.
    pub async fn check_and_reserve(
        &self,
        organization_id: Uuid,
        delta_bytes: i64,
    ) -> Result<ReservationId, VaultError> {
        if delta_bytes < 0 {
            return Err(VaultError::InvalidInput(
                "reservation size must be non-negative".into(),
            ));
        }

        let entry = self.org_entry(organization_id).await;
        let mut reservations = entry.lock().await;
        reservations.sweep_expired(Instant::now());

        let org = organization::Entity::find_by_id(organization_id)
            .one(&self.db)
            .await?
            .ok_or(VaultError::NotFound)?;

        let allocated = org.allocated_mb * 1024 * 1024;
        let outstanding = reservations.total();

        if org.used_bytes + outstanding + delta_bytes > allocated {
            debug!(
                organization = %organization_id,
                used = org.used_bytes,
                outstanding,
                delta = delta_bytes,
                allocated,
                "reservation denied"
            );
            return Err(VaultError::QuotaExceeded {
                used: org.used_bytes,
                allocated,
            });
        }

        let id = Uuid::new_v4();
        reservations.outstanding.insert(
            id,
            Reservation {
                bytes: delta_bytes,
                expires_at: Instant::now() + RESERVATION_TTL,
            },
        );

        Ok(ReservationId {
            organization_id,
            id,
            bytes: delta_bytes,
        })
    }

    /// Make a reservation permanent: bump the persisted counter, drop the
    /// in-memory hold.
    pub async fn commit(&self, reservation: ReservationId) -> Result<(), VaultError> {
        organization::Entity::update_many()
            .col_expr(
                organization::Column::UsedBytes,
                Expr::col(organization::Column::UsedBytes).add(reservation.bytes),
            )
            .col_expr(
                organization::Column::UpdatedAt,
                Expr::value(chrono::Utc::now()),
            )
            .filter(organization::Column::Id.eq(reservation.organization_id))
            .exec(&self.db)
            .await?;

        self.drop_reservation(&reservation).await;
        Ok(())
    }

    /// Drop a reservation without consuming quota (validation failure,
    /// dedup hit, cancellation).
    pub async fn release(&self, reservation: ReservationId) {
        self.drop_reservation(&reservation).await;
    }

    async fn drop_reservation(&self, reservation: &ReservationId) {
        let entry = self.org_entry(reservation.organization_id).await;
        let mut reservations = entry.lock().await;
        if reservations.outstanding.remove(&reservation.id).is_none() {
            // Expired underneath us; harmless, but worth seeing in logs if
            // it happens at any volume.
            warn!(
                organization = %reservation.organization_id,
                "reservation already swept before resolution"
            );
        }
    }

    /// Return physical bytes to the allocation after garbage collection
    /// deletes a content object. Floors at zero.
    pub async fn debit(&self, organization_id: Uuid, bytes: i64) -> Result<(), VaultError> {
        organization::Entity::update_many()
            .col_expr(
                organization::Column::UsedBytes,
                Expr::cust_with_values("GREATEST(\"used_bytes\" - ?, 0)", [bytes]),
            )
            .col_expr(
                organization::Column::UpdatedAt,
                Expr::value(chrono::Utc::now()),
            )
            .filter(organization::Column::Id.eq(organization_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Drop expired reservations across all organizations.
    pub async fn sweep_expired(&self) -> usize {
        let entries: Vec<Arc<Mutex<OrgReservations>>> =
            self.orgs.lock().await.values().cloned().collect();

        let now = Instant::now();
        let mut removed = 0;
        for entry in entries {
            removed += entry.lock().await.sweep_expired(now);
        }
        if removed > 0 {
            debug!(removed, "swept expired quota reservations");
        }
        removed
    }

    /// Spawn the periodic reservation sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                ledger.sweep_expired().await;
            }
        })
    }
}
