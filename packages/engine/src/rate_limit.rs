use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::config::{BucketConfig, RateConfig};

/// A lock-free token bucket.
///
/// State is a single atomic "theoretical arrival time" in nanoseconds since
/// bucket creation; `try_acquire` is a CAS loop, so concurrent callers never
/// block each other. Semantics are the classic bucket: `burst` capacity,
/// refilled at `rps` tokens per second.
pub struct TokenBucket {
    start: Instant,
    /// Nanoseconds per token.
    interval: u64,
    burst: u64,
    tat: AtomicU64,
}

impl TokenBucket {
    pub fn new(config: BucketConfig) -> Self {
        let rps = config.rps.max(1) as u64;
        Self {
            start: Instant::now(),
            interval: 1_000_000_000 / rps,
            burst: config.burst.max(1) as u64,
            tat: AtomicU64::new(0),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Take one token, or fail without side effects.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(self.now_nanos())
    }

    fn try_acquire_at(&self, now: u64) -> bool {
        loop {
            let tat = self.tat.load(Ordering::Acquire);
            let new_tat = tat.max(now) + self.interval;
            if new_tat - now > self.burst * self.interval {
                return false;
            }
            if self
                .tat
                .compare_exchange_weak(tat, new_tat, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Approximate tokens currently available.
    pub fn remaining(&self) -> u32 {
        self.remaining_at(self.now_nanos())
    }

    fn remaining_at(&self, now: u64) -> u32 {
        let tat = self.tat.load(Ordering::Acquire);
        let horizon = now + self.burst * self.interval;
        if horizon <= tat {
            0
        } else {
            (((horizon - tat) / self.interval).min(self.burst)) as u32
        }
    }

    pub fn burst(&self) -> u32 {
        self.burst as u32
    }
}

struct Entry {
    bucket: Arc<TokenBucket>,
    /// Nanoseconds since the limiter's epoch, for idle eviction.
    last_access: AtomicU64,
}

/// Outcome of an admission check, with the numbers transport adapters
/// surface as `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { limit: u32, remaining: u32 },
    Denied,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Token-bucket admission keyed by principal and organization.
///
/// Both maps grow on demand and shrink via the background reaper, bounding
/// memory under principal churn.
pub struct RateLimiter {
    principal_buckets: RwLock<HashMap<Uuid, Entry>>,
    org_buckets: RwLock<HashMap<Uuid, Entry>>,
    principal_config: BucketConfig,
    org_config: BucketConfig,
    epoch: Instant,
}

impl RateLimiter {
    pub fn new(config: RateConfig) -> Self {
        Self {
            principal_buckets: RwLock::new(HashMap::new()),
            org_buckets: RwLock::new(HashMap::new()),
            principal_config: config.principal,
            org_config: config.org,
            epoch: Instant::now(),
        }
    }

    /// Admit one request for `(principal, organization)`.
    ///
    /// Takes a token from both buckets; an empty bucket on either side
    /// denies. The reported numbers describe the principal bucket, which is
    /// the one callers can reason about.
    pub async fn check(&self, principal: Uuid, organization: Uuid) -> Admission {
        let principal_bucket = self
            .bucket_for(&self.principal_buckets, principal, self.principal_config)
            .await;
        let org_bucket = self
            .bucket_for(&self.org_buckets, organization, self.org_config)
            .await;

        if !principal_bucket.try_acquire() || !org_bucket.try_acquire() {
            return Admission::Denied;
        }

        Admission::Admitted {
            limit: principal_bucket.burst(),
            remaining: principal_bucket.remaining(),
        }
    }

    async fn bucket_for(
        &self,
        map: &RwLock<HashMap<Uuid, Entry>>,
        key: Uuid,
        config: BucketConfig,
    ) -> Arc<TokenBucket> {
        let now = self.epoch.elapsed().as_nanos() as u64;

        {
            let read = map.read().await;
            if let Some(entry) = read.get(&key) {
                entry.last_access.store(now, Ordering::Relaxed);
                return entry.bucket.clone();
            }
        }

        let mut write = map.write().await;
        let entry = write.entry(key).or_insert_with(|| Entry {
            bucket: Arc::new(TokenBucket::new(config)),
            last_access: AtomicU64::new(now),
        });
        entry.last_access.store(now, Ordering::Relaxed);
        entry.bucket.clone()
    }

    /// Drop entries idle longer than `max_idle`.
    pub async fn evict_idle(&self, max_idle: Duration) {
        let now = self.epoch.elapsed().as_nanos() as u64;
        let cutoff = now.saturating_sub(max_idle.as_nanos() as u64);

        let mut principals = self.principal_buckets.write().await;
        principals.retain(|_, entry| entry.last_access.load(Ordering::Relaxed) >= cutoff);
        let principal_count = principals.len();
        drop(principals);

        let mut orgs = self.org_buckets.write().await;
        orgs.retain(|_, entry| entry.last_access.load(Ordering::Relaxed) >= cutoff);
        let org_count = orgs.len();
        drop(orgs);

        debug!(principal_count, org_count, "rate limiter eviction pass");
    }

    /// Spawn the background reaper: every 5 minutes, evict buckets idle for
    /// 30 minutes or more.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                limiter.evict_idle(Duration::from_secs(30 * 60)).await;
            }
        })
    }
}
