//! Relational store for download series plus the lock/cache coordination layer.
//!
//! The relational store is the source of truth. Locks and cache entries are
//! transient coordination state: losing them costs recomputation, never
//! correctness.

mod memory;
mod postgres;
mod redis_backend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use pkgstats_core::{DateRange, DownloadRecord, Family, RecentDownloadCount, RecentWindow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use memory::{MemoryCache, MemoryDownloadStore, MemoryLockService};
pub use postgres::PgDownloadStore;
pub use redis_backend::{RedisCoordinator, RedisPolicy};

pub const CRATE_NAME: &str = "pkgstats-storage";

/// How long a full-day completion sentinel is remembered.
pub const PROCESSED_MARKER_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 14);

pub const PACKAGE_COUNT_KEY: &str = "package_count";

/// Current leaderboard generation; rotating it orphans every `popular:` entry.
const LEADERBOARD_EPOCH_KEY: &str = "popular_epoch";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("duplicate {family} row for ({date}, {package}, {category})")]
    Duplicate {
        family: Family,
        date: NaiveDate,
        package: String,
        category: String,
    },
    #[error("{family} row for ({date}, {package}) is outside the replaced scope")]
    OutOfScope {
        family: Family,
        date: NaiveDate,
        package: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Download total for one package, used for leaderboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageTotal {
    pub package: String,
    pub downloads: i64,
}

/// Download total for one category of a family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub category: String,
    pub downloads: i64,
}

/// Transactional access to the per-family download tables.
///
/// Every `replace_*` method is a delete-then-insert inside one transaction:
/// readers see either the old rows or the new rows for the scope, never a mix.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    /// Replace every row of `family` dated `date`, all packages included.
    /// Records dated otherwise are rejected.
    async fn replace_day(
        &self,
        family: Family,
        date: NaiveDate,
        records: &[DownloadRecord],
    ) -> StoreResult<u64>;

    /// Replace the rows of `family` for one package inside `range`.
    ///
    /// Rows of other packages on the same dates are left untouched. Records
    /// outside `(package, range)` are rejected.
    async fn replace_package_range(
        &self,
        family: Family,
        package: &str,
        range: DateRange,
        records: &[DownloadRecord],
    ) -> StoreResult<u64>;

    /// Recompute the `__all__` rows of `family` for `date` from real packages.
    async fn rollup_all_packages(&self, family: Family, date: NaiveDate) -> StoreResult<u64>;

    /// Rebuild one window of the `recent` table from overall `without_mirrors`
    /// rows dated within `[window.start(anchor), anchor]`.
    async fn replace_recent(&self, window: RecentWindow, anchor: NaiveDate) -> StoreResult<u64>;

    /// Delete rows of `family` dated strictly before `cutoff`.
    async fn purge_before(&self, family: Family, cutoff: NaiveDate) -> StoreResult<u64>;

    async fn latest_date(&self, family: Family, package: &str) -> StoreResult<Option<NaiveDate>>;

    async fn series(
        &self,
        family: Family,
        package: &str,
        category: Option<&str>,
    ) -> StoreResult<Vec<DownloadRecord>>;

    async fn category_totals(&self, family: Family, package: &str)
        -> StoreResult<Vec<CategoryTotal>>;

    async fn recent(&self, package: &str) -> StoreResult<Vec<RecentDownloadCount>>;

    /// Packages ranked by overall `without_mirrors` downloads since `since`.
    async fn popular_packages(&self, since: NaiveDate, limit: i64)
        -> StoreResult<Vec<PackageTotal>>;

    /// Distinct real packages with overall `without_mirrors` rows.
    async fn package_count(&self) -> StoreResult<i64>;

    async fn health_check(&self) -> StoreResult<()>;
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("coordination call timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache payload for {key} is not valid json: {source}")]
    Payload {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("coordination backend unavailable: {0}")]
    Unavailable(String),
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Proof of lock ownership; only the matching token may release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// TTL-bounded mutual exclusion across processes.
#[async_trait]
pub trait LockService: Send + Sync {
    /// `None` when another holder owns an unexpired lease on `key`.
    async fn acquire(&self, key: &str, ttl: Duration) -> CoordinationResult<Option<LeaseToken>>;

    /// Deletes the lease only if `token` still matches. Returns whether it did.
    async fn release(&self, key: &str, token: &LeaseToken) -> CoordinationResult<bool>;
}

/// Raw string key-value store with per-entry TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_raw(&self, key: &str) -> CoordinationResult<Option<String>>;
    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> CoordinationResult<()>;
    async fn delete(&self, key: &str) -> CoordinationResult<()>;
}

/// Typed JSON view over a [`CacheBackend`], plus the key layout shared by the
/// orchestrators and the read path.
#[derive(Clone)]
pub struct FreshnessCache {
    backend: Arc<dyn CacheBackend>,
}

impl FreshnessCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn processed_key(date: NaiveDate) -> String {
        format!("processed:{date}")
    }

    pub fn package_key(package: &str, suffix: &str) -> String {
        format!("package:{package}:{suffix}")
    }

    pub fn recent_key(package: &str) -> String {
        format!("recent:{package}")
    }

    /// Leaderboard key under the current epoch. An unreadable epoch falls
    /// back to the initial one.
    pub async fn popular_key(&self, days: u64, limit: i64) -> String {
        let epoch = match self.get::<String>(LEADERBOARD_EPOCH_KEY).await {
            Ok(epoch) => epoch.unwrap_or_else(|| "0".to_string()),
            Err(err) => {
                warn!(error = %err, "leaderboard epoch lookup failed");
                "0".to_string()
            }
        };
        format!("popular:{epoch}:{days}:{limit}")
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CoordinationResult<Option<T>> {
        let Some(raw) = self.backend.get_raw(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| CoordinationError::Payload {
                key: key.to_string(),
                source,
            })
    }

    pub async fn set<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CoordinationResult<()> {
        let raw = serde_json::to_string(value).map_err(|source| CoordinationError::Payload {
            key: key.to_string(),
            source,
        })?;
        self.backend.set_raw(key, raw, ttl).await
    }

    pub async fn del(&self, key: &str) -> CoordinationResult<()> {
        self.backend.delete(key).await
    }

    /// Cache errors read as "not processed": a false negative only costs a
    /// redundant, idempotent run.
    pub async fn is_processed(&self, date: NaiveDate) -> bool {
        match self.get::<bool>(&Self::processed_key(date)).await {
            Ok(marker) => marker.unwrap_or(false),
            Err(err) => {
                warn!(
                    %date,
                    error = %err,
                    "processed marker lookup failed; treating as unprocessed"
                );
                false
            }
        }
    }

    pub async fn mark_processed(&self, date: NaiveDate) -> CoordinationResult<()> {
        self.set(&Self::processed_key(date), &true, PROCESSED_MARKER_TTL)
            .await
    }

    /// Drop the package count and retire every cached leaderboard.
    pub async fn invalidate_leaderboards(&self) -> CoordinationResult<()> {
        self.del(PACKAGE_COUNT_KEY).await?;
        let epoch = uuid::Uuid::new_v4().simple().to_string();
        self.set(LEADERBOARD_EPOCH_KEY, &epoch, PROCESSED_MARKER_TTL)
            .await
    }

    /// Drop every cached read result for `package`.
    pub async fn invalidate_package(&self, package: &str) -> CoordinationResult<()> {
        self.del(&Self::recent_key(package)).await?;
        self.del(&Self::package_key(package, "summary")).await?;
        for family in Family::ALL {
            self.del(&Self::package_key(package, &format!("{family}_all")))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[tokio::test]
    async fn processed_marker_round_trips() {
        let cache = FreshnessCache::new(Arc::new(MemoryCache::default()));
        assert!(!cache.is_processed(d(2026, 4, 1)).await);
        cache.mark_processed(d(2026, 4, 1)).await.unwrap();
        assert!(cache.is_processed(d(2026, 4, 1)).await);
        assert!(!cache.is_processed(d(2026, 4, 2)).await);
    }

    #[tokio::test]
    async fn malformed_marker_reads_as_unprocessed() {
        let cache = FreshnessCache::new(Arc::new(MemoryCache::default()));
        cache
            .backend()
            .set_raw("processed:2026-04-01", "not-json".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!cache.is_processed(d(2026, 4, 1)).await);
    }

    #[tokio::test]
    async fn typed_values_round_trip() {
        let cache = FreshnessCache::new(Arc::new(MemoryCache::default()));
        let totals = vec![PackageTotal {
            package: "requests".into(),
            downloads: 42,
        }];
        cache
            .set("top", &totals, Duration::from_secs(60))
            .await
            .unwrap();
        let back: Option<Vec<PackageTotal>> = cache.get("top").await.unwrap();
        assert_eq!(back, Some(totals));
        cache.del("top").await.unwrap();
        assert_eq!(cache.get::<Vec<PackageTotal>>("top").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_package_clears_series_keys() {
        let cache = FreshnessCache::new(Arc::new(MemoryCache::default()));
        let key = FreshnessCache::package_key("requests", "overall_all");
        cache.set(&key, &1u8, Duration::from_secs(60)).await.unwrap();
        cache.invalidate_package("requests").await.unwrap();
        assert_eq!(cache.get::<u8>(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidating_leaderboards_rotates_popular_keys() {
        let cache = FreshnessCache::new(Arc::new(MemoryCache::default()));
        let before = cache.popular_key(30, 10).await;
        assert_eq!(before, "popular:0:30:10");
        cache.set(&before, &1u8, Duration::from_secs(60)).await.unwrap();
        cache.set(PACKAGE_COUNT_KEY, &7i64, Duration::from_secs(60)).await.unwrap();

        cache.invalidate_leaderboards().await.unwrap();

        let after = cache.popular_key(30, 10).await;
        assert_ne!(after, before);
        assert_eq!(cache.get::<u8>(&after).await.unwrap(), None);
        assert_eq!(cache.get::<i64>(PACKAGE_COUNT_KEY).await.unwrap(), None);
    }

    #[test]
    fn lease_tokens_are_unique() {
        assert_ne!(LeaseToken::generate(), LeaseToken::generate());
    }
}
