use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use pkgstats_core::{
    DateRange, DownloadRecord, Family, RecentDownloadCount, RecentWindow, ALL_PACKAGES,
    WITHOUT_MIRRORS,
};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    CacheBackend, CategoryTotal, CoordinationError, CoordinationResult, DownloadStore, LeaseToken,
    LockService, PackageTotal, StoreError, StoreResult,
};

type RowKey = (NaiveDate, String, String);

#[derive(Debug, Default)]
struct MemoryTables {
    families: HashMap<Family, BTreeMap<RowKey, i64>>,
    recent: BTreeMap<(String, RecentWindow), i64>,
    failing: HashSet<Family>,
    failing_purge: HashSet<Family>,
    recent_offline: bool,
}

impl MemoryTables {
    fn check_available(&self, family: Family) -> StoreResult<()> {
        if self.failing.contains(&family) {
            return Err(StoreError::Unavailable(format!("{family} table is offline")));
        }
        Ok(())
    }

    /// Builds the replacement rows first so a constraint failure leaves the
    /// table exactly as it was, mirroring a rolled-back transaction.
    fn replace_where(
        &mut self,
        family: Family,
        records: &[DownloadRecord],
        doomed: impl Fn(&RowKey) -> bool,
    ) -> StoreResult<u64> {
        let table = self.families.entry(family).or_default();
        let mut next: BTreeMap<RowKey, i64> = table
            .iter()
            .filter(|(key, _)| !doomed(key))
            .map(|(key, downloads)| (key.clone(), *downloads))
            .collect();
        for record in records {
            let key = (record.date, record.package.clone(), record.category.clone());
            if next.insert(key, record.downloads).is_some() {
                return Err(StoreError::Duplicate {
                    family,
                    date: record.date,
                    package: record.package.clone(),
                    category: record.category.clone(),
                });
            }
        }
        *table = next;
        Ok(records.len() as u64)
    }
}

/// In-process [`DownloadStore`]; each call holds one lock for its whole body,
/// so replacements are as atomic as the Postgres transactions they stand in for.
#[derive(Debug, Default)]
pub struct MemoryDownloadStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryDownloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call touching `family` fail until [`Self::restore`].
    pub async fn fail_family(&self, family: Family) {
        self.tables.lock().await.failing.insert(family);
    }

    /// Make only `purge_before` fail for `family`.
    pub async fn fail_purge(&self, family: Family) {
        self.tables.lock().await.failing_purge.insert(family);
    }

    /// Make every `replace_recent` call fail.
    pub async fn fail_recent(&self) {
        self.tables.lock().await.recent_offline = true;
    }

    pub async fn restore(&self, family: Family) {
        let mut tables = self.tables.lock().await;
        tables.failing.remove(&family);
        tables.failing_purge.remove(&family);
    }

    /// Insert rows directly, bypassing the replace semantics.
    pub async fn seed(&self, family: Family, records: impl IntoIterator<Item = DownloadRecord>) {
        let mut tables = self.tables.lock().await;
        let table = tables.families.entry(family).or_default();
        for record in records {
            table.insert((record.date, record.package, record.category), record.downloads);
        }
    }

    /// Snapshot of a family table in key order.
    pub async fn rows(&self, family: Family) -> Vec<DownloadRecord> {
        let tables = self.tables.lock().await;
        tables
            .families
            .get(&family)
            .map(|table| {
                table
                    .iter()
                    .map(|((date, package, category), downloads)| {
                        DownloadRecord::new(*date, package.clone(), category.clone(), *downloads)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn recent_rows(&self) -> Vec<RecentDownloadCount> {
        let tables = self.tables.lock().await;
        tables
            .recent
            .iter()
            .map(|((package, window), downloads)| RecentDownloadCount {
                package: package.clone(),
                category: *window,
                downloads: *downloads,
            })
            .collect()
    }
}

#[async_trait]
impl DownloadStore for MemoryDownloadStore {
    async fn replace_day(
        &self,
        family: Family,
        date: NaiveDate,
        records: &[DownloadRecord],
    ) -> StoreResult<u64> {
        if let Some(stray) = records.iter().find(|r| r.date != date) {
            return Err(StoreError::OutOfScope {
                family,
                date: stray.date,
                package: stray.package.clone(),
            });
        }
        let mut tables = self.tables.lock().await;
        tables.check_available(family)?;
        tables.replace_where(family, records, |(row_date, _, _)| *row_date == date)
    }

    async fn replace_package_range(
        &self,
        family: Family,
        package: &str,
        range: DateRange,
        records: &[DownloadRecord],
    ) -> StoreResult<u64> {
        if let Some(stray) = records
            .iter()
            .find(|r| r.package != package || !range.contains(r.date))
        {
            return Err(StoreError::OutOfScope {
                family,
                date: stray.date,
                package: stray.package.clone(),
            });
        }
        let mut tables = self.tables.lock().await;
        tables.check_available(family)?;
        tables.replace_where(family, records, |(row_date, row_package, _)| {
            row_package == package && range.contains(*row_date)
        })
    }

    async fn rollup_all_packages(&self, family: Family, date: NaiveDate) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        tables.check_available(family)?;

        let mut sums: BTreeMap<String, i64> = BTreeMap::new();
        if let Some(table) = tables.families.get(&family) {
            for ((row_date, package, category), downloads) in table {
                if *row_date == date && package != ALL_PACKAGES {
                    *sums.entry(category.clone()).or_default() += downloads;
                }
            }
        }
        let records: Vec<DownloadRecord> = sums
            .into_iter()
            .map(|(category, downloads)| {
                DownloadRecord::new(date, ALL_PACKAGES, category, downloads)
            })
            .collect();
        tables.replace_where(family, &records, |(row_date, package, _)| {
            *row_date == date && package == ALL_PACKAGES
        })
    }

    async fn replace_recent(&self, window: RecentWindow, anchor: NaiveDate) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        tables.check_available(Family::Overall)?;
        if tables.recent_offline {
            return Err(StoreError::Unavailable("recent table is offline".into()));
        }

        let start = window.start(anchor);
        let mut sums: BTreeMap<String, i64> = BTreeMap::new();
        if let Some(table) = tables.families.get(&Family::Overall) {
            for ((row_date, package, category), downloads) in table {
                if category == WITHOUT_MIRRORS && start <= *row_date && *row_date <= anchor {
                    *sums.entry(package.clone()).or_default() += downloads;
                }
            }
        }
        tables.recent.retain(|(_, w), _| *w != window);
        let inserted = sums.len() as u64;
        for (package, downloads) in sums {
            tables.recent.insert((package, window), downloads);
        }
        Ok(inserted)
    }

    async fn purge_before(&self, family: Family, cutoff: NaiveDate) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        tables.check_available(family)?;
        if tables.failing_purge.contains(&family) {
            return Err(StoreError::Unavailable(format!("{family} purge rejected")));
        }
        let table = tables.families.entry(family).or_default();
        let before = table.len();
        table.retain(|(row_date, _, _), _| *row_date >= cutoff);
        Ok((before - table.len()) as u64)
    }

    async fn latest_date(&self, family: Family, package: &str) -> StoreResult<Option<NaiveDate>> {
        let tables = self.tables.lock().await;
        tables.check_available(family)?;
        Ok(tables.families.get(&family).and_then(|table| {
            table
                .keys()
                .filter(|(_, row_package, _)| row_package == package)
                .map(|(row_date, _, _)| *row_date)
                .max()
        }))
    }

    async fn series(
        &self,
        family: Family,
        package: &str,
        category: Option<&str>,
    ) -> StoreResult<Vec<DownloadRecord>> {
        let tables = self.tables.lock().await;
        tables.check_available(family)?;
        let Some(table) = tables.families.get(&family) else {
            return Ok(Vec::new());
        };
        Ok(table
            .iter()
            .filter(|((_, row_package, row_category), _)| {
                row_package == package && category.map_or(true, |c| c == row_category)
            })
            .map(|((date, package, category), downloads)| {
                DownloadRecord::new(*date, package.clone(), category.clone(), *downloads)
            })
            .collect())
    }

    async fn category_totals(
        &self,
        family: Family,
        package: &str,
    ) -> StoreResult<Vec<CategoryTotal>> {
        let tables = self.tables.lock().await;
        tables.check_available(family)?;
        let mut sums: BTreeMap<String, i64> = BTreeMap::new();
        if let Some(table) = tables.families.get(&family) {
            for ((_, row_package, category), downloads) in table {
                if row_package == package {
                    *sums.entry(category.clone()).or_default() += downloads;
                }
            }
        }
        Ok(sums
            .into_iter()
            .map(|(category, downloads)| CategoryTotal { category, downloads })
            .collect())
    }

    async fn recent(&self, package: &str) -> StoreResult<Vec<RecentDownloadCount>> {
        let tables = self.tables.lock().await;
        let mut out: Vec<RecentDownloadCount> = tables
            .recent
            .iter()
            .filter(|((row_package, _), _)| row_package == package)
            .map(|((package, window), downloads)| RecentDownloadCount {
                package: package.clone(),
                category: *window,
                downloads: *downloads,
            })
            .collect();
        out.sort_by_key(|r| r.category);
        Ok(out)
    }

    async fn popular_packages(
        &self,
        since: NaiveDate,
        limit: i64,
    ) -> StoreResult<Vec<PackageTotal>> {
        let tables = self.tables.lock().await;
        tables.check_available(Family::Overall)?;
        let mut sums: BTreeMap<String, i64> = BTreeMap::new();
        if let Some(table) = tables.families.get(&Family::Overall) {
            for ((row_date, package, category), downloads) in table {
                if category == WITHOUT_MIRRORS && *row_date >= since && package != ALL_PACKAGES {
                    *sums.entry(package.clone()).or_default() += downloads;
                }
            }
        }
        let mut ranked: Vec<PackageTotal> = sums
            .into_iter()
            .map(|(package, downloads)| PackageTotal { package, downloads })
            .collect();
        ranked.sort_by(|a, b| {
            b.downloads
                .cmp(&a.downloads)
                .then_with(|| a.package.cmp(&b.package))
        });
        ranked.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(ranked)
    }

    async fn package_count(&self) -> StoreResult<i64> {
        let tables = self.tables.lock().await;
        tables.check_available(Family::Overall)?;
        let packages: HashSet<&String> = tables
            .families
            .get(&Family::Overall)
            .into_iter()
            .flat_map(|table| table.keys())
            .filter(|(_, package, category)| category == WITHOUT_MIRRORS && package != ALL_PACKAGES)
            .map(|(_, package, _)| package)
            .collect();
        Ok(packages.len() as i64)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// In-process [`LockService`] with the same token and expiry semantics as the
/// Redis implementation.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    leases: Mutex<HashMap<String, (LeaseToken, Instant)>>,
    acquire_offline: AtomicBool,
    release_offline: AtomicBool,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `acquire` return a backend error while `offline` is set.
    pub fn fail_acquires(&self, offline: bool) {
        self.acquire_offline.store(offline, Ordering::SeqCst);
    }

    /// Make `release` return a backend error, leaving the lease to expire.
    pub fn fail_releases(&self, offline: bool) {
        self.release_offline.store(offline, Ordering::SeqCst);
    }

    pub async fn is_held(&self, key: &str) -> bool {
        let leases = self.leases.lock().await;
        leases
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> CoordinationResult<Option<LeaseToken>> {
        if self.acquire_offline.load(Ordering::SeqCst) {
            return Err(CoordinationError::Unavailable("lock service offline".into()));
        }
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let token = LeaseToken::generate();
        leases.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> CoordinationResult<bool> {
        if self.release_offline.load(Ordering::SeqCst) {
            return Err(CoordinationError::Unavailable("lock service offline".into()));
        }
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some((held, _)) if held == token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-process [`CacheBackend`] honouring per-entry TTL.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the cache being flushed or evicted.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get_raw(&self, key: &str) -> CoordinationResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> CoordinationResult<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoordinationResult<()> {
        self.entries.lock().await.remove(key);
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
    async fn replace_day_swaps_only_that_date() {
        let store = MemoryDownloadStore::new();
        store
            .seed(
                Family::System,
                [
                    DownloadRecord::new(d(2026, 5, 1), "requests", "Linux", 5),
                    DownloadRecord::new(d(2026, 5, 2), "requests", "Linux", 7),
                ],
            )
            .await;

        let inserted = store
            .replace_day(
                Family::System,
                d(2026, 5, 2),
                &[DownloadRecord::new(d(2026, 5, 2), "requests", "Darwin", 3)],
            )
            .await
            .unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(
            store.rows(Family::System).await,
            vec![
                DownloadRecord::new(d(2026, 5, 1), "requests", "Linux", 5),
                DownloadRecord::new(d(2026, 5, 2), "requests", "Darwin", 3),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_rows_leave_table_untouched() {
        let store = MemoryDownloadStore::new();
        let existing = DownloadRecord::new(d(2026, 5, 1), "requests", "3", 5);
        store.seed(Family::PythonMajor, [existing.clone()]).await;

        let dup = DownloadRecord::new(d(2026, 5, 1), "requests", "3", 1);
        let err = store
            .replace_day(Family::PythonMajor, d(2026, 5, 1), &[dup.clone(), dup])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Duplicate { .. }));
        assert_eq!(store.rows(Family::PythonMajor).await, vec![existing]);
    }

    #[tokio::test]
    async fn package_range_replacement_rejects_foreign_rows() {
        let store = MemoryDownloadStore::new();
        let range = DateRange::new(d(2026, 5, 1), d(2026, 5, 3)).unwrap();
        let err = store
            .replace_package_range(
                Family::Overall,
                "requests",
                range,
                &[DownloadRecord::new(d(2026, 5, 2), "urllib3", "with_mirrors", 1)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfScope { .. }));
    }

    #[tokio::test]
    async fn failing_family_is_isolated() {
        let store = MemoryDownloadStore::new();
        store.fail_family(Family::Installer).await;
        assert!(store.replace_day(Family::Installer, d(2026, 5, 1), &[]).await.is_err());
        assert!(store.replace_day(Family::Version, d(2026, 5, 1), &[]).await.is_ok());
        store.restore(Family::Installer).await;
        assert!(store.replace_day(Family::Installer, d(2026, 5, 1), &[]).await.is_ok());
    }

    #[tokio::test]
    async fn popular_packages_skip_rollup_rows() {
        let store = MemoryDownloadStore::new();
        store
            .seed(
                Family::Overall,
                [
                    DownloadRecord::new(d(2026, 5, 1), "requests", WITHOUT_MIRRORS, 10),
                    DownloadRecord::new(d(2026, 5, 1), "urllib3", WITHOUT_MIRRORS, 30),
                    DownloadRecord::new(d(2026, 5, 1), ALL_PACKAGES, WITHOUT_MIRRORS, 40),
                    DownloadRecord::new(d(2026, 5, 1), "requests", "with_mirrors", 99),
                ],
            )
            .await;

        let top = store.popular_packages(d(2026, 4, 1), 10).await.unwrap();
        assert_eq!(
            top,
            vec![
                PackageTotal { package: "urllib3".into(), downloads: 30 },
                PackageTotal { package: "requests".into(), downloads: 10 },
            ]
        );
        assert_eq!(store.package_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released_by_holder() {
        let locks = MemoryLockService::new();
        let token = locks
            .acquire("etl:2026-05-01", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("first acquire");
        assert!(locks
            .acquire("etl:2026-05-01", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        assert!(!locks.release("etl:2026-05-01", &LeaseToken::generate()).await.unwrap());
        assert!(locks.is_held("etl:2026-05-01").await);
        assert!(locks.release("etl:2026-05-01", &token).await.unwrap());
        assert!(!locks.is_held("etl:2026-05-01").await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_can_be_taken_over() {
        let locks = MemoryLockService::new();
        let stale = locks
            .acquire("pkg:requests", Duration::from_secs(900))
            .await
            .unwrap()
            .expect("acquire");
        tokio::time::advance(Duration::from_secs(901)).await;

        let fresh = locks
            .acquire("pkg:requests", Duration::from_secs(900))
            .await
            .unwrap()
            .expect("takeover after expiry");
        assert!(!locks.release("pkg:requests", &stale).await.unwrap());
        assert!(locks.release("pkg:requests", &fresh).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set_raw("k", "v".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.get_raw("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get_raw("k").await.unwrap(), None);
    }
}
