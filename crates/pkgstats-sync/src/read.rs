use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pkgstats_core::{
    days_before, DownloadRecord, Family, PackageName, RecentDownloadCount, WITHOUT_MIRRORS,
    WITH_MIRRORS,
};
use pkgstats_storage::{
    CategoryTotal, FreshnessCache, PackageTotal, StoreError, StoreResult, PACKAGE_COUNT_KEY,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{EtlService, FreshnessOutcome};

pub const READ_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilySummary {
    pub family: Family,
    pub totals: Vec<CategoryTotal>,
}

/// Cached read path. Per-package reads bring the package up to date first;
/// cache failures fall back to the store.
pub struct ReadService {
    etl: Arc<EtlService>,
}

impl ReadService {
    pub fn new(etl: Arc<EtlService>) -> Self {
        Self { etl }
    }

    fn cache(&self) -> &FreshnessCache {
        self.etl.cache()
    }

    async fn refresh(&self, package: &PackageName) {
        match self.etl.ensure_fresh(package).await {
            FreshnessOutcome::Failed { error } => {
                warn!(%package, %error, "serving possibly stale data");
            }
            outcome => debug!(%package, ?outcome, "freshness checked"),
        }
    }

    /// Daily rows for one family, optionally narrowed to a single category.
    pub async fn series(
        &self,
        family: Family,
        package: &PackageName,
        category: Option<&str>,
    ) -> Result<Vec<DownloadRecord>> {
        self.refresh(package).await;
        let key = FreshnessCache::package_key(package.as_str(), &format!("{family}_all"));
        let store = self.etl.store().clone();
        let name = package.as_str().to_string();
        let rows = self
            .cached(&key, || async move { store.series(family, &name, None).await })
            .await?;
        Ok(match category {
            Some(category) => rows.into_iter().filter(|r| r.category == category).collect(),
            None => rows,
        })
    }

    /// Overall downloads; `mirrors` picks one of the two categories, `None` returns both.
    pub async fn overall(
        &self,
        package: &PackageName,
        mirrors: Option<bool>,
    ) -> Result<Vec<DownloadRecord>> {
        let category = mirrors.map(|with| if with { WITH_MIRRORS } else { WITHOUT_MIRRORS });
        self.series(Family::Overall, package, category).await
    }

    pub async fn recent(&self, package: &PackageName) -> Result<Vec<RecentDownloadCount>> {
        self.refresh(package).await;
        let key = FreshnessCache::recent_key(package.as_str());
        let store = self.etl.store().clone();
        let name = package.as_str().to_string();
        self.cached(&key, || async move { store.recent(&name).await })
            .await
    }

    /// Category totals of every family that has rows for the package.
    pub async fn summary(&self, package: &PackageName) -> Result<Vec<FamilySummary>> {
        self.refresh(package).await;
        let key = FreshnessCache::package_key(package.as_str(), "summary");
        let store = self.etl.store().clone();
        let name = package.as_str().to_string();
        self.cached(&key, || async move {
            let mut summary = Vec::new();
            for family in Family::ALL {
                let totals = store.category_totals(family, &name).await?;
                if !totals.is_empty() {
                    summary.push(FamilySummary { family, totals });
                }
            }
            Ok::<_, StoreError>(summary)
        })
        .await
    }

    /// Top packages by overall `without_mirrors` downloads over the last `days`.
    pub async fn popular_packages(&self, limit: i64, days: u64) -> Result<Vec<PackageTotal>> {
        let since = days_before(self.etl.clock().today(), days);
        let key = self.cache().popular_key(days, limit).await;
        let store = self.etl.store().clone();
        self.cached(&key, || async move { store.popular_packages(since, limit).await })
            .await
    }

    pub async fn package_count(&self) -> Result<i64> {
        match self.cache().get::<i64>(PACKAGE_COUNT_KEY).await {
            Ok(Some(count)) => return Ok(count),
            Ok(None) => {}
            Err(err) => warn!(key = PACKAGE_COUNT_KEY, error = %err, "cache read failed"),
        }
        let count = self
            .etl
            .store()
            .package_count()
            .await
            .context("counting packages")?;
        if count > 0 {
            if let Err(err) = self.cache().set(PACKAGE_COUNT_KEY, &count, READ_CACHE_TTL).await {
                warn!(key = PACKAGE_COUNT_KEY, error = %err, "cache write failed");
            }
        }
        Ok(count)
    }

    /// Serve `key` from cache, else load it. Non-empty results are cached;
    /// an empty result clears the key so a later backfill shows up at once.
    async fn cached<T, F, Fut>(&self, key: &str, load: F) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<Vec<T>>>,
    {
        match self.cache().get::<Vec<T>>(key).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(err) => warn!(key, error = %err, "cache read failed"),
        }

        let value = load().await.with_context(|| format!("loading {key}"))?;
        let write = if value.is_empty() {
            self.cache().del(key).await
        } else {
            self.cache().set(key, &value, READ_CACHE_TTL).await
        };
        if let Err(err) = write {
            warn!(key, error = %err, "cache write failed");
        }
        Ok(value)
    }
}
