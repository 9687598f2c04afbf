use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use pkgstats_core::{
    DateRange, DownloadRecord, Family, RecentDownloadCount, RecentWindow, ALL_PACKAGES,
    WITHOUT_MIRRORS,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{CategoryTotal, DownloadStore, PackageTotal, StoreError, StoreResult};

const RECENT_TABLE: &str = "recent";

/// PostgreSQL-backed store. Expects one table per [`Family`] with columns
/// `(date DATE, package TEXT, category TEXT, downloads BIGINT)` unique on
/// `(date, package, category)`, and `recent (package, category, downloads)`.
#[derive(Debug, Clone)]
pub struct PgDownloadStore {
    pool: PgPool,
}

impl PgDownloadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bulk insert through `UNNEST` so one statement carries the whole batch.
    async fn insert_records(
        tx: &mut Transaction<'_, Postgres>,
        family: Family,
        records: &[DownloadRecord],
    ) -> StoreResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut dates = Vec::with_capacity(records.len());
        let mut packages = Vec::with_capacity(records.len());
        let mut categories = Vec::with_capacity(records.len());
        let mut downloads = Vec::with_capacity(records.len());
        for record in records {
            dates.push(record.date);
            packages.push(record.package.clone());
            categories.push(record.category.clone());
            downloads.push(record.downloads);
        }

        let sql = format!(
            "INSERT INTO {} (date, package, category, downloads)
             SELECT * FROM UNNEST($1::date[], $2::text[], $3::text[], $4::bigint[])",
            family.table()
        );
        let result = sqlx::query(&sql)
            .bind(dates)
            .bind(packages)
            .bind(categories)
            .bind(downloads)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DownloadStore for PgDownloadStore {
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
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(&format!("DELETE FROM {} WHERE date = $1", family.table()))
            .bind(date)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let inserted = Self::insert_records(&mut tx, family, records).await?;

        tx.commit().await?;
        debug!(%family, %date, deleted, inserted, "replaced day");
        Ok(inserted)
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

        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE package = $1 AND date >= $2 AND date <= $3",
            family.table()
        ))
        .bind(package)
        .bind(range.start)
        .bind(range.end)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let inserted = Self::insert_records(&mut tx, family, records).await?;

        tx.commit().await?;
        debug!(%family, package, %range, deleted, inserted, "replaced package range");
        Ok(inserted)
    }

    async fn rollup_all_packages(&self, family: Family, date: NaiveDate) -> StoreResult<u64> {
        let table = family.table();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "DELETE FROM {table} WHERE date = $1 AND package = $2"
        ))
        .bind(date)
        .bind(ALL_PACKAGES)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {table} (date, package, category, downloads)
             SELECT date, $2, category, SUM(downloads)::bigint
             FROM {table}
             WHERE date = $1 AND package <> $2
             GROUP BY date, category"
        ))
        .bind(date)
        .bind(ALL_PACKAGES)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(inserted)
    }

    async fn replace_recent(&self, window: RecentWindow, anchor: NaiveDate) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM {RECENT_TABLE} WHERE category = $1"))
            .bind(window.label())
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {RECENT_TABLE} (package, category, downloads)
             SELECT package, $1, SUM(downloads)::bigint
             FROM {overall}
             WHERE category = $2 AND date >= $3 AND date <= $4
             GROUP BY package",
            overall = Family::Overall.table()
        ))
        .bind(window.label())
        .bind(WITHOUT_MIRRORS)
        .bind(window.start(anchor))
        .bind(anchor)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(inserted)
    }

    async fn purge_before(&self, family: Family, cutoff: NaiveDate) -> StoreResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE date < $1", family.table()))
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn latest_date(&self, family: Family, package: &str) -> StoreResult<Option<NaiveDate>> {
        let latest: Option<NaiveDate> = sqlx::query_scalar(&format!(
            "SELECT MAX(date) FROM {} WHERE package = $1",
            family.table()
        ))
        .bind(package)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn series(
        &self,
        family: Family,
        package: &str,
        category: Option<&str>,
    ) -> StoreResult<Vec<DownloadRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT date, package, category, downloads
             FROM {}
             WHERE package = $1 AND ($2::text IS NULL OR category = $2)
             ORDER BY date ASC, category ASC",
            family.table()
        ))
        .bind(package)
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DownloadRecord {
                date: row.try_get("date")?,
                package: row.try_get("package")?,
                category: row.try_get("category")?,
                downloads: row.try_get("downloads")?,
            });
        }
        Ok(out)
    }

    async fn category_totals(
        &self,
        family: Family,
        package: &str,
    ) -> StoreResult<Vec<CategoryTotal>> {
        let rows = sqlx::query(&format!(
            "SELECT category, SUM(downloads)::bigint AS downloads
             FROM {}
             WHERE package = $1
             GROUP BY category
             ORDER BY category ASC",
            family.table()
        ))
        .bind(package)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CategoryTotal {
                category: row.try_get("category")?,
                downloads: row.try_get("downloads")?,
            });
        }
        Ok(out)
    }

    async fn recent(&self, package: &str) -> StoreResult<Vec<RecentDownloadCount>> {
        let rows = sqlx::query(&format!(
            "SELECT package, category, downloads FROM {RECENT_TABLE} WHERE package = $1"
        ))
        .bind(package)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let category: String = row.try_get("category")?;
            let Ok(window) = category.parse::<RecentWindow>() else {
                continue;
            };
            out.push(RecentDownloadCount {
                package: row.try_get("package")?,
                category: window,
                downloads: row.try_get("downloads")?,
            });
        }
        out.sort_by_key(|r| r.category);
        Ok(out)
    }

    async fn popular_packages(
        &self,
        since: NaiveDate,
        limit: i64,
    ) -> StoreResult<Vec<PackageTotal>> {
        let rows = sqlx::query(&format!(
            "SELECT package, SUM(downloads)::bigint AS downloads
             FROM {}
             WHERE category = $1 AND date >= $2 AND package <> $3
             GROUP BY package
             ORDER BY downloads DESC, package ASC
             LIMIT $4",
            Family::Overall.table()
        ))
        .bind(WITHOUT_MIRRORS)
        .bind(since)
        .bind(ALL_PACKAGES)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PackageTotal {
                package: row.try_get("package")?,
                downloads: row.try_get("downloads")?,
            });
        }
        Ok(out)
    }

    async fn package_count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(DISTINCT package) FROM {} WHERE category = $1 AND package <> $2",
            Family::Overall.table()
        ))
        .bind(WITHOUT_MIRRORS)
        .bind(ALL_PACKAGES)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
