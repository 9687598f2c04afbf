use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use pkgstats_core::{
    days_after, days_before, Clock, DateRange, Family, PackageName, RecentWindow, RETENTION_DAYS,
    SEED_DAYS,
};
use pkgstats_storage::{DownloadStore, FreshnessCache, LeaseToken, LockService};
use pkgstats_warehouse::{FamilyBatches, QueryScope, Warehouse};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const ETL_LOCK_TTL: Duration = Duration::from_secs(30 * 60);
pub const BACKFILL_LOCK_TTL: Duration = Duration::from_secs(15 * 60);

pub fn etl_lock_key(date: NaiveDate) -> String {
    format!("etl:{date}")
}

pub fn backfill_lock_key(package: &PackageName, range: DateRange) -> String {
    format!("pkg:{package}:{}:{}", range.start, range.end)
}

#[derive(Debug, Clone)]
pub struct EtlSettings {
    pub retention_days: u64,
    pub seed_days: u64,
    pub etl_lock_ttl: Duration,
    pub backfill_lock_ttl: Duration,
}

impl Default for EtlSettings {
    fn default() -> Self {
        Self {
            retention_days: RETENTION_DAYS,
            seed_days: SEED_DAYS,
            etl_lock_ttl: ETL_LOCK_TTL,
            backfill_lock_ttl: BACKFILL_LOCK_TTL,
        }
    }
}

/// Result of one per-family (or per-window) step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Ok { rows: u64 },
    Failed { error: String },
}

impl StepResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepResult::Ok { .. })
    }

    fn record<E: fmt::Display>(
        step: &'static str,
        target: impl fmt::Display,
        outcome: Result<u64, E>,
    ) -> Self {
        match outcome {
            Ok(rows) => {
                debug!(step, %target, rows, "step complete");
                StepResult::Ok { rows }
            }
            Err(err) => {
                let error = err.to_string();
                error!(step, %target, %error, "step failed");
                StepResult::Failed { error }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_fetched: usize,
    pub downloads: BTreeMap<Family, StepResult>,
    pub rollups: BTreeMap<Family, StepResult>,
    pub recent: BTreeMap<RecentWindow, StepResult>,
    /// `None` when the run was asked not to purge.
    pub purge: Option<BTreeMap<Family, StepResult>>,
    pub marked_processed: bool,
    pub elapsed_ms: u64,
}

impl RunReport {
    fn new(run_id: Uuid, date: NaiveDate, started_at: DateTime<Utc>, rows_fetched: usize) -> Self {
        Self {
            run_id,
            date,
            started_at,
            finished_at: started_at,
            rows_fetched,
            downloads: BTreeMap::new(),
            rollups: BTreeMap::new(),
            recent: BTreeMap::new(),
            purge: None,
            marked_processed: false,
            elapsed_ms: 0,
        }
    }

    /// Every family's upsert and rollup succeeded.
    pub fn core_succeeded(&self) -> bool {
        self.downloads.len() == Family::ALL.len()
            && self.rollups.len() == Family::ALL.len()
            && self.downloads.values().all(StepResult::is_ok)
            && self.rollups.values().all(StepResult::is_ok)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EtlOutcome {
    /// The date already carries a processed marker; nothing was queried.
    Skipped { date: NaiveDate },
    /// Another run holds the lease for this date.
    Locked { date: NaiveDate },
    Completed(RunReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FreshnessOutcome {
    UpToDate { latest: NaiveDate },
    /// The computed window was empty.
    NothingToDo,
    Locked { range: DateRange },
    Backfilled {
        range: DateRange,
        rows: usize,
        families: BTreeMap<Family, StepResult>,
    },
    Failed { error: String },
}

/// Both ingestion paths over one set of injected collaborators.
pub struct EtlService {
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn DownloadStore>,
    locks: Arc<dyn LockService>,
    cache: FreshnessCache,
    clock: Arc<dyn Clock>,
    settings: EtlSettings,
}

impl EtlService {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        store: Arc<dyn DownloadStore>,
        locks: Arc<dyn LockService>,
        cache: FreshnessCache,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            warehouse,
            store,
            locks,
            cache,
            clock,
            settings: EtlSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EtlSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<dyn DownloadStore> {
        &self.store
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn settings(&self) -> &EtlSettings {
        &self.settings
    }

    /// Connectivity check against the relational store.
    pub async fn health_check(&self) -> Result<()> {
        self.store
            .health_check()
            .await
            .context("store health check")
    }

    /// Full-day ingestion for `target` (default: yesterday).
    ///
    /// Only a lock-service or warehouse failure is an `Err`; per-family
    /// failures are recorded in the report.
    pub async fn run(&self, target: Option<NaiveDate>, purge: bool) -> Result<EtlOutcome> {
        let date = target.unwrap_or_else(|| self.clock.yesterday());
        let run_id = Uuid::new_v4();
        let span = info_span!("etl_run", %run_id, %date, purge);
        self.run_day(run_id, date, purge).instrument(span).await
    }

    async fn run_day(&self, run_id: Uuid, date: NaiveDate, purge: bool) -> Result<EtlOutcome> {
        if self.cache.is_processed(date).await {
            info!("date already processed; skipping");
            return Ok(EtlOutcome::Skipped { date });
        }

        let key = etl_lock_key(date);
        let Some(token) = self
            .locks
            .acquire(&key, self.settings.etl_lock_ttl)
            .await
            .with_context(|| format!("acquiring lock {key}"))?
        else {
            info!("another run holds the lock");
            return Ok(EtlOutcome::Locked { date });
        };

        let result = self.process_day(run_id, date, purge).await;
        self.release(&key, &token).await;
        result.map(EtlOutcome::Completed)
    }

    async fn process_day(&self, run_id: Uuid, date: NaiveDate, purge: bool) -> Result<RunReport> {
        let started = Instant::now();
        let started_at = Utc::now();
        let scope = QueryScope::day(date);
        let rows = self
            .warehouse
            .query(&scope)
            .await
            .with_context(|| format!("warehouse query for {date}"))?;

        let mut batches = FamilyBatches::from_rows(rows, &scope);
        let mut report = RunReport::new(run_id, date, started_at, batches.row_count());
        let loaded = !batches.is_empty();
        if loaded {
            self.load_day(&mut report, &mut batches, date).await;
        } else {
            warn!("warehouse returned no rows; stored data left untouched");
        }

        if purge {
            report.purge = Some(self.purge_expired().await);
        }

        if report.core_succeeded() {
            match self.cache.mark_processed(date).await {
                Ok(()) => {
                    report.marked_processed = true;
                    if let Err(err) = self.cache.invalidate_leaderboards().await {
                        warn!(error = %err, "could not invalidate cached leaderboards");
                    }
                }
                Err(err) => warn!(error = %err, "could not write processed marker"),
            }
        } else if loaded {
            warn!("some families failed; date left unmarked for the next run");
        }

        let report = finish(report, started);
        info!(
            rows_fetched = report.rows_fetched,
            marked = report.marked_processed,
            elapsed_ms = report.elapsed_ms,
            "etl run complete"
        );
        Ok(report)
    }

    /// Family upserts, `__all__` rollups and recent windows for one day.
    async fn load_day(
        &self,
        report: &mut RunReport,
        batches: &mut FamilyBatches,
        date: NaiveDate,
    ) {
        for family in Family::ALL {
            let outcome = match batches.take(family) {
                Ok(records) => self
                    .store
                    .replace_day(family, date, &records)
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            report
                .downloads
                .insert(family, StepResult::record("upsert", family, outcome));
        }

        for family in Family::ALL {
            let outcome = self.store.rollup_all_packages(family, date).await;
            report
                .rollups
                .insert(family, StepResult::record("rollup", family, outcome));
        }

        for window in RecentWindow::ALL {
            let outcome = self.store.replace_recent(window, date).await;
            report
                .recent
                .insert(window, StepResult::record("recent", window, outcome));
        }
    }

    /// Delete rows older than the retention horizon, family by family.
    pub async fn purge_expired(&self) -> BTreeMap<Family, StepResult> {
        let cutoff = days_before(self.clock.today(), self.settings.retention_days);
        let mut results = BTreeMap::new();
        for family in Family::ALL {
            let outcome = self.store.purge_before(family, cutoff).await;
            results.insert(family, StepResult::record("purge", family, outcome));
        }
        info!(%cutoff, "retention sweep complete");
        results
    }

    /// Bring one package's persisted history up to yesterday. Never fails:
    /// every problem is logged and folded into the outcome.
    pub async fn ensure_fresh(&self, package: &PackageName) -> FreshnessOutcome {
        let span = info_span!("ensure_fresh", %package);
        self.refresh_package(package).instrument(span).await
    }

    async fn refresh_package(&self, package: &PackageName) -> FreshnessOutcome {
        let yesterday = self.clock.yesterday();
        let latest = match self.store.latest_date(Family::Overall, package.as_str()).await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(error = %err, "could not read latest date");
                return FreshnessOutcome::Failed {
                    error: err.to_string(),
                };
            }
        };

        if let Some(latest) = latest.filter(|latest| *latest >= yesterday) {
            return FreshnessOutcome::UpToDate { latest };
        }
        let start = match latest {
            Some(last) => days_after(last, 1),
            None => days_before(self.clock.today(), self.settings.seed_days),
        };
        let Some(range) = DateRange::new(start, yesterday) else {
            return FreshnessOutcome::NothingToDo;
        };

        let key = backfill_lock_key(package, range);
        let token = match self.locks.acquire(&key, self.settings.backfill_lock_ttl).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(%range, "backfill already in flight");
                return FreshnessOutcome::Locked { range };
            }
            Err(err) => {
                warn!(error = %err, "could not acquire backfill lock");
                return FreshnessOutcome::Failed {
                    error: err.to_string(),
                };
            }
        };

        let outcome = self.backfill(package, range).await;
        self.release(&key, &token).await;
        outcome
    }

    async fn backfill(&self, package: &PackageName, range: DateRange) -> FreshnessOutcome {
        let scope = QueryScope::package(package.clone(), range);
        let rows = match self.warehouse.query(&scope).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    %range,
                    transient = err.is_transient(),
                    error = %err,
                    "backfill query failed"
                );
                return FreshnessOutcome::Failed {
                    error: err.to_string(),
                };
            }
        };

        let mut batches = FamilyBatches::from_rows(rows, &scope);
        let mut families = BTreeMap::new();
        for family in Family::ALL {
            let outcome = match batches.take(family) {
                Ok(records) => self
                    .store
                    .replace_package_range(family, package.as_str(), range, &records)
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            families.insert(family, StepResult::record("backfill", family, outcome));
        }

        if let Err(err) = self.cache.invalidate_package(package.as_str()).await {
            warn!(error = %err, "could not invalidate cached reads");
        }
        info!(
            %range,
            days = range.num_days(),
            rows = batches.row_count(),
            "backfill complete"
        );
        FreshnessOutcome::Backfilled {
            range,
            rows: batches.row_count(),
            families,
        }
    }

    async fn release(&self, key: &str, token: &LeaseToken) {
        match self.locks.release(key, token).await {
            Ok(true) => debug!(key, "lock released"),
            Ok(false) => warn!(key, "lock expired or changed hands before release"),
            Err(err) => warn!(key, error = %err, "lock release failed; lease will expire"),
        }
    }
}

fn finish(mut report: RunReport, started: Instant) -> RunReport {
    report.finished_at = Utc::now();
    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    report
}
