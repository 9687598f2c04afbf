//! Analytics warehouse client contract, the BigQuery implementation, and the
//! pure transform from warehouse rows to per-family download records.

mod aggregate;
mod bigquery;
mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;
use pkgstats_core::{DateRange, PackageName};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use aggregate::{
    aggregate_events, classify, normalize_date, python_major, python_minor, system_bucket,
    AggregateError, DownloadEvent, FamilyBatches,
};
pub use bigquery::{build_query, BigQueryConfig, BigQueryWarehouse};
pub use memory::{MemoryWarehouse, QueryGate};

pub const CRATE_NAME: &str = "pkgstats-warehouse";

/// What one warehouse call covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum QueryScope {
    /// Every package, one day. Used by the scheduled run.
    Day { date: NaiveDate },
    /// One package over an inclusive range. Used by on-read backfills.
    Package { package: PackageName, range: DateRange },
}

impl QueryScope {
    pub fn day(date: NaiveDate) -> Self {
        Self::Day { date }
    }

    pub fn package(package: PackageName, range: DateRange) -> Self {
        Self::Package { package, range }
    }

    pub fn range(&self) -> DateRange {
        match self {
            QueryScope::Day { date } => DateRange::single(*date),
            QueryScope::Package { range, .. } => *range,
        }
    }

    pub fn package_name(&self) -> Option<&PackageName> {
        match self {
            QueryScope::Day { .. } => None,
            QueryScope::Package { package, .. } => Some(package),
        }
    }

    /// Whether a normalized row falls inside this scope.
    pub fn covers(&self, date: NaiveDate, package: &str) -> bool {
        match self {
            QueryScope::Day { date: day } => *day == date,
            QueryScope::Package { package: name, range } => {
                name.as_str() == package && range.contains(date)
            }
        }
    }
}

/// One row of the unioned aggregation result.
///
/// `date` stays raw JSON: drivers disagree on how a DATE column is shaped, and
/// [`normalize_date`] is where those shapes are reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub date: JsonValue,
    pub package: String,
    pub category_label: String,
    pub category: Option<String>,
    pub downloads: i64,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("warehouse returned http {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("warehouse job {job_id} did not finish within {waited_secs}s")]
    Deadline { job_id: String, waited_secs: u64 },
    #[error("malformed warehouse response: {0}")]
    Malformed(String),
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
}

impl WarehouseError {
    /// Whether the next scheduled or on-demand invocation is likely to succeed.
    /// Nothing retries in-loop; this only shapes log severity.
    pub fn is_transient(&self) -> bool {
        match self {
            WarehouseError::Request(err) => {
                err.is_timeout() || err.is_connect() || err.is_request()
            }
            WarehouseError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            WarehouseError::Deadline { .. } | WarehouseError::Unavailable(_) => true,
            WarehouseError::Malformed(_) => false,
        }
    }
}

pub type WarehouseResult<T> = Result<T, WarehouseError>;

/// Aggregating query interface over raw download events.
///
/// One call returns the union of all six family projections for its scope.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query(&self, scope: &QueryScope) -> WarehouseResult<Vec<WarehouseRow>>;
}
