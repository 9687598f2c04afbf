use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use pkgstats_core::{
    DownloadRecord, Family, MIRRORS, OTHER_SYSTEM, SYSTEMS, UNKNOWN_CATEGORY, WITHOUT_MIRRORS,
    WITH_MIRRORS,
};
use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use crate::{QueryScope, WarehouseRow};

static PYTHON_MAJOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)(?:\.|$)").expect("static regex"));
static PYTHON_MINOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.[0-9]+").expect("static regex"));

/// A single raw download as the warehouse stores it, before any bucketing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEvent {
    pub date: NaiveDate,
    pub package: String,
    pub installer: Option<String>,
    pub python: Option<String>,
    pub system: Option<String>,
    pub file_version: Option<String>,
}

impl DownloadEvent {
    pub fn new(date: NaiveDate, package: impl Into<String>) -> Self {
        Self {
            date,
            package: package.into(),
            installer: None,
            python: None,
            system: None,
            file_version: None,
        }
    }

    pub fn installer(mut self, installer: &str) -> Self {
        self.installer = Some(installer.to_string());
        self
    }

    pub fn python(mut self, python: &str) -> Self {
        self.python = Some(python.to_string());
        self
    }

    pub fn system(mut self, system: &str) -> Self {
        self.system = Some(system.to_string());
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.file_version = Some(version.to_string());
        self
    }

    /// A null installer is an ordinary client, not a mirror.
    pub fn is_mirror(&self) -> bool {
        self.installer
            .as_deref()
            .is_some_and(|installer| MIRRORS.contains(&installer))
    }
}

/// Leading numeric segment of the interpreter version (`3.11.2` -> `3`, `3` -> `3`).
pub fn python_major(raw: Option<&str>) -> String {
    raw.and_then(|value| PYTHON_MAJOR_RE.captures(value.trim()))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string())
}

/// `major.minor` prefix of the interpreter version; a bare major is `unknown`.
pub fn python_minor(raw: Option<&str>) -> String {
    raw.and_then(|value| PYTHON_MINOR_RE.find(value.trim()))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string())
}

pub fn system_bucket(raw: Option<&str>) -> String {
    match raw {
        Some(system) if SYSTEMS.contains(&system) => system.to_string(),
        _ => OTHER_SYSTEM.to_string(),
    }
}

/// Every `(family, category)` cell one event counts toward.
///
/// Mirror downloads only ever reach overall `with_mirrors`.
pub fn classify(event: &DownloadEvent) -> Vec<(Family, String)> {
    let mut cells = vec![(Family::Overall, WITH_MIRRORS.to_string())];
    if event.is_mirror() {
        return cells;
    }
    cells.push((Family::Overall, WITHOUT_MIRRORS.to_string()));
    cells.push((Family::PythonMajor, python_major(event.python.as_deref())));
    cells.push((Family::PythonMinor, python_minor(event.python.as_deref())));
    cells.push((Family::System, system_bucket(event.system.as_deref())));
    cells.push((
        Family::Installer,
        event
            .installer
            .clone()
            .unwrap_or_else(|| Family::Installer.null_category().to_string()),
    ));
    cells.push((
        Family::Version,
        event
            .file_version
            .clone()
            .unwrap_or_else(|| Family::Version.null_category().to_string()),
    ));
    cells
}

/// Six GROUP BY projections over one base event set, shaped like the unioned
/// warehouse result.
pub fn aggregate_events<'a>(
    events: impl IntoIterator<Item = &'a DownloadEvent>,
) -> Vec<WarehouseRow> {
    let mut counts: BTreeMap<(NaiveDate, String, Family, String), i64> = BTreeMap::new();
    for event in events {
        for (family, category) in classify(event) {
            *counts
                .entry((event.date, event.package.clone(), family, category))
                .or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|((date, package, family, category), downloads)| WarehouseRow {
            date: JsonValue::String(date.to_string()),
            package,
            category_label: family.label().to_string(),
            category: Some(category),
            downloads,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("{family} row for {package} has an unrecognized date value {value}")]
    MalformedDate {
        family: Family,
        package: String,
        value: String,
    },
    #[error("{family} row for ({date}, {package}, {category}) has negative downloads {downloads}")]
    NegativeDownloads {
        family: Family,
        date: NaiveDate,
        package: String,
        category: String,
        downloads: i64,
    },
    #[error("{family} row for ({date}, {package}) is outside the queried scope")]
    OutOfScope {
        family: Family,
        date: NaiveDate,
        package: String,
    },
}

type RowKey = (NaiveDate, String, String);

/// Warehouse rows routed into one insert batch per family.
///
/// A bad row fails its own family's batch; the other families are unaffected.
#[derive(Debug, Default)]
pub struct FamilyBatches {
    batches: BTreeMap<Family, Result<Vec<DownloadRecord>, AggregateError>>,
    rows: usize,
    skipped: usize,
}

impl FamilyBatches {
    pub fn from_rows(rows: Vec<WarehouseRow>, scope: &QueryScope) -> Self {
        let total = rows.len();
        let mut skipped = 0;
        let mut sums: BTreeMap<Family, BTreeMap<RowKey, i64>> = BTreeMap::new();
        let mut failures: BTreeMap<Family, AggregateError> = BTreeMap::new();

        for row in rows {
            let Ok(family) = row.category_label.parse::<Family>() else {
                warn!(
                    label = %row.category_label,
                    package = %row.package,
                    "skipping row with unknown category label"
                );
                skipped += 1;
                continue;
            };
            if failures.contains_key(&family) {
                continue;
            }
            match route_row(family, row, scope) {
                Ok((key, downloads)) => {
                    let cell = sums.entry(family).or_default().entry(key).or_default();
                    *cell = cell.saturating_add(downloads);
                }
                Err(err) => {
                    warn!(%family, error = %err, "rejecting family batch");
                    failures.insert(family, err);
                }
            }
        }

        let batches = Family::ALL
            .into_iter()
            .map(|family| {
                let batch = match failures.remove(&family) {
                    Some(err) => Err(err),
                    None => Ok(sums
                        .remove(&family)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|((date, package, category), downloads)| {
                            DownloadRecord::new(date, package, category, downloads)
                        })
                        .collect()),
                };
                (family, batch)
            })
            .collect();

        Self {
            batches,
            rows: total,
            skipped,
        }
    }

    /// Warehouse rows received, including skipped ones.
    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn get(&self, family: Family) -> Option<&Result<Vec<DownloadRecord>, AggregateError>> {
        self.batches.get(&family)
    }

    /// Move one family's batch out; a family with no rows yields an empty batch.
    pub fn take(&mut self, family: Family) -> Result<Vec<DownloadRecord>, AggregateError> {
        self.batches.remove(&family).unwrap_or_else(|| Ok(Vec::new()))
    }
}

fn route_row(
    family: Family,
    row: WarehouseRow,
    scope: &QueryScope,
) -> Result<(RowKey, i64), AggregateError> {
    let Some(date) = normalize_date(&row.date) else {
        return Err(AggregateError::MalformedDate {
            family,
            package: row.package,
            value: row.date.to_string(),
        });
    };
    if !scope.covers(date, &row.package) {
        return Err(AggregateError::OutOfScope {
            family,
            date,
            package: row.package,
        });
    }
    let category = row
        .category
        .unwrap_or_else(|| family.null_category().to_string());
    if row.downloads < 0 {
        return Err(AggregateError::NegativeDownloads {
            family,
            date,
            package: row.package,
            category,
            downloads: row.downloads,
        });
    }
    Ok(((date, row.package, category), row.downloads))
}

/// Reconcile the date shapes warehouse drivers produce into a calendar day.
///
/// Accepts `YYYY-MM-DD`, datetime strings, `{ "value": .. }` wrappers,
/// `{ year, month, day }` structs, `{ seconds, nanos }` timestamps and epoch
/// seconds with a fraction (as a number or numeric string). Anything else is
/// `None`; callers must not guess.
pub fn normalize_date(value: &JsonValue) -> Option<NaiveDate> {
    match value {
        JsonValue::String(raw) => parse_date_str(raw),
        JsonValue::Number(number) => number.as_f64().and_then(epoch_date),
        JsonValue::Object(map) => {
            if let Some(inner) = map.get("value") {
                return normalize_date(inner);
            }
            if let (Some(year), Some(month), Some(day)) = (
                map.get("year").and_then(JsonValue::as_i64),
                map.get("month").and_then(JsonValue::as_u64),
                map.get("day").and_then(JsonValue::as_u64),
            ) {
                return NaiveDate::from_ymd_opt(
                    i32::try_from(year).ok()?,
                    u32::try_from(month).ok()?,
                    u32::try_from(day).ok()?,
                );
            }
            if map.contains_key("seconds") || map.contains_key("nanos") {
                let seconds = map.get("seconds").map_or(Some(0.0), json_number)?;
                let nanos = map.get("nanos").map_or(Some(0.0), json_number)?;
                return epoch_date(seconds + nanos / 1e9);
            }
            None
        }
        _ => None,
    }
}

fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(number) => number.as_f64(),
        JsonValue::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn parse_date_str(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc).date_naive());
    }
    let naive = trimmed.strip_suffix(" UTC").unwrap_or(trimmed);
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(ts.date());
        }
    }
    trimmed.parse::<f64>().ok().and_then(epoch_date)
}

fn epoch_date(seconds: f64) -> Option<NaiveDate> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos).map(|ts| ts.date_naive())
}
