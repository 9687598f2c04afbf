//! Core domain model for package download statistics.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Days, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pkgstats-core";

/// Synthetic package holding the per-category sum across every real package.
pub const ALL_PACKAGES: &str = "__all__";

/// Installers that re-download everything from the index; excluded from every
/// family except overall `with_mirrors`.
pub const MIRRORS: [&str; 4] = ["bandersnatch", "z3c.pypimirror", "Artifactory", "devpi"];

/// Operating systems tracked by name; anything else buckets to `other`.
pub const SYSTEMS: [&str; 3] = ["Windows", "Linux", "Darwin"];

pub const UNKNOWN_CATEGORY: &str = "unknown";
pub const OTHER_SYSTEM: &str = "other";
pub const WITH_MIRRORS: &str = "with_mirrors";
pub const WITHOUT_MIRRORS: &str = "without_mirrors";

/// Rows strictly older than `today - RETENTION_DAYS` are purged.
pub const RETENTION_DAYS: u64 = 180;

/// How far back a package with no persisted history is seeded on first read.
pub const SEED_DAYS: u64 = 30;

/// One category grouping, each backed by its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Overall,
    PythonMajor,
    PythonMinor,
    System,
    Installer,
    Version,
}

impl Family {
    pub const ALL: [Family; 6] = [
        Family::Overall,
        Family::PythonMajor,
        Family::PythonMinor,
        Family::System,
        Family::Installer,
        Family::Version,
    ];

    /// Label used both as the warehouse `category_label` and the table name.
    pub const fn label(self) -> &'static str {
        match self {
            Family::Overall => "overall",
            Family::PythonMajor => "python_major",
            Family::PythonMinor => "python_minor",
            Family::System => "system",
            Family::Installer => "installer",
            Family::Version => "version",
        }
    }

    pub const fn table(self) -> &'static str {
        self.label()
    }

    /// Category substituted when the warehouse reports a null bucket.
    pub const fn null_category(self) -> &'static str {
        match self {
            Family::System => OTHER_SYSTEM,
            _ => UNKNOWN_CATEGORY,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category family `{0}`")]
pub struct UnknownFamily(pub String);

impl FromStr for Family {
    type Err = UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Family::ALL
            .into_iter()
            .find(|family| family.label() == s)
            .ok_or_else(|| UnknownFamily(s.to_string()))
    }
}

/// One persisted row of a family table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub date: NaiveDate,
    pub package: String,
    pub category: String,
    pub downloads: i64,
}

impl DownloadRecord {
    pub fn new(
        date: NaiveDate,
        package: impl Into<String>,
        category: impl Into<String>,
        downloads: i64,
    ) -> Self {
        Self {
            date,
            package: package.into(),
            category: category.into(),
            downloads,
        }
    }

    pub fn is_all_packages(&self) -> bool {
        self.package == ALL_PACKAGES
    }
}

/// Rolling window of the `recent` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecentWindow {
    Day,
    Week,
    Month,
}

impl RecentWindow {
    pub const ALL: [RecentWindow; 3] = [RecentWindow::Day, RecentWindow::Week, RecentWindow::Month];

    pub const fn label(self) -> &'static str {
        match self {
            RecentWindow::Day => "day",
            RecentWindow::Week => "week",
            RecentWindow::Month => "month",
        }
    }

    pub const fn days(self) -> u64 {
        match self {
            RecentWindow::Day => 1,
            RecentWindow::Week => 7,
            RecentWindow::Month => 30,
        }
    }

    /// First day (inclusive) of the window ending on `anchor`.
    pub fn start(self, anchor: NaiveDate) -> NaiveDate {
        anchor
            .checked_sub_days(Days::new(self.days() - 1))
            .unwrap_or(NaiveDate::MIN)
    }
}

impl fmt::Display for RecentWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RecentWindow {
    type Err = UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecentWindow::ALL
            .into_iter()
            .find(|window| window.label() == s)
            .ok_or_else(|| UnknownFamily(s.to_string()))
    }
}

/// Rolling snapshot row; no date, replaced wholesale on every recompute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentDownloadCount {
    pub package: String,
    pub category: RecentWindow,
    pub downloads: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackageNameError {
    #[error("package name is empty")]
    Empty,
    #[error("package name `{0}` is reserved")]
    Reserved(String),
    #[error("package name `{0}` contains invalid characters")]
    InvalidChars(String),
}

static PACKAGE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("static regex"));

/// Validated, normalized user-supplied package identifier.
///
/// Never `__all__`: the synthetic aggregate cannot be requested directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    pub fn normalize(input: &str) -> String {
        input.trim().to_lowercase().replace(['.', '_'], "-")
    }

    pub fn parse(input: &str) -> Result<Self, PackageNameError> {
        if input.trim() == ALL_PACKAGES {
            return Err(PackageNameError::Reserved(ALL_PACKAGES.to_string()));
        }
        let name = Self::normalize(input);
        if name.is_empty() {
            return Err(PackageNameError::Empty);
        }
        if !PACKAGE_NAME_RE.is_match(&name) {
            return Err(PackageNameError::InvalidChars(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PackageName {
    type Err = PackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// Source of "today"; injected so date arithmetic is testable.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;

    /// Newest day the warehouse has complete data for.
    fn yesterday(&self) -> NaiveDate {
        days_before(self.today(), 1)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

pub fn days_before(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(days))
        .unwrap_or(NaiveDate::MIN)
}

pub fn days_after(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days))
        .unwrap_or(NaiveDate::MAX)
}
