use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use pkgstats_core::{
    Family, MIRRORS, OTHER_SYSTEM, SYSTEMS, UNKNOWN_CATEGORY, WITHOUT_MIRRORS, WITH_MIRRORS,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, Instrument};

use crate::{QueryScope, Warehouse, WarehouseError, WarehouseResult, WarehouseRow};

pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DEFAULT_TABLE: &str = "bigquery-public-data.pypi.file_downloads";

static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+){1,2}$").expect("static regex")
});

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub endpoint: String,
    pub table: String,
    /// OAuth bearer token; `None` for emulators that skip auth.
    pub access_token: Option<String>,
    pub location: Option<String>,
    /// Per HTTP call, including the server-side long poll.
    pub timeout: Duration,
    /// Total time a job may take before the run gives up on it.
    pub job_deadline: Duration,
    pub page_size: u32,
    pub user_agent: Option<String>,
}

impl BigQueryConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            table: DEFAULT_TABLE.to_string(),
            access_token: None,
            location: None,
            timeout: Duration::from_secs(60),
            job_deadline: Duration::from_secs(600),
            page_size: 50_000,
            user_agent: Some(concat!("pkgstats/", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }
}

/// BigQuery `jobs.query` client. Submits one parameterized aggregation per
/// call, long-polls until the job completes, then pages through the result.
#[derive(Debug)]
pub struct BigQueryWarehouse {
    client: reqwest::Client,
    config: BigQueryConfig,
}

impl BigQueryWarehouse {
    pub fn new(config: BigQueryConfig) -> anyhow::Result<Self> {
        if config.project_id.trim().is_empty() {
            bail!("bigquery project id is empty");
        }
        if !TABLE_RE.is_match(&config.table) {
            bail!("bigquery table `{}` is not a dotted table reference", config.table);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self { client, config })
    }

    fn queries_url(&self) -> String {
        format!(
            "{}/projects/{}/queries",
            self.config.endpoint.trim_end_matches('/'),
            self.config.project_id
        )
    }

    fn poll_timeout_ms(&self) -> u64 {
        // Leave the HTTP timeout some headroom over the server-side wait.
        let budget = self.config.timeout.saturating_sub(Duration::from_secs(5));
        u64::try_from(budget.as_millis()).unwrap_or(u64::MAX).max(1_000)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> WarehouseResult<QueryResponse> {
        let request = match &self.config.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|parsed| parsed.error.message)
                .unwrap_or(body);
            return Err(WarehouseError::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json::<QueryResponse>().await?)
    }

    async fn submit(&self, sql: &str, scope: &QueryScope) -> WarehouseResult<QueryResponse> {
        let body = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: query_parameters(scope),
            timeout_ms: self.poll_timeout_ms(),
            max_results: self.config.page_size,
            location: self.config.location.as_deref(),
        };
        self.send(self.client.post(self.queries_url()).json(&body))
            .await
    }

    async fn results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> WarehouseResult<QueryResponse> {
        let mut params = vec![
            ("timeoutMs", self.poll_timeout_ms().to_string()),
            ("maxResults", self.config.page_size.to_string()),
        ];
        if let Some(location) = job.location.as_deref().or(self.config.location.as_deref()) {
            params.push(("location", location.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        let url = format!("{}/{}", self.queries_url(), job.job_id);
        self.send(self.client.get(url).query(&params)).await
    }

    async fn run(&self, scope: &QueryScope) -> WarehouseResult<Vec<WarehouseRow>> {
        let sql = build_query(&self.config.table, scope);
        let started = Instant::now();

        let mut response = self.submit(&sql, scope).await?;
        let job = response
            .job_reference
            .clone()
            .ok_or_else(|| WarehouseError::Malformed("response has no jobReference".into()))?;

        while !response.job_complete {
            if started.elapsed() >= self.config.job_deadline {
                return Err(WarehouseError::Deadline {
                    job_id: job.job_id.clone(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            debug!(job_id = %job.job_id, "job still running");
            response = self.results(&job, None).await?;
        }

        let columns = ColumnIndex::from_schema(response.schema.as_ref())?;
        let mut rows = Vec::new();
        columns.decode_into(&response.rows, &mut rows)?;

        let mut page_token = response.page_token.take();
        let mut pages = 1usize;
        while let Some(token) = page_token {
            let page = self.results(&job, Some(&token)).await?;
            columns.decode_into(&page.rows, &mut rows)?;
            page_token = page.page_token;
            pages += 1;
        }

        info!(
            job_id = %job.job_id,
            rows = rows.len(),
            pages,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "warehouse query complete"
        );
        Ok(rows)
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn query(&self, scope: &QueryScope) -> WarehouseResult<Vec<WarehouseRow>> {
        let span = match scope {
            QueryScope::Day { date } => info_span!("warehouse_query", %date),
            QueryScope::Package { package, range } => {
                info_span!("warehouse_query", %package, %range)
            }
        };
        self.run(scope).instrument(span).await
    }
}

/// The unioned six-family aggregation for `scope`, parameterized by
/// `@start_date`, `@end_date` and, for package scopes, `@package`.
pub fn build_query(table: &str, scope: &QueryScope) -> String {
    let mirrors = sql_list(&MIRRORS);
    let package_filter = match scope {
        QueryScope::Day { .. } => "",
        QueryScope::Package { .. } => "\n    AND file.project = @package",
    };

    let projections = projections()
        .into_iter()
        .map(|(family, category, filtered)| {
            let filter = if filtered { "\nWHERE NOT is_mirror" } else { "" };
            format!(
                "SELECT date, package, '{label}' AS category_label, {category} AS category, COUNT(*) AS downloads\nFROM dls{filter}\nGROUP BY date, package, category",
                label = family.label()
            )
        })
        .collect::<Vec<_>>()
        .join("\nUNION ALL\n");

    format!(
        "WITH dls AS (
  SELECT
    DATE(timestamp) AS date,
    file.project AS package,
    file.version AS file_version,
    details.installer.name AS installer,
    details.python AS python_version,
    details.system.name AS system,
    COALESCE(details.installer.name IN ({mirrors}), FALSE) AS is_mirror
  FROM `{table}`
  WHERE timestamp >= TIMESTAMP(@start_date)
    AND timestamp < TIMESTAMP(DATE_ADD(@end_date, INTERVAL 1 DAY)){package_filter}
)
{projections}"
    )
}

/// `(family, category expression, excludes mirrors)` for every projection.
fn projections() -> Vec<(Family, String, bool)> {
    let unknown = sql_literal(UNKNOWN_CATEGORY);
    vec![
        (Family::Overall, sql_literal(WITH_MIRRORS), false),
        (Family::Overall, sql_literal(WITHOUT_MIRRORS), true),
        (
            Family::PythonMajor,
            format!(r"COALESCE(REGEXP_EXTRACT(python_version, r'^([0-9]+)(?:\.|$)'), {unknown})"),
            true,
        ),
        (
            Family::PythonMinor,
            format!(r"COALESCE(REGEXP_EXTRACT(python_version, r'^([0-9]+\.[0-9]+)'), {unknown})"),
            true,
        ),
        (
            Family::System,
            format!(
                "CASE WHEN system IN ({}) THEN system ELSE {} END",
                sql_list(&SYSTEMS),
                sql_literal(OTHER_SYSTEM)
            ),
            true,
        ),
        (
            Family::Installer,
            format!("COALESCE(installer, {unknown})"),
            true,
        ),
        (
            Family::Version,
            format!("COALESCE(file_version, {unknown})"),
            true,
        ),
    ]
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn sql_list(values: &[&str]) -> String {
    values
        .iter()
        .map(|value| sql_literal(value))
        .collect::<Vec<_>>()
        .join(", ")
}

fn query_parameters(scope: &QueryScope) -> Vec<QueryParameter> {
    let range = scope.range();
    let mut params = vec![
        QueryParameter::new("start_date", "DATE", range.start.to_string()),
        QueryParameter::new("end_date", "DATE", range.end.to_string()),
    ];
    if let Some(package) = scope.package_name() {
        params.push(QueryParameter::new("package", "STRING", package.to_string()));
    }
    params
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameter>,
    timeout_ms: u64,
    max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameter {
    name: &'static str,
    parameter_type: ParameterType,
    parameter_value: ParameterValue,
}

impl QueryParameter {
    fn new(name: &'static str, kind: &'static str, value: String) -> Self {
        Self {
            name,
            parameter_type: ParameterType { kind },
            parameter_value: ParameterValue { value },
        }
    }
}

#[derive(Debug, Serialize)]
struct ParameterType {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ParameterValue {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableField>,
}

#[derive(Debug, Deserialize)]
struct TableField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: JsonValue,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Positions of the result columns, resolved once from the response schema.
#[derive(Debug, Clone, Copy)]
struct ColumnIndex {
    date: usize,
    package: usize,
    category_label: usize,
    category: usize,
    downloads: usize,
}

impl ColumnIndex {
    fn from_schema(schema: Option<&TableSchema>) -> WarehouseResult<Self> {
        let schema =
            schema.ok_or_else(|| WarehouseError::Malformed("completed job has no schema".into()))?;
        let position = |name: &str| {
            schema
                .fields
                .iter()
                .position(|field| field.name == name)
                .ok_or_else(|| WarehouseError::Malformed(format!("result has no `{name}` column")))
        };
        Ok(Self {
            date: position("date")?,
            package: position("package")?,
            category_label: position("category_label")?,
            category: position("category")?,
            downloads: position("downloads")?,
        })
    }

    fn decode_into(&self, rows: &[TableRow], out: &mut Vec<WarehouseRow>) -> WarehouseResult<()> {
        out.reserve(rows.len());
        for row in rows {
            out.push(WarehouseRow {
                date: cell(row, self.date)?.clone(),
                package: cell_string(row, self.package, "package")?,
                category_label: cell_string(row, self.category_label, "category_label")?,
                category: cell(row, self.category)?.as_str().map(str::to_string),
                downloads: cell_i64(row, self.downloads)?,
            });
        }
        Ok(())
    }
}

fn cell(row: &TableRow, index: usize) -> WarehouseResult<&JsonValue> {
    row.f
        .get(index)
        .map(|cell| &cell.v)
        .ok_or_else(|| WarehouseError::Malformed(format!("row has no cell {index}")))
}

fn cell_string(row: &TableRow, index: usize, name: &str) -> WarehouseResult<String> {
    cell(row, index)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| WarehouseError::Malformed(format!("`{name}` is not a string")))
}

/// INT64 arrives as a JSON string; tolerate plain numbers too.
fn cell_i64(row: &TableRow, index: usize) -> WarehouseResult<i64> {
    let value = cell(row, index)?;
    let parsed = match value {
        JsonValue::String(raw) => raw.parse().ok(),
        JsonValue::Number(number) => number.as_i64(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        WarehouseError::Malformed(format!("`downloads` value {value} is not an integer"))
    })
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pkgstats_core::{DateRange, PackageName};
    use serde_json::json;

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn day_query_unions_every_family_without_package_filter() {
        let sql = build_query(DEFAULT_TABLE, &QueryScope::day(d(2026, 5, 1)));
        assert_eq!(sql.matches("UNION ALL").count(), 6);
        for family in Family::ALL {
            assert!(sql.contains(&format!("'{}' AS category_label", family.label())));
        }
        assert!(sql.contains("'bandersnatch', 'z3c.pypimirror', 'Artifactory', 'devpi'"));
        assert!(sql.contains("'Windows', 'Linux', 'Darwin'"));
        assert!(!sql.contains("@package"));
        // Only overall with_mirrors keeps mirror traffic.
        assert_eq!(sql.matches("WHERE NOT is_mirror").count(), 6);
    }

    #[test]
    fn package_query_is_scoped_by_parameter() {
        let range = DateRange::new(d(2026, 4, 1), d(2026, 4, 30)).unwrap();
        let scope = QueryScope::package(PackageName::parse("requests").unwrap(), range);
        let sql = build_query(DEFAULT_TABLE, &scope);
        assert!(sql.contains("AND file.project = @package"));
        assert!(!sql.contains("requests"));

        let params = serde_json::to_value(query_parameters(&scope)).unwrap();
        assert_eq!(
            params,
            json!([
                { "name": "start_date", "parameterType": { "type": "DATE" }, "parameterValue": { "value": "2026-04-01" } },
                { "name": "end_date", "parameterType": { "type": "DATE" }, "parameterValue": { "value": "2026-04-30" } },
                { "name": "package", "parameterType": { "type": "STRING" }, "parameterValue": { "value": "requests" } }
            ])
        );
    }

    #[test]
    fn completed_response_rows_decode_by_schema() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "jobReference": { "projectId": "p", "jobId": "job_1", "location": "US" },
            "schema": { "fields": [
                { "name": "date", "type": "DATE" },
                { "name": "package", "type": "STRING" },
                { "name": "category_label", "type": "STRING" },
                { "name": "category", "type": "STRING" },
                { "name": "downloads", "type": "INTEGER" }
            ]},
            "rows": [
                { "f": [{ "v": "2026-05-01" }, { "v": "requests" }, { "v": "system" }, { "v": null }, { "v": "42" }] },
                { "f": [{ "v": "2026-05-01" }, { "v": "requests" }, { "v": "overall" }, { "v": "with_mirrors" }, { "v": 7 }] }
            ],
            "pageToken": "next"
        }))
        .unwrap();

        let columns = ColumnIndex::from_schema(response.schema.as_ref()).unwrap();
        let mut rows = Vec::new();
        columns.decode_into(&response.rows, &mut rows).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, json!("2026-05-01"));
        assert_eq!(rows[0].category, None);
        assert_eq!(rows[0].downloads, 42);
        assert_eq!(rows[1].downloads, 7);
        assert_eq!(response.page_token.as_deref(), Some("next"));
    }

    #[test]
    fn incomplete_response_defaults_to_not_complete() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobReference": { "projectId": "p", "jobId": "job_2" }
        }))
        .unwrap();
        assert!(!response.job_complete);
        assert!(response.rows.is_empty());
    }

    #[test]
    fn missing_columns_and_bad_counts_are_malformed() {
        let schema: TableSchema = serde_json::from_value(json!({
            "fields": [{ "name": "date" }, { "name": "package" }]
        }))
        .unwrap();
        assert!(matches!(
            ColumnIndex::from_schema(Some(&schema)),
            Err(WarehouseError::Malformed(_))
        ));

        let row: TableRow = serde_json::from_value(json!({ "f": [{ "v": "many" }] })).unwrap();
        assert!(matches!(cell_i64(&row, 0), Err(WarehouseError::Malformed(_))));
        assert!(matches!(cell_i64(&row, 3), Err(WarehouseError::Malformed(_))));
    }

    #[test]
    fn config_is_validated() {
        let mut config = BigQueryConfig::new("my-project");
        assert!(BigQueryWarehouse::new(config.clone()).is_ok());

        config.table = "pypi; DROP TABLE x".into();
        assert!(BigQueryWarehouse::new(config).is_err());
        assert!(BigQueryWarehouse::new(BigQueryConfig::new(" ")).is_err());
    }

    #[test]
    fn string_literals_are_escaped() {
        assert_eq!(sql_literal("o'brien"), r"'o\'brien'");
    }
}
