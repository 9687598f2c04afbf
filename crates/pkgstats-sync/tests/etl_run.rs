mod common;

use common::{d, harness, pip_downloads};
use pkgstats_core::{DownloadRecord, Family, RecentWindow, ALL_PACKAGES};
use pkgstats_sync::{etl_lock_key, EtlOutcome, RunReport, StepResult};
use pkgstats_warehouse::{DownloadEvent, QueryGate, WarehouseRow};

fn completed(outcome: EtlOutcome) -> RunReport {
    match outcome {
        EtlOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

async fn snapshot(h: &common::Harness) -> Vec<Vec<DownloadRecord>> {
    let mut tables = Vec::new();
    for family in Family::ALL {
        tables.push(h.store.rows(family).await);
    }
    tables
}

#[tokio::test]
async fn rerunning_a_day_reproduces_identical_rows() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.push_events(pip_downloads(day, "requests", 3)).await;
    h.warehouse.push_events(pip_downloads(day, "numpy", 2)).await;

    let first = completed(h.service.run(None, true).await.unwrap());
    assert!(first.marked_processed);
    let after_first = snapshot(&h).await;
    let recent_first = h.store.recent_rows().await;

    // Wiping the cache drops the processed marker, forcing a genuine second run.
    h.cache.clear().await;
    let second = completed(h.service.run(Some(day), true).await.unwrap());
    assert!(second.marked_processed);

    assert_eq!(snapshot(&h).await, after_first);
    assert_eq!(h.store.recent_rows().await, recent_first);
    assert_eq!(h.warehouse.call_count().await, 2);
}

#[tokio::test]
async fn concurrent_runs_for_one_date_query_the_warehouse_once() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.push_events(pip_downloads(day, "requests", 1)).await;
    let gate = QueryGate::new();
    h.warehouse.gate_next_call(gate.clone()).await;

    let first = {
        let service = h.service.clone();
        tokio::spawn(async move { service.run(Some(day), true).await })
    };
    gate.wait_entered().await;

    let second = h.service.run(Some(day), true).await.unwrap();
    assert!(matches!(second, EtlOutcome::Locked { date } if date == day));

    gate.open();
    let first = completed(first.await.unwrap().unwrap());
    assert!(first.marked_processed);
    assert_eq!(h.warehouse.call_count().await, 1);
    assert!(!h.locks.is_held(&etl_lock_key(day)).await);
}

#[tokio::test]
async fn processed_date_is_skipped_without_querying() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.push_events(pip_downloads(day, "requests", 1)).await;

    completed(h.service.run(Some(day), true).await.unwrap());
    let again = h.service.run(Some(day), true).await.unwrap();

    assert!(matches!(again, EtlOutcome::Skipped { date } if date == day));
    assert_eq!(h.warehouse.call_count().await, 1);
}

#[tokio::test]
async fn rollup_sums_real_packages_per_category() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.push_events(pip_downloads(day, "requests", 3)).await;
    h.warehouse.push_events(pip_downloads(day, "numpy", 2)).await;
    h.warehouse
        .push_events([DownloadEvent::new(day, "numpy").installer("bandersnatch")])
        .await;

    let report = completed(h.service.run(Some(day), false).await.unwrap());
    assert!(report.rollups.values().all(StepResult::is_ok));

    let overall_all: Vec<_> = h
        .store
        .rows(Family::Overall)
        .await
        .into_iter()
        .filter(DownloadRecord::is_all_packages)
        .collect();
    assert_eq!(
        overall_all,
        vec![
            DownloadRecord::new(day, ALL_PACKAGES, "with_mirrors", 6),
            DownloadRecord::new(day, ALL_PACKAGES, "without_mirrors", 5),
        ]
    );

    // A second rollup must not fold the existing __all__ rows into the sum.
    h.cache.clear().await;
    completed(h.service.run(Some(day), false).await.unwrap());
    let system_all: Vec<_> = h
        .store
        .rows(Family::System)
        .await
        .into_iter()
        .filter(DownloadRecord::is_all_packages)
        .collect();
    assert_eq!(system_all, vec![DownloadRecord::new(day, ALL_PACKAGES, "Linux", 5)]);
}

#[tokio::test]
async fn recent_windows_are_anchored_on_the_run_date() {
    let h = harness(d(2026, 5, 2));
    let anchor = d(2026, 5, 1);
    h.store
        .seed(
            Family::Overall,
            [
                DownloadRecord::new(d(2026, 4, 20), "requests", "without_mirrors", 10),
                DownloadRecord::new(d(2026, 3, 1), "requests", "without_mirrors", 1000),
            ],
        )
        .await;
    h.warehouse.push_events(pip_downloads(anchor, "requests", 4)).await;

    let report = completed(h.service.run(Some(anchor), false).await.unwrap());
    assert!(report.recent.values().all(StepResult::is_ok));

    let recent: Vec<_> = h
        .store
        .recent_rows()
        .await
        .into_iter()
        .filter(|row| row.package == "requests")
        .map(|row| (row.category, row.downloads))
        .collect();
    assert_eq!(
        recent,
        vec![
            (RecentWindow::Day, 4),
            (RecentWindow::Week, 4),
            (RecentWindow::Month, 14),
        ]
    );
}

#[tokio::test]
async fn retention_removes_rows_past_the_horizon_only() {
    let today = d(2026, 7, 1);
    let h = harness(today);
    let yesterday = d(2026, 6, 30);
    let day_179 = today - chrono::Days::new(179);
    let day_180 = today - chrono::Days::new(180);
    let day_181 = today - chrono::Days::new(181);
    for family in Family::ALL {
        h.store
            .seed(
                family,
                [
                    DownloadRecord::new(day_179, "requests", "x", 1),
                    DownloadRecord::new(day_180, "requests", "x", 1),
                    DownloadRecord::new(day_181, "requests", "x", 1),
                ],
            )
            .await;
    }
    h.warehouse.push_events(pip_downloads(yesterday, "requests", 1)).await;

    let report = completed(h.service.run(None, true).await.unwrap());
    let purge = report.purge.expect("purge requested");
    assert_eq!(purge.len(), Family::ALL.len());
    assert!(purge.values().all(|step| *step == StepResult::Ok { rows: 1 }));

    for family in Family::ALL {
        let dates: Vec<_> = h.store.rows(family).await.into_iter().map(|r| r.date).collect();
        assert!(dates.contains(&day_179), "{family} lost day 179");
        assert!(dates.contains(&day_180), "{family} lost day 180");
        assert!(!dates.contains(&day_181), "{family} kept day 181");
    }
}

#[tokio::test]
async fn no_purge_leaves_old_rows_and_reports_none() {
    let today = d(2026, 7, 1);
    let h = harness(today);
    let ancient = today - chrono::Days::new(400);
    h.store
        .seed(Family::Version, [DownloadRecord::new(ancient, "requests", "0.1", 1)])
        .await;
    h.warehouse.push_events(pip_downloads(d(2026, 6, 30), "requests", 1)).await;

    let report = completed(h.service.run(None, false).await.unwrap());
    assert!(report.purge.is_none());
    assert!(h.store.rows(Family::Version).await.iter().any(|r| r.date == ancient));
}

#[tokio::test]
async fn null_system_and_bare_python_major_fall_back() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse
        .push_events([DownloadEvent::new(day, "requests").installer("pip").python("3")])
        .await;

    completed(h.service.run(Some(day), false).await.unwrap());

    let categories = |rows: Vec<DownloadRecord>| -> Vec<String> {
        rows.into_iter()
            .filter(|r| r.package == "requests")
            .map(|r| r.category)
            .collect()
    };
    assert_eq!(categories(h.store.rows(Family::System).await), vec!["other"]);
    assert_eq!(categories(h.store.rows(Family::PythonMajor).await), vec!["3"]);
    assert_eq!(categories(h.store.rows(Family::PythonMinor).await), vec!["unknown"]);
    assert_eq!(categories(h.store.rows(Family::Version).await), vec!["unknown"]);
}

#[tokio::test]
async fn failed_family_is_isolated_and_date_stays_unmarked() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.push_events(pip_downloads(day, "requests", 2)).await;
    h.store.fail_family(Family::System).await;

    let report = completed(h.service.run(Some(day), false).await.unwrap());
    assert!(matches!(report.downloads[&Family::System], StepResult::Failed { .. }));
    assert!(matches!(report.rollups[&Family::System], StepResult::Failed { .. }));
    for family in Family::ALL.into_iter().filter(|f| *f != Family::System) {
        assert!(report.downloads[&family].is_ok(), "{family} should have succeeded");
    }
    assert!(!report.marked_processed);
    assert!(!h.store.rows(Family::Overall).await.is_empty());

    h.store.restore(Family::System).await;
    let retry = completed(h.service.run(Some(day), false).await.unwrap());
    assert!(retry.marked_processed);
    assert!(!h.store.rows(Family::System).await.is_empty());
}

#[tokio::test]
async fn malformed_dates_fail_their_family_batch() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.push_events(pip_downloads(day, "requests", 1)).await;
    h.warehouse
        .push_raw_rows([WarehouseRow {
            date: serde_json::json!({ "when": "2026-05-01" }),
            package: "requests".into(),
            category_label: "installer".into(),
            category: Some("uv".into()),
            downloads: 1,
        }])
        .await;

    let report = completed(h.service.run(Some(day), false).await.unwrap());
    assert!(matches!(report.downloads[&Family::Installer], StepResult::Failed { .. }));
    assert!(report.downloads[&Family::Overall].is_ok());
    assert!(!report.marked_processed);
}

#[tokio::test]
async fn warehouse_failure_propagates_and_releases_the_lock() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.fail_with("quota exceeded").await;

    let err = h.service.run(Some(day), true).await.unwrap_err();
    assert!(format!("{err:#}").contains("quota exceeded"));
    assert!(!h.locks.is_held(&etl_lock_key(day)).await);
    assert!(!h.service.cache().is_processed(day).await);

    h.warehouse.clear_failure().await;
    h.warehouse.push_events(pip_downloads(day, "requests", 1)).await;
    assert!(completed(h.service.run(Some(day), true).await.unwrap()).marked_processed);
}

#[tokio::test]
async fn report_serializes_with_family_keys() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.push_events(pip_downloads(day, "requests", 1)).await;

    let outcome = h.service.run(Some(day), true).await.unwrap();
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["status"], "completed");
    assert_eq!(json["downloads"]["python_minor"]["status"], "ok");
    assert_eq!(json["recent"]["month"]["status"], "ok");
    assert_eq!(json["marked_processed"], true);
}

#[tokio::test]
async fn recent_and_purge_failures_do_not_block_the_marker() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.push_events(pip_downloads(day, "requests", 1)).await;
    h.store.fail_recent().await;
    h.store.fail_purge(Family::Version).await;

    let report = completed(h.service.run(Some(day), true).await.unwrap());

    assert!(report.recent.values().all(|step| !step.is_ok()));
    let purge = report.purge.expect("purge requested");
    assert!(matches!(purge[&Family::Version], StepResult::Failed { .. }));
    assert!(purge[&Family::Overall].is_ok());
    assert!(report.marked_processed);
    assert!(h.service.cache().is_processed(day).await);
}

#[tokio::test]
async fn failed_lock_release_is_swallowed() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.warehouse.push_events(pip_downloads(day, "requests", 1)).await;
    h.locks.fail_releases(true);

    let report = completed(h.service.run(Some(day), true).await.unwrap());

    assert!(report.marked_processed);
    // Left in place until its TTL runs out.
    assert!(h.locks.is_held(&etl_lock_key(day)).await);
}

#[tokio::test]
async fn lock_service_outage_fails_the_run() {
    let day = d(2026, 5, 1);
    let h = harness(d(2026, 5, 2));
    h.locks.fail_acquires(true);

    let err = h.service.run(Some(day), true).await.unwrap_err();

    assert!(format!("{err:#}").contains("lock service offline"));
    assert_eq!(h.warehouse.call_count().await, 0);
}
