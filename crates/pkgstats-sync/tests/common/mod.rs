#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use pkgstats_core::{FixedClock, PackageName};
use pkgstats_storage::{FreshnessCache, MemoryCache, MemoryDownloadStore, MemoryLockService};
use pkgstats_sync::EtlService;
use pkgstats_warehouse::{DownloadEvent, MemoryWarehouse};

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn pkg(name: &str) -> PackageName {
    PackageName::parse(name).unwrap()
}

pub struct Harness {
    pub warehouse: Arc<MemoryWarehouse>,
    pub store: Arc<MemoryDownloadStore>,
    pub locks: Arc<MemoryLockService>,
    pub cache: Arc<MemoryCache>,
    pub service: Arc<EtlService>,
}

pub fn harness(today: NaiveDate) -> Harness {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let store = Arc::new(MemoryDownloadStore::new());
    let locks = Arc::new(MemoryLockService::new());
    let cache = Arc::new(MemoryCache::new());
    let service = Arc::new(EtlService::new(
        warehouse.clone(),
        store.clone(),
        locks.clone(),
        FreshnessCache::new(cache.clone()),
        Arc::new(FixedClock(today)),
    ));
    Harness {
        warehouse,
        store,
        locks,
        cache,
        service,
    }
}

/// `count` ordinary pip downloads on Linux / CPython 3.12.
pub fn pip_downloads(date: NaiveDate, package: &str, count: usize) -> Vec<DownloadEvent> {
    (0..count)
        .map(|_| {
            DownloadEvent::new(date, package)
                .installer("pip")
                .python("3.12.1")
                .system("Linux")
                .version("1.0.0")
        })
        .collect()
}
