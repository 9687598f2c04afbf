use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::{
    aggregate_events, DownloadEvent, QueryScope, Warehouse, WarehouseError, WarehouseResult,
    WarehouseRow,
};

/// Holds one warehouse call open until the test releases it.
#[derive(Debug, Default)]
pub struct QueryGate {
    entered: Notify,
    release: Notify,
}

impl QueryGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once the gated call is in flight.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.release.notify_one();
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<DownloadEvent>,
    raw_rows: Vec<WarehouseRow>,
    calls: Vec<QueryScope>,
    failure: Option<String>,
    gate: Option<Arc<QueryGate>>,
}

/// In-process warehouse that aggregates seeded events the same way the
/// BigQuery projection does, and records every scope it was asked for.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = DownloadEvent>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                events: events.into_iter().collect(),
                ..MemoryState::default()
            }),
        }
    }

    pub async fn push_events(&self, events: impl IntoIterator<Item = DownloadEvent>) {
        self.state.lock().await.events.extend(events);
    }

    /// Rows returned verbatim by every call, regardless of scope.
    pub async fn push_raw_rows(&self, rows: impl IntoIterator<Item = WarehouseRow>) {
        self.state.lock().await.raw_rows.extend(rows);
    }

    pub async fn fail_with(&self, message: &str) {
        self.state.lock().await.failure = Some(message.to_string());
    }

    pub async fn clear_failure(&self) {
        self.state.lock().await.failure = None;
    }

    /// Gate the next call only.
    pub async fn gate_next_call(&self, gate: Arc<QueryGate>) {
        self.state.lock().await.gate = Some(gate);
    }

    pub async fn calls(&self) -> Vec<QueryScope> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls.len()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn query(&self, scope: &QueryScope) -> WarehouseResult<Vec<WarehouseRow>> {
        let (gate, outcome) = {
            let mut state = self.state.lock().await;
            state.calls.push(scope.clone());
            let outcome = match &state.failure {
                Some(message) => Err(WarehouseError::Unavailable(message.clone())),
                None => {
                    let mut rows = aggregate_events(
                        state
                            .events
                            .iter()
                            .filter(|event| scope.covers(event.date, &event.package)),
                    );
                    rows.extend(state.raw_rows.iter().cloned());
                    Ok(rows)
                }
            };
            (state.gate.take(), outcome)
        };

        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        outcome
    }
}
