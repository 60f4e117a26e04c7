//! In-memory sheet writer for tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::{SheetTable, SheetWriter, SyncError, SyncTarget, WriteSummary};

#[derive(Default)]
pub struct InMemorySheetWriter {
    sheets: Mutex<HashMap<SyncTarget, SheetTable>>,
    failures: Mutex<VecDeque<SyncError>>,
    attempts: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl InMemorySheetWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes wait for a permit on the returned semaphore before completing.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let writer = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (writer, gate)
    }

    /// Fail the next attempts with these errors, in order.
    pub fn fail_with(&self, errors: impl IntoIterator<Item = SyncError>) {
        self.failures.lock().extend(errors);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn contents(&self, target: &SyncTarget) -> Option<SheetTable> {
        self.sheets.lock().get(target).cloned()
    }
}

#[async_trait]
impl SheetWriter for InMemorySheetWriter {
    async fn replace_contents(
        &self,
        target: &SyncTarget,
        table: &SheetTable,
    ) -> Result<WriteSummary, SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| SyncError::Unavailable("gate closed".into()))?;
            permit.forget();
        }

        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let mut sheets = self.sheets.lock();
        let created_sheet = !sheets.contains_key(target);
        sheets.insert(target.clone(), table.clone());
        Ok(WriteSummary {
            sheet_id: 0,
            rows_written: table.row_count(),
            columns: table.column_count(),
            created_sheet,
        })
    }
}
