//! Per-target run state.
//!
//! [`RunRegistry::try_begin`] is the only way to start a run. It moves the
//! target to `Running` atomically and hands back a [`RunGuard`]; a second
//! caller for the same target is turned away until the guard is finished or
//! dropped. A dropped guard records `Failed`, so a cancelled or panicked run
//! cannot leave its target stuck in `Running`.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::sheets::SyncTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Last known state of a target.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub state: RunState,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RunRecord {
    fn idle(target: &SyncTarget) -> Self {
        Self {
            spreadsheet_id: target.spreadsheet_id.clone(),
            sheet_name: target.sheet_name.clone(),
            state: RunState::Idle,
            run_id: None,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }
}

/// A run for the target is already in flight.
#[derive(Debug, Clone, thiserror::Error)]
#[error("a run for {target} is already in progress (run {run_id}, started {started_at})")]
pub struct AlreadyRunning {
    pub target: SyncTarget,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Counts of targets by state, for health output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Shared, cloneable registry of run state keyed by target.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    inner: Arc<Mutex<HashMap<SyncTarget, RunRecord>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `target` to `Running` unless a run for it is already in flight.
    pub fn try_begin(&self, target: &SyncTarget) -> Result<RunGuard, AlreadyRunning> {
        let mut runs = self.inner.lock();
        let record = runs
            .entry(target.clone())
            .or_insert_with(|| RunRecord::idle(target));

        if record.state == RunState::Running
            && let (Some(run_id), Some(started_at)) = (record.run_id, record.started_at)
        {
            return Err(AlreadyRunning {
                target: target.clone(),
                run_id,
                started_at,
            });
        }

        let run_id = Uuid::new_v4();
        record.state = RunState::Running;
        record.run_id = Some(run_id);
        record.started_at = Some(Utc::now());
        record.finished_at = None;
        record.last_error = None;

        Ok(RunGuard {
            registry: self.clone(),
            target: target.clone(),
            run_id,
            finished: false,
        })
    }

    /// State of one target; `None` if it has never run in this process.
    pub fn get(&self, target: &SyncTarget) -> Option<RunRecord> {
        self.inner.lock().get(target).cloned()
    }

    /// Every known target, ordered by spreadsheet then sheet.
    pub fn list(&self) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self.inner.lock().values().cloned().collect();
        records.sort_by(|a, b| {
            (&a.spreadsheet_id, &a.sheet_name).cmp(&(&b.spreadsheet_id, &b.sheet_name))
        });
        records
    }

    pub fn counts(&self) -> RunCounts {
        let runs = self.inner.lock();
        let mut counts = RunCounts::default();
        for record in runs.values() {
            match record.state {
                RunState::Running => counts.running += 1,
                RunState::Succeeded => counts.succeeded += 1,
                RunState::Failed => counts.failed += 1,
                RunState::Idle => {}
            }
        }
        counts
    }

    fn finish(&self, target: &SyncTarget, run_id: Uuid, state: RunState, error: Option<String>) {
        let mut runs = self.inner.lock();
        // Only the run that owns the record may close it.
        if let Some(record) = runs.get_mut(target)
            && record.run_id == Some(run_id)
        {
            record.state = state;
            record.finished_at = Some(Utc::now());
            record.last_error = error;
        }
    }
}

/// Ownership of a target's running state. Finish it with [`succeed`] or
/// [`fail`]; dropping it unfinished records a failure.
///
/// [`succeed`]: RunGuard::succeed
/// [`fail`]: RunGuard::fail
#[derive(Debug)]
pub struct RunGuard {
    registry: RunRegistry,
    target: SyncTarget,
    run_id: Uuid,
    finished: bool,
}

impl RunGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn succeed(mut self) {
        self.finished = true;
        self.registry
            .finish(&self.target, self.run_id, RunState::Succeeded, None);
    }

    pub fn fail(mut self, error: impl Into<String>) {
        self.finished = true;
        self.registry
            .finish(&self.target, self.run_id, RunState::Failed, Some(error.into()));
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(sync_target = %self.target, run_id = %self.run_id, "Run ended without completing");
            self.registry.finish(
                &self.target,
                self.run_id,
                RunState::Failed,
                Some("run was cancelled before completing".into()),
            );
        }
    }
}
