//! One audit entry per sync attempt.

use std::sync::Arc;

use chrono::Utc;
use regsync_core::{RunCounters, RunStatus, SyncRun};
use regsync_storage::{RunStore, StoreError};

pub struct RunLedger {
    runs: Arc<dyn RunStore>,
}

impl RunLedger {
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self { runs }
    }

    pub async fn start(&self, resource_id: &str, job_ref: Option<String>) -> Result<SyncRun, StoreError> {
        let run = SyncRun::pending(resource_id, job_ref);
        self.runs.insert_run(&run).await?;
        Ok(run)
    }

    pub async fn done(&self, run: &mut SyncRun, message: String) -> Result<(), StoreError> {
        self.finish(run, RunStatus::Done, Some(message)).await
    }

    pub async fn skipped(&self, run: &mut SyncRun, checksum: String) -> Result<(), StoreError> {
        run.checksum = Some(checksum);
        run.counters = RunCounters::default();
        self.finish(run, RunStatus::Skipped, Some("no new version (checksum unchanged)".into()))
            .await
    }

    pub async fn failed(&self, run: &mut SyncRun, error: String) -> Result<(), StoreError> {
        self.finish(run, RunStatus::Failed, Some(error)).await
    }

    async fn finish(&self, run: &mut SyncRun, status: RunStatus, message: Option<String>) -> Result<(), StoreError> {
        run.status = status;
        run.message = message;
        run.finished_at = Some(Utc::now());
        self.runs.update_run(run).await
    }
}
