//! Sync service: owns the status lock and makes sure at most one cycle runs.
//!
//! Callers either `trigger_sync` (spawns the cycle on its own task and
//! returns immediately) or `run_now` (awaits it in place). A second request
//! while a cycle is active is rejected, never queued.

use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::CatalogCache;
use crate::error::StepFailure;
use crate::model::{StatusError, SyncReport, SyncStatus, SyncStep};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Accepted { run_id: Uuid },
    AlreadyRunning,
}

struct Inner {
    orchestrator: Orchestrator,
    status: RwLock<SyncStatus>,
}

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Inner>,
}

impl SyncService {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                status: RwLock::new(SyncStatus::default()),
            }),
        }
    }

    fn status_mut(&self) -> RwLockWriteGuard<'_, SyncStatus> {
        self.inner
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> SyncStatus {
        self.inner
            .status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn catalog(&self) -> Arc<CatalogCache> {
        self.inner.orchestrator.catalog().clone()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    fn try_begin(&self) -> Option<Uuid> {
        let mut status = self.status_mut();
        if status.running {
            return None;
        }
        status.running = true;
        status.current_step = SyncStep::Idle;
        Some(Uuid::new_v4())
    }

    /// Start a cycle in the background.
    pub fn trigger_sync(&self) -> TriggerOutcome {
        let Some(run_id) = self.try_begin() else {
            warn!("sync requested while a cycle is running");
            return TriggerOutcome::AlreadyRunning;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.execute(run_id).await;
        });
        TriggerOutcome::Accepted { run_id }
    }

    /// Run a cycle on the current task. `None` if one is already active.
    pub async fn run_now(&self) -> Option<Result<SyncReport, StepFailure>> {
        let run_id = self.try_begin()?;
        Some(self.execute(run_id).await)
    }

    async fn execute(&self, run_id: Uuid) -> Result<SyncReport, StepFailure> {
        info!(%run_id, "sync cycle started");
        let on_step = |step: SyncStep| self.status_mut().current_step = step;
        let result = self.inner.orchestrator.run_cycle(run_id, &on_step).await;

        let mut status = self.status_mut();
        status.running = false;
        status.current_step = SyncStep::Idle;
        status.last_run = Some(Utc::now());
        match &result {
            Ok(report) => {
                status.last_result = Some(report.clone());
                status.error = None;
            }
            Err(failure) => {
                error!(%run_id, step = %failure.step, error = %failure.error, "sync cycle failed");
                status.error = Some(StatusError {
                    step: failure.step,
                    kind: failure.error.kind().to_string(),
                    message: failure.error.to_string(),
                });
            }
        }
        result
    }
}
