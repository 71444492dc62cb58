//! # Delay Monitor
//!
//! Periodic tick that resumes delayed workflows whose delay has run out.
//! Runs under the `delayed_workflows` lock; the resume itself goes through
//! the engine, so it is serialised with every other trigger on the same
//! workflow and re-checks expiry against the stored delay.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::workflow_engine::WorkflowEngine;
use crate::config::ReconcilerConfig;
use crate::constants::locks;
use crate::error::WorkflowResult;
use crate::logging::log_reconciliation;
use crate::services::lock::PeriodicLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelaySummary {
    pub skipped: bool,
    pub expired: usize,
    pub resumed: usize,
    pub failed: usize,
}

pub struct DelayMonitor {
    config: ReconcilerConfig,
    engine: Arc<WorkflowEngine>,
    lock: Arc<dyn PeriodicLock>,
}

impl DelayMonitor {
    pub fn new(config: ReconcilerConfig, engine: Arc<WorkflowEngine>, lock: Arc<dyn PeriodicLock>) -> Self {
        Self { config, engine, lock }
    }

    #[instrument(skip(self))]
    pub async fn tick(&self) -> WorkflowResult<DelaySummary> {
        if !self
            .lock
            .try_acquire(locks::DELAYED_WORKFLOWS, self.config.lock_ttl())
            .await?
        {
            debug!("Delay scan already running elsewhere");
            return Ok(DelaySummary {
                skipped: true,
                ..DelaySummary::default()
            });
        }

        let result = self.resume_expired().await;
        if let Err(e) = self.lock.release(locks::DELAYED_WORKFLOWS).await {
            warn!(error = %e, "Failed to release delay lock");
        }

        let summary = result?;
        log_reconciliation("delay_monitor", summary.expired, summary.resumed, None);
        Ok(summary)
    }

    async fn resume_expired(&self) -> WorkflowResult<DelaySummary> {
        let now = self.engine.clock().now();
        let expired = self
            .engine
            .store()
            .find_expired_delays(now, self.config.batch_size)
            .await?;
        let mut summary = DelaySummary {
            expired: expired.len(),
            ..DelaySummary::default()
        };

        for workflow_id in expired {
            match self.engine.resume_expired(workflow_id).await {
                Ok(aggregate) if aggregate.workflow.is_running() || aggregate.workflow.is_finished() => {
                    summary.resumed += 1
                }
                Ok(_) => {}
                Err(e) => {
                    summary.failed += 1;
                    warn!(%workflow_id, error = %e, "Failed to resume delayed workflow");
                }
            }
        }
        Ok(summary)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Delay monitor disabled");
            return;
        }
        info!(interval_seconds = self.config.interval_seconds, "Starting delay monitor");

        while !*shutdown.borrow() {
            if let Err(e) = self.tick().await {
                error!(error = %e, "Delay monitor tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {},
                changed = shutdown.changed() => {
                    debug!("Shutdown notification received");
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Delay monitor stopped");
    }
}
