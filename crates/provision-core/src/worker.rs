//! Background worker draining due provisioning jobs.

use crate::engine::ProvisioningEngine;
use crate::types::JobOutcome;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between due-job scans (milliseconds)
    pub poll_interval_ms: u64,

    /// Maximum jobs executing at once
    pub max_concurrency: usize,

    /// Maximum job ids fetched per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            max_concurrency: 8,
            batch_size: 64,
        }
    }
}

/// Polls the job store on an interval and whenever the engine signals new work,
/// running each due job on its own task under a concurrency bound.
pub struct ProvisioningWorker {
    engine: Arc<ProvisioningEngine>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ProvisioningWorker {
    pub fn new(engine: Arc<ProvisioningEngine>, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            engine,
            config,
            permits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run until `shutdown` flips to true, then wait for in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let wake = self.engine.wake_handle();
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms.max(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            max_concurrency = self.config.max_concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Provisioning worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.dispatch_due().await;
        }

        self.drain().await;
        tracing::info!("Provisioning worker stopped");
    }

    /// Dispatch every currently due job and wait for all of them to finish.
    pub async fn run_once(&self) -> usize {
        let dispatched = self.dispatch_due().await;
        self.drain().await;
        dispatched
    }

    async fn dispatch_due(&self) -> usize {
        let due = match self.engine.due_jobs(self.config.batch_size).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Due job scan failed");
                return 0;
            }
        };

        let mut dispatched = 0;
        for job_id in due {
            if !self.mark_in_flight(&job_id) {
                continue;
            }
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.clear_in_flight(&job_id);
                    break;
                }
            };

            let engine = self.engine.clone();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                match engine.run_job(&job_id).await {
                    Ok(outcome) => log_outcome(&outcome),
                    Err(e) if e.is_lease_conflict() => {
                        tracing::debug!(job_id = %job_id, "Job leased elsewhere, skipping");
                    }
                    Err(e) => tracing::error!(job_id = %job_id, error = %e, "Job run failed"),
                }
                if let Ok(mut guard) = in_flight.lock() {
                    guard.remove(&job_id);
                }
                drop(permit);
            });
            dispatched += 1;
        }
        dispatched
    }

    /// Wait until every permit is back, i.e. no job task is running.
    async fn drain(&self) {
        let total = self.config.max_concurrency.max(1) as u32;
        if let Ok(all) = self.permits.acquire_many(total).await {
            drop(all);
        }
    }

    fn mark_in_flight(&self, job_id: &str) -> bool {
        match self.in_flight.lock() {
            Ok(mut guard) => guard.insert(job_id.to_string()),
            Err(_) => false,
        }
    }

    fn clear_in_flight(&self, job_id: &str) {
        if let Ok(mut guard) = self.in_flight.lock() {
            guard.remove(job_id);
        }
    }
}

fn log_outcome(outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Succeeded { .. } | JobOutcome::RetryScheduled { .. } | JobOutcome::Dead { .. } => {
            tracing::debug!(job_id = outcome.job_id(), ?outcome, "Job run finished");
        }
        JobOutcome::Deferred { .. } | JobOutcome::AlreadyTerminal { .. } => {
            tracing::trace!(job_id = outcome.job_id(), "Job not runnable");
        }
    }
}
