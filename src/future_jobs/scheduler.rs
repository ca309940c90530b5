//! Polling dispatcher for deferred jobs.

use super::models::Job;
use super::store::{ClaimedJob, JobStore};
use crate::server::metrics;
use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const NO_HANDLER_ERROR: &str = "no handler registered";

/// Executes the jobs of one action type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    /// Sleep between two bursts.
    pub schedule_cycle: Duration,
    /// Drop job rows once they completed or failed.
    pub delete_after_completion: bool,
    pub requeue_stale_on_start: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_cycle: Duration::from_secs(5),
            delete_after_completion: false,
            requeue_stale_on_start: true,
        }
    }
}

/// Collects handlers, then hands them to a single background worker on [`start`].
///
/// [`start`]: FutureScheduler::start
pub struct FutureScheduler {
    store: Arc<dyn JobStore>,
    settings: SchedulerSettings,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl FutureScheduler {
    pub fn new(store: Arc<dyn JobStore>, settings: SchedulerSettings) -> Self {
        Self {
            store,
            settings,
            handlers: HashMap::new(),
        }
    }

    pub fn add_handler(&mut self, action_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let action_type = action_type.into();
        if self.handlers.insert(action_type.clone(), handler).is_some() {
            warn!("Replaced handler for action type {}", action_type);
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    /// Spawns the worker. The handler table is frozen from here on.
    pub fn start(self) -> SchedulerHandle {
        let shutdown_token = CancellationToken::new();
        info!(
            "Starting future jobs scheduler with {} handlers, cycle {:?}",
            self.handlers.len(),
            self.settings.schedule_cycle
        );
        let worker = Worker {
            store: self.store,
            settings: self.settings,
            handlers: self.handlers,
            shutdown_token: shutdown_token.clone(),
        };
        SchedulerHandle {
            shutdown_token,
            worker: tokio::spawn(worker.run()),
        }
    }
}

pub struct SchedulerHandle {
    shutdown_token: CancellationToken,
    worker: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals the worker and waits for it. A job already being handled runs to the end.
    pub async fn stop(self) {
        self.shutdown_token.cancel();
        if let Err(e) = self.worker.await {
            error!("Future jobs worker ended abnormally: {}", e);
        }
    }
}

struct Worker {
    store: Arc<dyn JobStore>,
    settings: SchedulerSettings,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    shutdown_token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        if self.settings.requeue_stale_on_start {
            if let Err(e) = self.store.requeue_stale() {
                error!("Failed to requeue stale jobs: {}", e);
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.schedule_cycle) => {}
            }
            let processed = self.run_burst().await;
            if processed > 0 {
                debug!("Burst processed {} jobs", processed);
            }
        }
        info!("Future jobs scheduler stopped");
    }

    async fn run_burst(&self) -> usize {
        let mut processed = 0;
        while !self.shutdown_token.is_cancelled() {
            match self.store.run_next(false) {
                Ok(Some(claimed)) => {
                    self.process(claimed).await;
                    processed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to fetch next job: {}", e);
                    break;
                }
            }
        }
        processed
    }

    async fn process(&self, claimed: ClaimedJob) {
        let ClaimedJob { job, transaction } = claimed;

        let Some(transaction) = transaction else {
            warn!("Job {} was handed out without a claim, canceling it", job.id);
            if let Err(e) = self.store.cancel(job.id) {
                error!("Failed to cancel job {}: {}", job.id, e);
            }
            metrics::record_future_job(&job.action_type, "canceled", Duration::ZERO);
            return;
        };

        let start_time = Instant::now();
        let outcome = match self.handlers.get(&job.action_type) {
            Some(handler) => invoke(Arc::clone(handler), job.clone()).await,
            None => {
                warn!(
                    "No handler registered for action type {} (job {})",
                    job.action_type, job.id
                );
                Err(NO_HANDLER_ERROR.to_string())
            }
        };
        let elapsed = start_time.elapsed();

        let (settled, outcome_label) = match &outcome {
            Ok(()) => {
                info!(
                    "Job {} ({}) completed in {:?}",
                    job.id, job.action_type, elapsed
                );
                (transaction.complete(), "completed")
            }
            Err(message) => {
                warn!("Job {} ({}) failed: {}", job.id, job.action_type, message);
                (transaction.fail(message), "failed")
            }
        };
        if let Err(e) = settled {
            error!("Failed to record outcome of job {}: {}", job.id, e);
        }
        metrics::record_future_job(&job.action_type, outcome_label, elapsed);

        if self.settings.delete_after_completion {
            if let Err(e) = self.store.delete_permanently(job.id) {
                error!("Failed to delete job {}: {}", job.id, e);
            }
        }
    }
}

/// Runs the handler on its own task so a panic surfaces as a join error.
async fn invoke(handler: Arc<dyn JobHandler>, job: Job) -> Result<(), String> {
    let task = tokio::spawn(async move { handler.handle(&job).await });
    match task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(e) if e.is_panic() => Err(format!("Task panic: {}", panic_message(e.into_panic()))),
        Err(e) => Err(format!("Task failed: {}", e)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
