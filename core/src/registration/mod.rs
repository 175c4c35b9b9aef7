//! Registration loop (C7): singleton watcher that discovers newly
//! submitted benchmark jobs and spawns one processing-loop task (C6) per
//! benchmark that has never been watched. This is also the landing point
//! for CLI-registered jobs: the register endpoint creates a synthetic
//! benchmark + job pair, and this loop picks it up identically to
//! REST-submitted work.

use crate::config::SchedulerConfig;
use crate::scheduler::SchedulerAdapter;
use crate::store::documents::DocumentStore;
use crate::watcher::Watcher;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct RegistrationLoop {
    scheduler: Arc<SchedulerAdapter>,
    documents: Arc<DocumentStore>,
    watcher: Arc<Watcher>,
    config: SchedulerConfig,
    dispatched: Mutex<HashSet<u64>>,
}

impl RegistrationLoop {
    pub fn new(
        scheduler: Arc<SchedulerAdapter>,
        documents: Arc<DocumentStore>,
        watcher: Arc<Watcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self { scheduler, documents, watcher, config, dispatched: Mutex::new(HashSet::new()) }
    }

    /// Polls every `queue_timeout_seconds`. There are no mid-iteration
    /// cancellation points by design: the loop exits at its next sleep
    /// boundary after the token is cancelled.
    pub async fn run(self: Arc<Self>, cancellation: CancellationToken) {
        loop {
            if let Err(err) = self.tick().await {
                tracing::warn!(error = %err, "registration tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.queue_timeout_seconds)) => {}
                _ = cancellation.cancelled() => {
                    tracing::info!("registration loop exiting on cancellation");
                    return;
                }
            }
        }
    }

    async fn tick(&self) -> crate::error::ControllerResult<()> {
        let jobs = self.scheduler.get_jobs().await?;

        for job_id in jobs.keys() {
            let Some(benchmark) = self.documents.benchmark_containing_job(*job_id).await? else {
                continue;
            };

            let already_dispatched = {
                let mut dispatched = self.dispatched.lock();
                !dispatched.insert(benchmark.run_number)
            };
            if already_dispatched {
                continue;
            }

            let watcher = self.watcher.clone();
            let run_number = benchmark.run_number;
            tokio::spawn(async move { watcher.run(run_number).await });
        }

        Ok(())
    }
}
