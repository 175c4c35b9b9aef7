//! Processing loop (C6): one task per benchmark, advancing its jobs
//! through the scheduler state machine, harvesting logs and timings, and
//! finalising benchmark state.

use crate::config::SchedulerConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::identity::IdentityAdapter;
use crate::model::{Benchmark, BenchmarkState, Output};
use crate::scheduler::{JobRecord, SchedulerAdapter};
use crate::store::documents::DocumentStore;
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Home directories are mounted into the controller's container under this
/// prefix; a non-CLI job's logs/outputs live under
/// `<prefix>/<home stripped of its leading slash>/.xbat/...`.
const HOME_MOUNT_PREFIX: &str = "/external";

pub struct Watcher {
    scheduler: Arc<SchedulerAdapter>,
    documents: Arc<DocumentStore>,
    identity: Arc<IdentityAdapter>,
    config: SchedulerConfig,
}

impl Watcher {
    pub fn new(
        scheduler: Arc<SchedulerAdapter>,
        documents: Arc<DocumentStore>,
        identity: Arc<IdentityAdapter>,
        config: SchedulerConfig,
    ) -> Self {
        Self { scheduler, documents, identity, config }
    }

    /// Runs until every job in `run_number`'s benchmark is terminal (and has
    /// been observed terminal for at least `watch_min_iterations` ticks),
    /// then finalises benchmark state. Any error marks only this benchmark
    /// `failed`; it never propagates to the caller.
    pub async fn run(&self, run_number: u64) {
        if let Err(err) = self.run_inner(run_number).await {
            tracing::error!(run_number, error = %err, "processing loop failed");
            if let Ok(mut benchmark) = self.documents.get_benchmark(run_number).await {
                benchmark.mark_failed(err.to_string());
                let _ = self.documents.replace_benchmark(&benchmark).await;
            }
        }
    }

    async fn run_inner(&self, run_number: u64) -> ControllerResult<()> {
        let benchmark = self.documents.get_benchmark(run_number).await?;

        // Non-CLI benchmarks read logs/outputs from the issuer's home
        // directory, mounted into this container; CLI benchmarks have no
        // single issuer and fall back to the scheduler-reported times and
        // paths embedded in each job's own `jobInfo`.
        let home_directory = if !benchmark.cli {
            let issuer = benchmark
                .issuer
                .as_deref()
                .ok_or_else(|| ControllerError::Setup(format!("benchmark {run_number} has no issuer")))?;
            let profile = self
                .identity
                .resolve(issuer)
                .await
                .ok_or_else(|| ControllerError::Setup(format!("unknown user: {issuer}")))?;
            Some(profile.home_directory)
        } else {
            None
        };

        let mut remaining: HashSet<i64> = benchmark.job_ids.iter().copied().collect();
        let mut iteration: u32 = 0;

        while !remaining.is_empty() {
            let active = self.scheduler.get_active_jobs().await?;
            let snapshot = self.scheduler.get_jobs().await?;

            let mut retired = Vec::new();
            for job_id in &remaining {
                if let Some(info) = snapshot.get(job_id) {
                    self.harvest(*job_id, info, home_directory.as_deref()).await?;
                }

                if !active.contains_key(job_id) && iteration >= self.config.watch_min_iterations {
                    retired.push(*job_id);
                }
            }
            for job_id in retired {
                remaining.remove(&job_id);
            }

            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(self.config.job_state_interval_seconds)).await;
            iteration += 1;
        }

        // Finalisation: force one more refresh per job, harvest again, and
        // compute the benchmark's terminal state as the max-severity job
        // state across all its jobs.
        for job_id in &benchmark.job_ids {
            self.scheduler.update_job_by_scontrol(*job_id).await?;
        }
        let snapshot = self.scheduler.get_jobs().await?;
        let mut states = Vec::new();
        for job_id in &benchmark.job_ids {
            if let Some(info) = snapshot.get(job_id) {
                self.harvest(*job_id, info, home_directory.as_deref()).await?;
                states.extend(info.job_state.iter().cloned());
            }
        }

        let mut benchmark = self.documents.get_benchmark(run_number).await?;
        benchmark.state = BenchmarkState::max_severity(states).unwrap_or(BenchmarkState::Failed);
        benchmark.end_time = Some(Utc::now());

        if benchmark.cli {
            let starts: Vec<_> = snapshot
                .values()
                .filter(|j| benchmark.job_ids.contains(&j.job_id))
                .filter_map(|j| j.submit_time)
                .collect();
            let ends: Vec<_> = snapshot
                .values()
                .filter(|j| benchmark.job_ids.contains(&j.job_id))
                .filter_map(|j| j.end_time)
                .collect();
            benchmark.start_time = starts.into_iter().min();
            benchmark.end_time = ends.into_iter().max().or(benchmark.end_time);
        }

        self.documents.replace_benchmark(&benchmark).await?;
        Ok(())
    }

    /// Writes runtime/capture times (from the per-job time-log under the
    /// issuer's mounted home directory for non-CLI jobs, or from the
    /// scheduler snapshot's start/end time for CLI jobs), `jobInfo`, the
    /// backfilled user-visible jobscript (CLI only, when reachable under the
    /// mount prefix), and the up-serted output record.
    async fn harvest(&self, job_id: i64, info: &JobRecord, home_directory: Option<&str>) -> ControllerResult<()> {
        let mut job = self.documents.get_job(job_id).await?;
        job.job_info = info.raw.clone();

        match home_directory {
            Some(home) => {
                let time_log_path = internal_path(home, "logs").join(format!("{job_id}.time.log"));
                if let Ok(contents) = std::fs::read_to_string(&time_log_path) {
                    apply_time_log(&mut job, &contents);
                }
            }
            None => {
                if let (Some(start), Some(end)) = (info.start_time, info.end_time) {
                    job.runtime = Some((end - start).num_seconds());
                }
            }
        }

        if job.user_jobscript_file.is_empty() {
            if let Some(command) = &info.command {
                let jobscript_path = mount_path(command);
                if let Ok(contents) = std::fs::read_to_string(&jobscript_path) {
                    job.user_jobscript_file = contents;
                }
            }
        }

        self.documents.replace_job(&job).await?;

        let output = match home_directory {
            Some(home) => {
                let output_path = internal_path(home, "outputs").join(format!("{job_id}.out"));
                std::fs::read_to_string(&output_path).ok().map(|stdout| (stdout, None))
            }
            None => info.standard_output.as_ref().map(|stdout_path| {
                let stdout = std::fs::read_to_string(mount_path(stdout_path)).unwrap_or_default();
                let distinct_stderr = info.standard_error.as_deref() != Some(stdout_path.as_str());
                let stderr = info
                    .standard_error
                    .as_ref()
                    .filter(|_| distinct_stderr)
                    .and_then(|path| std::fs::read_to_string(mount_path(path)).ok());
                (stdout, stderr)
            }),
        };

        if let Some((stdout, stderr)) = output {
            self.documents
                .upsert_output(&Output { id: None, job_id, stdout, stderr, last_update: Utc::now() })
                .await?;
        }

        Ok(())
    }
}

/// `<HOME_MOUNT_PREFIX>/<home stripped of its leading slash>/.xbat/<subdir>`.
fn internal_path(home_directory: &str, subdir: &str) -> PathBuf {
    PathBuf::from(HOME_MOUNT_PREFIX).join(home_directory.trim_start_matches('/')).join(".xbat").join(subdir)
}

/// Remaps an absolute host path (as reported by the scheduler for a CLI job)
/// under the mount prefix, in the hope that it is reachable from inside this
/// container.
fn mount_path(absolute_path: &str) -> PathBuf {
    PathBuf::from(HOME_MOUNT_PREFIX).join(absolute_path.trim_start_matches('/'))
}

fn apply_time_log(job: &mut crate::model::Job, contents: &str) {
    let mut values = std::collections::HashMap::new();
    for line in contents.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if let Ok(epoch) = value.trim().parse::<i64>() {
                values.insert(key.trim().to_string(), epoch);
            }
        }
    }

    if let (Some(&start), Some(&end)) = (values.get("start"), values.get("end")) {
        job.runtime = Some(end - start);
    }
    if let (Some(&start), Some(&end)) = (values.get("captureStart"), values.get("captureEnd")) {
        job.capture_start = Some(start);
        job.capture_end = Some(end);
        job.capture_time = Some(end - start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Job;
    use std::collections::BTreeMap;

    fn empty_job() -> Job {
        Job {
            id: None,
            job_id: 1,
            run_number: 1,
            permutation_number: 0,
            iteration: 0,
            variant_name: "baseline".into(),
            variables: BTreeMap::new(),
            jobscript_file: String::new(),
            user_jobscript_file: String::new(),
            identificator: "1-0-0".into(),
            nodes: BTreeMap::new(),
            job_info: serde_json::Value::Null,
            runtime: None,
            capture_time: None,
            capture_start: None,
            capture_end: None,
        }
    }

    #[test]
    fn apply_time_log_computes_runtime_and_capture_window() {
        let mut job = empty_job();
        apply_time_log(&mut job, "start=100\nend=160\ncaptureStart=110\ncaptureEnd=150\n");
        assert_eq!(job.runtime, Some(60));
        assert_eq!(job.capture_time, Some(40));
    }

    #[test]
    fn internal_path_strips_leading_slash_and_nests_under_mount_prefix() {
        let path = internal_path("/home/alice", "logs");
        assert_eq!(path, PathBuf::from("/external/home/alice/.xbat/logs"));
    }

    #[test]
    fn mount_path_strips_leading_slash() {
        assert_eq!(mount_path("/home/alice/job.sh"), PathBuf::from("/external/home/alice/job.sh"));
    }
}
