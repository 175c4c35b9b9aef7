//! Scheduler adapter (C2): wraps the cluster scheduler's CLI
//! (`sbatch`/`scancel`/`squeue`/`sinfo`/`scontrol`) behind a staleness-gated
//! cache, mirroring the global mutable cache design in `distributed::cluster`
//! generalised to scheduler state instead of worker state.

use crate::config::SchedulerConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::hostbridge::PipePool;
use crate::model::TERMINAL_STATES;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Normalised view of one scheduler job.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobRecord {
    pub job_id: i64,
    /// Always a list; older scheduler versions return a scalar that gets
    /// wrapped on parse.
    pub job_state: Vec<String>,
    pub command: Option<String>,
    pub standard_output: Option<String>,
    pub standard_error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub submit_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub user_name: Option<String>,
    pub partition: Option<String>,
    pub raw: Value,
}

impl JobRecord {
    pub fn is_terminal(&self) -> bool {
        self.job_state.iter().any(|s| TERMINAL_STATES.contains(&s.as_str()))
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeRecord {
    pub hostname: String,
    pub raw: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerVersion {
    pub major: u32,
}

struct Cache {
    last_refresh: Option<DateTime<Utc>>,
    jobs: HashMap<i64, JobRecord>,
    nodes: HashMap<String, NodeRecord>,
    partitions: HashMap<String, Vec<String>>,
}

impl Cache {
    fn empty() -> Self {
        Self { last_refresh: None, jobs: HashMap::new(), nodes: HashMap::new(), partitions: HashMap::new() }
    }

    fn is_stale(&self, refresh_timer: Duration) -> bool {
        match self.last_refresh {
            None => true,
            Some(last) => {
                Utc::now().signed_duration_since(last)
                    > ChronoDuration::from_std(refresh_timer).unwrap_or(ChronoDuration::zero())
            }
        }
    }
}

/// Process-wide singleton wrapping the cluster scheduler. All public
/// getters take the refresh lock only for the staleness check and release
/// it around the (slow) host-bridge call, re-acquiring to commit.
pub struct SchedulerAdapter {
    pipes: Arc<PipePool>,
    config: SchedulerConfig,
    acquire_timeout: Duration,
    cache: RwLock<Cache>,
    version: RwLock<Option<SchedulerVersion>>,
}

impl SchedulerAdapter {
    pub fn new(pipes: Arc<PipePool>, config: SchedulerConfig, acquire_timeout: Duration) -> Self {
        Self {
            pipes,
            config,
            acquire_timeout,
            cache: RwLock::new(Cache::empty()),
            version: RwLock::new(None),
        }
    }

    /// Parses `sinfo --json` once at startup to pick the node-query
    /// strategy: scheduler major version > 22 uses `scontrol show nodes
    /// --json` instead.
    pub async fn probe_version(&self) -> ControllerResult<SchedulerVersion> {
        let result = self.pipes.execute("sinfo --json", self.acquire_timeout).await;
        if !result.is_success() {
            return Err(ControllerError::HostBridge("sinfo version probe failed".into()));
        }
        let parsed: Value = serde_json::from_str(&result.body)
            .map_err(|e| ControllerError::Setup(format!("unparsable sinfo output: {e}")))?;
        let major = parsed
            .get("meta")
            .and_then(|m| m.get("slurm"))
            .and_then(|s| s.get("version"))
            .and_then(|v| v.get("major"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let version = SchedulerVersion { major };
        *self.version.write() = Some(version);
        Ok(version)
    }

    async fn refresh_if_stale(&self) -> ControllerResult<()> {
        let refresh_timer = Duration::from_secs(self.config.refresh_timer_seconds);
        {
            let cache = self.cache.read();
            if !cache.is_stale(refresh_timer) {
                return Ok(());
            }
        }

        let squeue = self.pipes.execute("squeue --json --all", self.acquire_timeout).await;
        let use_scontrol_nodes = self.version.read().map(|v| v.major > 22).unwrap_or(false);
        let node_cmd = if use_scontrol_nodes { "scontrol show nodes --json" } else { "sinfo --json" };
        let node_result = self.pipes.execute(node_cmd, self.acquire_timeout).await;

        if !squeue.is_success() {
            tracing::warn!("squeue refresh failed, serving stale cache");
            return Ok(());
        }

        let jobs = parse_squeue(&squeue.body, &self.config.feature_constraint)?;
        let (nodes, partitions) = if node_result.is_success() {
            parse_sinfo(&node_result.body, use_scontrol_nodes)
        } else {
            tracing::warn!("node/partition refresh failed, serving stale cache for that half");
            (HashMap::new(), HashMap::new())
        };

        let mut cache = self.cache.write();
        let previously_seen: HashSet<i64> = cache.jobs.keys().copied().collect();
        let now_seen: HashSet<i64> = jobs.keys().copied().collect();
        let dropped: Vec<i64> = previously_seen.difference(&now_seen).copied().collect();

        let mut merged = jobs;
        for job_id in dropped {
            // Preserve the last-known record until a forced `scontrol`
            // refresh captures its final state (handled by callers).
            if let Some(job) = cache.jobs.remove(&job_id) {
                merged.entry(job_id).or_insert(job);
            }
        }

        cache.jobs = merged;
        if !nodes.is_empty() {
            cache.nodes = nodes;
        }
        if !partitions.is_empty() {
            cache.partitions = partitions;
        }
        cache.last_refresh = Some(Utc::now());

        let eviction_cutoff = Utc::now() - ChronoDuration::days(self.config.job_eviction_days);
        cache.jobs.retain(|_, job| {
            !job.is_terminal()
                || job.end_time.map(|end| end > eviction_cutoff).unwrap_or(true)
        });

        Ok(())
    }

    pub async fn get_jobs(&self) -> ControllerResult<HashMap<i64, JobRecord>> {
        self.refresh_if_stale().await?;
        Ok(self.cache.read().jobs.clone())
    }

    pub async fn get_active_jobs(&self) -> ControllerResult<HashMap<i64, JobRecord>> {
        let jobs = self.get_jobs().await?;
        Ok(jobs.into_iter().filter(|(_, j)| !j.is_terminal()).collect())
    }

    pub async fn get_nodes(&self) -> ControllerResult<HashMap<String, NodeRecord>> {
        self.refresh_if_stale().await?;
        Ok(self.cache.read().nodes.clone())
    }

    pub async fn get_partitions(&self) -> ControllerResult<HashMap<String, Vec<String>>> {
        self.refresh_if_stale().await?;
        Ok(self.cache.read().partitions.clone())
    }

    /// Forces a single-job refresh; used after submission and after a job
    /// drops out of `squeue` (the scheduler retains completed jobs in the
    /// JSON view only briefly).
    pub async fn update_job_by_scontrol(&self, job_id: i64) -> ControllerResult<()> {
        let cmd = format!("scontrol show job {job_id} --json");
        let result = self.pipes.execute(&cmd, self.acquire_timeout).await;
        if !result.is_success() {
            return Ok(());
        }
        if let Ok(mut jobs) = parse_squeue(&result.body, &self.config.feature_constraint) {
            if let Some(job) = jobs.remove(&job_id) {
                self.cache.write().jobs.insert(job_id, job);
            }
        }
        Ok(())
    }

    /// Fires one `scancel` and invalidates the cache so the next read
    /// refreshes.
    pub async fn cancel(&self, job_ids: &[i64]) -> ControllerResult<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let ids = job_ids.iter().map(i64::to_string).collect::<Vec<_>>().join(" ");
        let result = self.pipes.execute(&format!("scancel {ids}"), self.acquire_timeout).await;
        self.cache.write().last_refresh = None;
        if !result.is_success() {
            return Err(ControllerError::HostBridge(result.body));
        }
        Ok(())
    }

    /// Composes an `sbatch` command line enforcing the feature constraint,
    /// wraps it as `su - <user> -c "…"`, and parses the first integer from
    /// the reply as the job id.
    pub async fn submit(
        &self,
        user: &str,
        jobscript_path: &str,
        home_dir: &str,
        export_vars: &HashMap<String, String>,
        nodelist: Option<&str>,
    ) -> ControllerResult<Option<i64>> {
        let export = export_vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");

        let mut sbatch = format!(
            "sbatch --constraint {} --chdir={home_dir} --exclusive --wait-all-nodes=1",
            self.config.feature_constraint
        );
        if !export.is_empty() {
            sbatch.push_str(&format!(" --export={export}"));
        }
        if let Some(nodelist) = nodelist {
            if !nodelist.is_empty() {
                sbatch.push_str(&format!(" --nodelist={nodelist}"));
            }
        }
        sbatch.push_str(&format!(" {jobscript_path}"));

        let wrapped = format!("su - {user} -c \"{sbatch}\"");
        let result = self.pipes.execute(&wrapped, self.acquire_timeout).await;
        if !result.is_success() {
            return Ok(None);
        }

        let job_id = first_integer(&result.body);
        Ok(job_id)
    }
}

fn first_integer(text: &str) -> Option<i64> {
    static RE: once_cell::sync::OnceCell<Regex> = once_cell::sync::OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"\d+").expect("valid regex"));
    re.find(text).and_then(|m| m.as_str().parse().ok())
}

/// Parses `squeue --json --all` output, filtering to jobs carrying the
/// configured feature constraint and normalising `jobState` to a list.
fn parse_squeue(body: &str, feature_constraint: &str) -> ControllerResult<HashMap<i64, JobRecord>> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| ControllerError::Setup(format!("unparsable squeue output: {e}")))?;

    let mut jobs = HashMap::new();
    let Some(entries) = parsed.get("jobs").and_then(Value::as_array) else {
        return Ok(jobs);
    };

    for entry in entries {
        let Some(job) = parse_job(entry, feature_constraint) else { continue };
        jobs.insert(job.job_id, job);
    }
    Ok(jobs)
}

fn parse_job(entry: &Value, feature_constraint: &str) -> Option<JobRecord> {
    let features: Vec<String> = entry
        .get("features")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    if !features.iter().any(|f| f == feature_constraint) {
        return None;
    }

    let job_id = entry.get("job_id").and_then(Value::as_i64)?;

    let job_state = match entry.get("job_state") {
        Some(Value::Array(states)) => {
            states.iter().filter_map(|v| v.as_str().map(String::from)).collect()
        }
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    };

    Some(JobRecord {
        job_id,
        job_state,
        command: entry.get("command").and_then(Value::as_str).map(String::from),
        standard_output: entry.get("standard_output").and_then(Value::as_str).map(String::from),
        standard_error: entry.get("standard_error").and_then(Value::as_str).map(String::from),
        start_time: parse_timestamp(entry.get("start_time")),
        submit_time: parse_timestamp(entry.get("submit_time")),
        end_time: parse_timestamp(entry.get("end_time")),
        user_name: entry.get("user_name").and_then(Value::as_str).map(String::from),
        partition: entry.get("partition").and_then(Value::as_str).map(String::from),
        raw: entry.clone(),
    })
}

/// Scheduler timestamps are epoch seconds; a zero value means "unset".
fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let epoch = value.and_then(Value::as_i64).or_else(|| {
        value.and_then(|v| v.get("number")).and_then(Value::as_i64)
    })?;
    if epoch == 0 {
        return None;
    }
    DateTime::from_timestamp(epoch, 0)
}

fn parse_sinfo(body: &str, use_scontrol_shape: bool) -> (HashMap<String, NodeRecord>, HashMap<String, Vec<String>>) {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return (HashMap::new(), HashMap::new());
    };

    let key = if use_scontrol_shape { "nodes" } else { "sinfo" };
    let mut nodes = HashMap::new();
    let mut partitions: HashMap<String, Vec<String>> = HashMap::new();

    if let Some(entries) = parsed.get(key).and_then(Value::as_array) {
        for entry in entries {
            let Some(hostname) = entry
                .get("hostname")
                .or_else(|| entry.get("name"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            nodes.insert(hostname.to_string(), NodeRecord { hostname: hostname.to_string(), raw: entry.clone() });

            if let Some(partition) = entry
                .get("partition")
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .or_else(|| entry.get("partitions").and_then(Value::as_str))
            {
                partitions.entry(partition.to_string()).or_default().push(hostname.to_string());
            }
        }
    }

    (nodes, partitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_integer_extracts_job_id_from_sbatch_reply() {
        assert_eq!(first_integer("Submitted batch job 1234"), Some(1234));
    }

    #[test]
    fn parse_job_filters_on_feature_constraint() {
        let with_feature = serde_json::json!({
            "job_id": 1, "features": ["xbat"], "job_state": ["RUNNING"]
        });
        let without_feature = serde_json::json!({
            "job_id": 2, "features": ["other"], "job_state": ["RUNNING"]
        });
        assert!(parse_job(&with_feature, "xbat").is_some());
        assert!(parse_job(&without_feature, "xbat").is_none());
    }

    #[test]
    fn parse_job_normalises_scalar_job_state_to_list() {
        let entry = serde_json::json!({
            "job_id": 1, "features": ["xbat"], "job_state": "COMPLETED"
        });
        let job = parse_job(&entry, "xbat").unwrap();
        assert_eq!(job.job_state, vec!["COMPLETED".to_string()]);
        assert!(job.is_terminal());
    }

    #[test]
    fn zero_timestamp_becomes_none() {
        assert_eq!(parse_timestamp(Some(&serde_json::json!(0))), None);
    }
}
