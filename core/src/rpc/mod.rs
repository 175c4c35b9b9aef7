//! RPC surface (C8): a `tonic` service fronting the controller. The REST
//! layer and the node-side registration callback are both external to this
//! workspace; this crate only exposes the gRPC contract they speak to.

#![allow(clippy::all)]
pub mod proto {
    tonic::include_proto!("xbatctld");
}

use crate::error::ControllerError;
use crate::expander::Variant;
use crate::identity::IdentityAdapter;
use crate::model::{Benchmark, Job, NodeAssignment, VariableSpec};
use crate::scheduler::SchedulerAdapter;
use crate::store::documents::DocumentStore;
use crate::store::timeseries::TimeSeriesGateway;
use crate::submitter::Submitter;
use proto::controller_service_server::ControllerService;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Tables the time-series gateway maintains and purges. Fixed, not
/// discovered, because QuestDB has no catalogue of "the metric tables xbat
/// owns" beyond this list.
const METRIC_TABLES: &[&str] =
    &["cpu", "memory", "network", "disk", "energy", "gpu"];

pub struct ControllerGrpc {
    scheduler: Arc<SchedulerAdapter>,
    identity: Arc<IdentityAdapter>,
    documents: Arc<DocumentStore>,
    time_series: Arc<TimeSeriesGateway>,
    submitter: Arc<Submitter>,
}

impl ControllerGrpc {
    pub fn new(
        scheduler: Arc<SchedulerAdapter>,
        identity: Arc<IdentityAdapter>,
        documents: Arc<DocumentStore>,
        time_series: Arc<TimeSeriesGateway>,
        submitter: Arc<Submitter>,
    ) -> Self {
        Self { scheduler, identity, documents, time_series, submitter }
    }

    /// Wraps a CLI-submitted, previously-unseen `job_id` in a synthetic
    /// `cli` benchmark (no issuer, no configuration snapshot) plus an empty
    /// job document, so that an unmodified processing loop can watch it to
    /// completion.
    async fn register_cli_job(&self, job_id: i64) -> Result<Job, Status> {
        let run_number = self.documents.allocate_run_number().await?;

        let mut benchmark = Benchmark::new_pending(run_number, None, format!("cli-{job_id}"));
        benchmark.cli = true;
        benchmark.mark_running(vec![job_id]);
        self.documents.insert_benchmark(&benchmark).await?;

        let job = Job {
            id: None,
            job_id,
            run_number,
            permutation_number: 0,
            iteration: 0,
            variant_name: String::new(),
            variables: Default::default(),
            jobscript_file: String::new(),
            user_jobscript_file: String::new(),
            identificator: job_id.to_string(),
            nodes: Default::default(),
            job_info: serde_json::Value::Null,
            runtime: None,
            capture_time: None,
            capture_start: None,
            capture_end: None,
        };
        self.documents.insert_job(&job).await?;

        tracing::info!(job_id, run_number, "registered CLI job");
        Ok(job)
    }
}

#[tonic::async_trait]
impl ControllerService for ControllerGrpc {
    /// Allocates a run number and persists a `Pending` benchmark
    /// synchronously, then spawns the actual submission as a background
    /// task and responds immediately with the `run_number` to poll.
    /// Mirrors the original's `threading.Thread(target=submit_benchmark_jobs,
    /// ...).start()`: expansion and per-permutation `sbatch` calls can take
    /// far longer than a client wants to hold an RPC open.
    async fn submit_benchmark(
        &self,
        request: Request<proto::SubmitBenchmarkRequest>,
    ) -> Result<Response<proto::SubmitBenchmarkResponse>, Status> {
        let req = request.into_inner();
        let run_number = self.documents.allocate_run_number().await?;

        let mut benchmark = Benchmark::new_pending(run_number, Some(req.issuer.clone()), req.name.clone());
        benchmark.shared_projects = req.shared_projects.clone();
        benchmark.variables = req
            .variables
            .iter()
            .map(|v| VariableSpec { key: v.key.clone(), selected: v.selected.clone() })
            .collect();
        self.documents.insert_benchmark(&benchmark).await?;

        let variants: Vec<Variant> = req
            .variants
            .into_iter()
            .map(|v| Variant { name: v.name, jobscript_template: v.jobscript_template, iterations: v.iterations })
            .collect();

        let submitter = self.submitter.clone();
        let documents = self.documents.clone();
        let issuer = req.issuer.clone();
        tokio::spawn(async move {
            match submitter.submit_benchmark_jobs(run_number, &issuer, &variants, &benchmark.variables).await {
                Ok(job_ids) => benchmark.mark_running(job_ids),
                Err(err) => benchmark.mark_failed(err.to_string()),
            }
            if let Err(err) = documents.replace_benchmark(&benchmark).await {
                tracing::warn!(run_number, error = %err, "failed to persist submission outcome");
            }
        });

        Ok(Response::new(proto::SubmitBenchmarkResponse { run_number }))
    }

    async fn get_nodes(&self, _request: Request<proto::Empty>) -> Result<Response<proto::GetNodesResponse>, Status> {
        let nodes = self.scheduler.get_nodes().await?;
        let nodes_json = nodes.values().map(|n| n.raw.to_string()).collect();
        Ok(Response::new(proto::GetNodesResponse { nodes_json }))
    }

    async fn get_jobs(&self, _request: Request<proto::Empty>) -> Result<Response<proto::GetJobsResponse>, Status> {
        let jobs = self.scheduler.get_jobs().await?;
        let jobs_json = jobs.values().map(|j| j.raw.to_string()).collect();
        Ok(Response::new(proto::GetJobsResponse { jobs_json }))
    }

    async fn get_partitions(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::GetPartitionsResponse>, Status> {
        let partitions = self.scheduler.get_partitions().await?;
        let partitions = partitions
            .into_iter()
            .map(|(k, v)| (k, proto::StringList { values: v }))
            .collect::<HashMap<_, _>>();
        Ok(Response::new(proto::GetPartitionsResponse { partitions }))
    }

    async fn cancel_jobs(
        &self,
        request: Request<proto::CancelJobsRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();
        self.scheduler.cancel(&req.job_ids).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn get_user_info(
        &self,
        request: Request<proto::GetUserInfoRequest>,
    ) -> Result<Response<proto::GetUserInfoResponse>, Status> {
        let req = request.into_inner();
        let profile = self
            .identity
            .resolve(&req.username)
            .await
            .ok_or_else(|| Status::from(ControllerError::NotFound(format!("user {}", req.username))))?;

        Ok(Response::new(proto::GetUserInfoResponse {
            uid: profile.uid,
            gid: profile.gid,
            home_directory: profile.home_directory,
        }))
    }

    /// Responds immediately and runs the purge in the background: a full
    /// sweep across every metric table can take longer than a client wants
    /// to hold an RPC open.
    async fn purge_quest_db(&self, _request: Request<proto::Empty>) -> Result<Response<proto::Empty>, Status> {
        let time_series = self.time_series.clone();
        let documents = self.documents.clone();
        tokio::spawn(async move {
            let known = match documents.all_job_ids().await {
                Ok(ids) => ids.into_iter().collect(),
                Err(err) => {
                    tracing::warn!(error = %err, "purge aborted, could not load known job ids");
                    return;
                }
            };
            let tables: Vec<String> = METRIC_TABLES.iter().map(|s| s.to_string()).collect();
            if let Err(err) = time_series.purge(&tables, &known).await {
                tracing::warn!(error = %err, "questdb purge failed");
            }
        });
        Ok(Response::new(proto::Empty {}))
    }

    /// Node-side callback: records that `hostname` (identified by its
    /// calibration `hash`) is participating in `job_id`. Jobs submitted
    /// directly via the CLI (`sbatch --constraint=xbat`, bypassing
    /// `SubmitBenchmark`) are unknown to the store until their first node
    /// registers; in that case a synthetic `cli` benchmark and an empty job
    /// document are created first so the processing loop can pick it up like
    /// any other benchmark.
    async fn register_job(
        &self,
        request: Request<proto::RegisterJobRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let req = request.into_inner();

        let mut job = match self.documents.get_job(req.job_id).await {
            Ok(job) => job,
            Err(err) if err.is_not_found() => self.register_cli_job(req.job_id).await?,
            Err(err) => return Err(err.into()),
        };

        job.nodes.insert(
            req.hostname.clone(),
            NodeAssignment { hash: req.hash, hostname: req.hostname },
        );
        self.documents.replace_job(&job).await?;
        Ok(Response::new(proto::Empty {}))
    }

    async fn get_benchmark(
        &self,
        request: Request<proto::GetBenchmarkRequest>,
    ) -> Result<Response<proto::BenchmarkRecord>, Status> {
        let req = request.into_inner();
        let benchmark = self.documents.get_benchmark(req.run_number).await?;
        Ok(Response::new(to_record(&benchmark)))
    }

    async fn list_benchmarks(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::ListBenchmarksResponse>, Status> {
        let benchmarks = self.documents.list_benchmarks().await?;
        let benchmarks = benchmarks.iter().map(to_record).collect();
        Ok(Response::new(proto::ListBenchmarksResponse { benchmarks }))
    }
}

fn to_record(benchmark: &Benchmark) -> proto::BenchmarkRecord {
    proto::BenchmarkRecord {
        run_number: benchmark.run_number,
        issuer: benchmark.issuer.clone(),
        name: benchmark.name.clone(),
        state: format!("{:?}", benchmark.state).to_lowercase(),
        job_ids: benchmark.job_ids.clone(),
        failure_reason: benchmark.failure_reason.clone(),
    }
}
