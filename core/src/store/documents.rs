//! Document-store gateway (C9): typed access over MongoDB, plus the two
//! allocators that are the only non-trivial algorithms in this component.
//!
//! Grounded directly on the original system's `shared/mongodb.py`: a
//! `misc` singleton document holds `lastRun` for the monotonic run-number
//! allocator, and `reserved_jobIds` backs the gap-filling job-id allocator.
//! Both allocators take a filesystem lock first to serialise across
//! multiple controller worker processes, matching the original's
//! `FileLock` usage — a lock a single in-process mutex cannot provide.

use crate::config::DocumentStoreConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::model::{Benchmark, Job, NodeProfile, Output, ReservedJobId};
use bson::doc;
use chrono::{Duration as ChronoDuration, Utc};
use fs2::FileExt;
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Client, Collection, Database};
use std::fs::OpenOptions;
use std::path::PathBuf;

const COLLECTION_BENCHMARKS: &str = "benchmarks";
const COLLECTION_JOBS: &str = "jobs";
const COLLECTION_OUTPUTS: &str = "outputs";
const COLLECTION_NODES: &str = "nodes";
const COLLECTION_MISC: &str = "misc";
const COLLECTION_RESERVED_JOB_IDS: &str = "reserved_jobIds";

pub struct DocumentStore {
    db: Database,
    lock_directory: PathBuf,
    reservation_ttl: ChronoDuration,
}

impl DocumentStore {
    pub async fn connect(config: &DocumentStoreConfig) -> ControllerResult<Self> {
        let client = Client::with_uri_str(&config.uri).await?;
        let db = client.database(&config.database);
        std::fs::create_dir_all(&config.lock_directory)?;
        Ok(Self {
            db,
            lock_directory: PathBuf::from(&config.lock_directory),
            reservation_ttl: ChronoDuration::seconds(config.reservation_ttl_seconds),
        })
    }

    fn benchmarks(&self) -> Collection<Benchmark> {
        self.db.collection(COLLECTION_BENCHMARKS)
    }

    fn jobs(&self) -> Collection<Job> {
        self.db.collection(COLLECTION_JOBS)
    }

    fn outputs(&self) -> Collection<Output> {
        self.db.collection(COLLECTION_OUTPUTS)
    }

    fn nodes(&self) -> Collection<NodeProfile> {
        self.db.collection(COLLECTION_NODES)
    }

    fn reserved_job_ids(&self) -> Collection<ReservedJobId> {
        self.db.collection(COLLECTION_RESERVED_JOB_IDS)
    }

    fn misc(&self) -> Collection<bson::Document> {
        self.db.collection(COLLECTION_MISC)
    }

    // -- Benchmarks ---------------------------------------------------

    pub async fn insert_benchmark(&self, benchmark: &Benchmark) -> ControllerResult<()> {
        self.benchmarks().insert_one(benchmark, None).await?;
        Ok(())
    }

    pub async fn get_benchmark(&self, run_number: u64) -> ControllerResult<Benchmark> {
        self.benchmarks()
            .find_one(doc! { "run_number": run_number as i64 }, None)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("benchmark {run_number}")))
    }

    pub async fn replace_benchmark(&self, benchmark: &Benchmark) -> ControllerResult<()> {
        self.benchmarks()
            .replace_one(doc! { "run_number": benchmark.run_number as i64 }, benchmark, None)
            .await?;
        Ok(())
    }

    pub async fn benchmark_containing_job(&self, job_id: i64) -> ControllerResult<Option<Benchmark>> {
        Ok(self.benchmarks().find_one(doc! { "job_ids": job_id }, None).await?)
    }

    pub async fn list_benchmarks(&self) -> ControllerResult<Vec<Benchmark>> {
        use futures::stream::TryStreamExt;
        let mut cursor = self.benchmarks().find(None, None).await?;
        let mut benchmarks = Vec::new();
        while let Some(benchmark) = cursor.try_next().await? {
            benchmarks.push(benchmark);
        }
        Ok(benchmarks)
    }

    // -- Jobs -----------------------------------------------------------

    pub async fn insert_job(&self, job: &Job) -> ControllerResult<()> {
        self.jobs().insert_one(job, None).await?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: i64) -> ControllerResult<Job> {
        self.jobs()
            .find_one(doc! { "job_id": job_id }, None)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("job {job_id}")))
    }

    pub async fn replace_job(&self, job: &Job) -> ControllerResult<()> {
        self.jobs().replace_one(doc! { "job_id": job.job_id }, job, None).await?;
        Ok(())
    }

    /// All job ids currently recorded, used by the gap-filling allocator.
    pub async fn all_job_ids(&self) -> ControllerResult<Vec<i64>> {
        use futures::stream::TryStreamExt;
        let mut cursor = self.jobs().find(None, None).await?;
        let mut ids = Vec::new();
        while let Some(job) = cursor.try_next().await? {
            ids.push(job.job_id);
        }
        Ok(ids)
    }

    // -- Outputs ----------------------------------------------------------

    /// Up-serts the output record for `job_id` with a fresh `lastUpdate`.
    pub async fn upsert_output(&self, output: &Output) -> ControllerResult<()> {
        self.outputs()
            .replace_one(
                doc! { "job_id": output.job_id },
                output,
                mongodb::options::ReplaceOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    // -- Nodes --------------------------------------------------------

    pub async fn get_node_profile(&self, hash: &str) -> ControllerResult<Option<NodeProfile>> {
        Ok(self.nodes().find_one(doc! { "hash": hash }, None).await?)
    }

    pub async fn upsert_node_profile(&self, profile: &NodeProfile) -> ControllerResult<()> {
        self.nodes()
            .replace_one(
                doc! { "hash": &profile.hash },
                profile,
                mongodb::options::ReplaceOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    // -- Allocators -----------------------------------------------------

    /// Monotonic run-number allocator. Takes a filesystem lock to serialise
    /// across controller worker processes, then issues a `$inc`
    /// find-and-modify against the singleton `misc` document. Exactly-once
    /// per successful acquisition; never reused.
    pub async fn allocate_run_number(&self) -> ControllerResult<u64> {
        let _guard = self.acquire_file_lock("run_number.lock")?;

        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .misc()
            .find_one_and_update(
                doc! { "_key": "lastRun" },
                doc! { "$inc": { "lastRun": 1i64 } },
                options,
            )
            .await?
            .ok_or_else(|| ControllerError::Setup("run-number allocation returned no document".into()))?;

        let last_run = updated
            .get_i64("lastRun")
            .map_err(|e| ControllerError::Setup(format!("malformed misc document: {e}")))?;
        Ok(last_run as u64)
    }

    /// Gap-filling job-id allocator: sweeps reservations older than the
    /// configured TTL, computes `used = jobIds(jobs) ∪ jobIds(reserved)`,
    /// and returns the smallest positive integer not in `used`, persisting
    /// a reservation.
    pub async fn allocate_job_id(&self) -> ControllerResult<i64> {
        let _guard = self.acquire_file_lock("job_id.lock")?;

        let cutoff = Utc::now() - self.reservation_ttl;
        self.reserved_job_ids()
            .delete_many(doc! { "reserved_at": { "$lt": bson::DateTime::from_chrono(cutoff) } }, None)
            .await?;

        let mut used: std::collections::HashSet<i64> = self.all_job_ids().await?.into_iter().collect();
        {
            use futures::stream::TryStreamExt;
            let mut cursor = self.reserved_job_ids().find(None, None).await?;
            while let Some(reservation) = cursor.try_next().await? {
                used.insert(reservation.job_id);
            }
        }

        let mut candidate = 1i64;
        while used.contains(&candidate) {
            candidate += 1;
        }

        let reservation = ReservedJobId { id: None, job_id: candidate, reserved_at: Utc::now() };
        self.reserved_job_ids().insert_one(&reservation, None).await?;

        Ok(candidate)
    }

    /// Deletes reservations once the real job document has landed.
    pub async fn release_reserved_job_ids(&self, job_ids: &[i64]) -> ControllerResult<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        self.reserved_job_ids()
            .delete_many(doc! { "job_id": { "$in": job_ids } }, None)
            .await?;
        Ok(())
    }

    fn acquire_file_lock(&self, name: &str) -> ControllerResult<std::fs::File> {
        let path = self.lock_directory.join(name);
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.lock_exclusive()?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_fill_finds_smallest_missing_id() {
        let used: std::collections::HashSet<i64> = [1, 2, 4].into_iter().collect();
        let mut candidate = 1;
        while used.contains(&candidate) {
            candidate += 1;
        }
        assert_eq!(candidate, 3);
    }

    #[test]
    fn gap_fill_from_empty_store_starts_at_one() {
        let used: std::collections::HashSet<i64> = std::collections::HashSet::new();
        let mut candidate = 1;
        while used.contains(&candidate) {
            candidate += 1;
        }
        assert_eq!(candidate, 1);
    }
}
