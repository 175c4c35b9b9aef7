//! Submitter (C5): creates per-user work directories with correct
//! ownership/mode, materialises job scripts, hands them to the scheduler
//! adapter, and persists job records.

use crate::error::{ControllerError, ControllerResult};
use crate::expander::{self, Permutation, Variant};
use crate::identity::IdentityAdapter;
use crate::model::{Job, VariableSpec};
use crate::scheduler::SchedulerAdapter;
use crate::store::documents::DocumentStore;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Defence against misconfigured directory services: every resolved home
/// must start under this prefix.
const HOME_MOUNT_PREFIX: &str = "/external";

pub struct Submitter {
    identity: std::sync::Arc<IdentityAdapter>,
    scheduler: std::sync::Arc<SchedulerAdapter>,
    documents: std::sync::Arc<DocumentStore>,
}

impl Submitter {
    pub fn new(
        identity: std::sync::Arc<IdentityAdapter>,
        scheduler: std::sync::Arc<SchedulerAdapter>,
        documents: std::sync::Arc<DocumentStore>,
    ) -> Self {
        Self { identity, scheduler, documents }
    }

    /// Expands permutations, creates the per-user `.xbat/` directory tree,
    /// submits one permutation at a time, and persists a job document for
    /// each successfully-submitted job. A single permutation's submission
    /// failure is skipped, not fatal to the whole benchmark.
    pub async fn submit_benchmark_jobs(
        &self,
        run_number: u64,
        issuer: &str,
        variants: &[Variant],
        variables: &[VariableSpec],
    ) -> ControllerResult<Vec<i64>> {
        let profile = self
            .identity
            .resolve(issuer)
            .await
            .ok_or_else(|| ControllerError::Setup(format!("unknown user: {issuer}")))?;

        if !profile.home_directory.starts_with(HOME_MOUNT_PREFIX) && !profile.home_directory.starts_with("/home") {
            return Err(ControllerError::Setup(format!(
                "home directory {} does not begin under a known mount prefix",
                profile.home_directory
            )));
        }

        let home = PathBuf::from(&profile.home_directory);
        if !home.exists() {
            return Err(ControllerError::Setup(format!("home directory {} does not exist", home.display())));
        }

        let xbat_dir = home.join(".xbat");
        for subdir in ["jobscripts", "logs", "outputs"] {
            self.ensure_owned_directory(&xbat_dir.join(subdir), issuer, profile.uid, profile.gid).await?;
        }
        self.ensure_owned_directory(&xbat_dir, issuer, profile.uid, profile.gid).await?;

        let permutations = expander::expand(run_number, variants, variables);
        let mut assigned = Vec::new();

        for permutation in &permutations {
            let script_path = xbat_dir.join("jobscripts").join(format!("{}.sh", permutation.identificator));
            if let Err(err) = write_owned_script(&script_path, &permutation.jobscript, profile.uid, profile.gid) {
                tracing::warn!(identificator = %permutation.identificator, error = %err, "failed to write jobscript, skipping permutation");
                continue;
            }

            let nodelist = permutation.binding.get("NODELIST").map(String::as_str);
            let export_vars = export_vars_for(permutation);

            let job_id = match self
                .scheduler
                .submit(issuer, &script_path.to_string_lossy(), &profile.home_directory, &export_vars, nodelist)
                .await
            {
                Ok(Some(job_id)) => job_id,
                Ok(None) => {
                    tracing::warn!(identificator = %permutation.identificator, "scheduler rejected submission, skipping");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(identificator = %permutation.identificator, error = %err, "submission error, skipping");
                    continue;
                }
            };

            let job = Job {
                id: None,
                job_id,
                run_number,
                permutation_number: permutation.permutation_number,
                iteration: permutation.iteration,
                variant_name: permutation.variant_name.clone(),
                variables: permutation.binding.clone().into_iter().collect(),
                jobscript_file: permutation.jobscript.clone(),
                user_jobscript_file: permutation.user_jobscript.clone(),
                identificator: permutation.identificator.clone(),
                nodes: BTreeMap::new(),
                job_info: serde_json::Value::Null,
                runtime: None,
                capture_time: None,
                capture_start: None,
                capture_end: None,
            };

            self.documents.insert_job(&job).await?;
            assigned.push(job_id);
        }

        Ok(assigned)
    }

    /// Creates `path` if missing, then verifies ownership through
    /// `IdentityAdapter::dir_owned_by_user` (which also guards against UID
    /// reuse / case-insensitive username collisions) and `chown`/`chmod`s it
    /// back into line if it drifted. Idempotent: two concurrent submissions
    /// for the same user are safe.
    async fn ensure_owned_directory(&self, path: &Path, username: &str, uid: u32, gid: u32) -> ControllerResult<()> {
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }

        if !self.identity.dir_owned_by_user(path, username, uid, gid).await {
            chown(path, uid, gid)?;
        }

        let metadata = std::fs::metadata(path)?;
        if metadata.permissions().mode() & 0o777 != 0o755 {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }
}

fn export_vars_for(permutation: &Permutation) -> BTreeMap<String, String> {
    permutation
        .binding
        .iter()
        .filter(|(key, _)| key.as_str() != "NODELIST")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn write_owned_script(path: &Path, contents: &str, uid: u32, gid: u32) -> ControllerResult<()> {
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    chown(path, uid, gid)?;
    Ok(())
}

fn chown(path: &Path, uid: u32, gid: u32) -> ControllerResult<()> {
    // `std` has no portable chown; this is the only unsafe site in the
    // submitter, isolated to one call.
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| ControllerError::Setup(e.to_string()))?;
    let result = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if result != 0 {
        return Err(ControllerError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_vars_excludes_nodelist_binding() {
        let mut binding = BTreeMap::new();
        binding.insert("N".to_string(), "1".to_string());
        binding.insert("NODELIST".to_string(), "n01".to_string());

        let permutation = Permutation {
            identificator: "1-0-0".into(),
            permutation_number: 0,
            iteration: 0,
            variant_name: "baseline".into(),
            binding,
            jobscript: String::new(),
            user_jobscript: String::new(),
        };

        let export = export_vars_for(&permutation);
        assert!(export.contains_key("N"));
        assert!(!export.contains_key("NODELIST"));
    }
}
