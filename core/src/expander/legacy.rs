//! Normalises legacy job-script shapes (separate preparation / execution /
//! postprocessing phases, older field names `nodeCount`, `walltime`,
//! `jobName`) onto the current single-script form with
//! `#XBAT-START#`/`#XBAT-STOP#` markers between phases.

use std::collections::BTreeMap;

/// A pre-normalisation legacy jobscript, split into its three phases.
#[derive(Debug, Clone)]
pub struct LegacyJobscript {
    pub preparation: String,
    pub execution: String,
    pub postprocessing: String,
    pub node_count: u32,
    pub walltime: String,
    pub job_name: String,
}

/// Folds the three legacy phases into one script with start/stop markers
/// bracketing the execution phase, and maps the old field names onto the
/// `#SBATCH` directives the current template form expects.
pub fn normalize_jobscript(legacy: &LegacyJobscript) -> String {
    let mut header = BTreeMap::new();
    header.insert("job-name", legacy.job_name.clone());
    header.insert("nodes", legacy.node_count.to_string());
    header.insert("time", legacy.walltime.clone());

    let mut script = String::from("#!/bin/bash\n");
    for (directive, value) in &header {
        script.push_str(&format!("#SBATCH --{directive}={value}\n"));
    }

    script.push('\n');
    script.push_str(&legacy.preparation);
    script.push_str("\n#XBAT-START#\n");
    script.push_str(&legacy.execution);
    script.push_str("\n#XBAT-STOP#\n");
    script.push_str(&legacy.postprocessing);
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_three_phases_with_markers_around_execution() {
        let legacy = LegacyJobscript {
            preparation: "module load mpi".to_string(),
            execution: "mpirun ./app".to_string(),
            postprocessing: "cleanup".to_string(),
            node_count: 4,
            walltime: "01:00:00".to_string(),
            job_name: "bench".to_string(),
        };

        let script = normalize_jobscript(&legacy);
        assert!(script.contains("--nodes=4"));
        assert!(script.contains("--time=01:00:00"));
        let start = script.find("#XBAT-START#").unwrap();
        let exec = script.find("mpirun ./app").unwrap();
        let stop = script.find("#XBAT-STOP#").unwrap();
        assert!(start < exec && exec < stop);
    }
}
