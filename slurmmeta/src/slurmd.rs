// The slurmd source: ask the local slurmd which processes belong to which job and read the GPU
// allocation out of the environment of one process per job.  Only the job ID and the user are known
// this way; slurmctld is never contacted.

use crate::procenv::{lookup_var, read_environ};
use crate::queries::NodeQueries;
use crate::sources::Resolution;
use crate::{JobMetadata, Snapshot};

use itertools::Itertools;
use tracing::{debug, info};

/// Parse `scontrol listpids` output into (job ID, pid) pairs, one per job, carrying the first pid
/// listed for the job.  Jobs are in order of first appearance.  The first line is a header.
///
///   PID      JOBID    STEPID   LOCALID GLOBALID
///   1184     30214    batch    0       0

pub fn parse_listpids(output: &str) -> Vec<(String, String)> {
    let jobs = output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_ascii_whitespace();
            match (fields.next(), fields.next()) {
                (Some(pid), Some(job)) => Some((job.to_string(), pid.to_string())),
                _ => None,
            }
        })
        .unique_by(|(job, _)| job.clone())
        .collect::<Vec<_>>();
    if jobs.is_empty() {
        info!("No Slurm jobs found on the host");
    }
    jobs
}

/// The GPU indices of SLURM_JOB_GPUS in an environment block.  Surrounding commas and spaces and
/// empty items are ignored.  Returns None if the variable is not set.

pub fn gpus_from_environ(env: &str) -> Option<Vec<String>> {
    let gpus = lookup_var(env, "SLURM_JOB_GPUS").ok()?;
    Some(
        gpus.trim_matches(|c| c == ',' || c == ' ')
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(canonical_index)
            .collect(),
    )
}

// "03" and "3" are the same GPU.
fn canonical_index(s: &str) -> String {
    match s.parse::<u32>() {
        Ok(n) => n.to_string(),
        Err(_) => s.to_string(),
    }
}

/// Jobs whose environment cannot be read, or that have no GPUs, are skipped with a warning and do
/// not affect the other jobs.  A job whose owner cannot be found keeps an empty user, also with a
/// warning.  A failing listpids query gives an empty resolution.

pub fn resolve(queries: &dyn NodeQueries) -> Resolution {
    let mut resolution = Resolution::default();
    let jobs = match queries.list_pids() {
        Ok(output) => parse_listpids(&output),
        Err(e) => {
            resolution.warn(format!("listing slurm job pids: {e}"));
            return resolution;
        }
    };
    resolution.job_ids = jobs.iter().map(|(job, _)| job.clone()).collect();

    let mut snapshot = Snapshot::new();
    for (job_id, pid) in &jobs {
        debug!("reading environment of job {job_id}, pid {pid}");
        let env = match read_environ(pid, queries.proc_root()) {
            Ok(env) => env,
            Err(e) => {
                resolution.warn(format!("job {job_id}: could not read environment of pid {pid}: {e}"));
                continue;
            }
        };
        let gpus = match gpus_from_environ(&env) {
            Some(gpus) if !gpus.is_empty() => gpus,
            _ => {
                resolution.warn(format!("job {job_id}: SLURM_JOB_GPUS not defined for pid {pid}"));
                continue;
            }
        };
        let user = match queries.process_user(pid) {
            Ok(user) => user,
            Err(e) => {
                resolution.warn(format!("job {job_id}: could not find the user of pid {pid}: {e}"));
                String::new()
            }
        };
        let metadata = JobMetadata { job_id: job_id.clone(), user, ..Default::default() };
        for gpu in gpus {
            snapshot.insert(gpu, metadata.clone());
        }
    }
    resolution.snapshot = snapshot;
    resolution
}
