// The NVML source: ask the driver which process runs on each GPU and read the job identity out of
// that process's environment.
//
// `nvidia-smi pmon -c 1` prints two '#' header lines and then one line per (GPU, process), or a
// single line with '-' in the pid column for an idle GPU:
//
//   # gpu         pid   type     sm    mem    enc    dec    command
//   # Idx           #    C/G      %      %      %      %    name
//       0      48213     C     97     41      -      -    python
//       1          -     -      -      -      -      -    -

use crate::procenv::{parse_environ, read_environ};
use crate::queries::NodeQueries;
use crate::sources::Resolution;
use crate::{JobMetadata, Snapshot};

use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, warn};

/// Map each GPU index to the first pid listed for it.  Idle GPUs and unparseable lines are absent.

pub fn parse_pmon(output: &str) -> BTreeMap<String, String> {
    let mut gpu_to_pid = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = line.split_ascii_whitespace().collect::<Vec<&str>>();
        if fields.len() < 2 {
            warn!("parse_pmon: short line {line:?}");
            continue;
        }
        let (gpu, pid) = match (u32::from_str(fields[0]), u32::from_str(fields[1])) {
            (Ok(gpu), Ok(pid)) => (gpu, pid),
            (Ok(_), Err(_)) if fields[1] == "-" => continue,
            _ => {
                warn!("parse_pmon: unparseable line {line:?}");
                continue;
            }
        };
        gpu_to_pid.entry(gpu.to_string()).or_insert_with(|| pid.to_string());
    }
    gpu_to_pid
}

/// Read the job identity from the environment of `pid`.  Variables that are not set are empty.

pub fn metadata_from_environ(pid: &str, queries: &dyn NodeQueries) -> crate::Result<JobMetadata> {
    let env = parse_environ(&read_environ(pid, queries.proc_root())?);
    let var = |name: &str| env.get(name).cloned().unwrap_or_default();
    Ok(JobMetadata {
        job_id: var("SLURM_JOB_ID"),
        job_name: var("SLURM_JOB_NAME"),
        qos: var("SLURM_JOB_QOS"),
        user: var("SLURM_JOB_USER"),
        partition: var("SLURM_JOB_PARTITION"),
        account: var("SLURM_JOB_ACCOUNT"),
        num_nodes: var("SLURM_JOB_NUM_NODES"),
        array_job_id: var("SLURM_ARRAY_JOB_ID"),
        array_task_id: var("SLURM_ARRAY_TASK_ID"),
    })
}

/// The NVML source never reports job IDs at the resource level.  A failure to run the query is a
/// warning and an empty snapshot.  A process whose environment cannot be read still occupies its
/// GPU, which then maps to empty metadata.

pub fn resolve(queries: &dyn NodeQueries) -> Resolution {
    let mut resolution = Resolution::default();
    let output = match queries.gpu_processes() {
        Ok(output) => output,
        Err(e) => {
            resolution.warn(format!("listing gpu processes: {e}"));
            return resolution;
        }
    };

    let mut snapshot = Snapshot::new();
    for (gpu, pid) in parse_pmon(&output) {
        debug!("gpu {gpu} runs pid {pid}");
        let metadata = match metadata_from_environ(&pid, queries) {
            Ok(metadata) => metadata,
            Err(e) => {
                resolution.warn(format!("reading job metadata of pid {pid} on gpu {gpu}: {e}"));
                JobMetadata::default()
            }
        };
        snapshot.insert(gpu, metadata);
    }
    resolution.snapshot = snapshot;
    resolution
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queries::mock::{make_process, MockQueries};
    use std::fs;

    #[test]
    fn test_parse_pmon() {
        let output = fs::read_to_string("testdata/nvidia_smi_pmon.txt").unwrap();
        let m = parse_pmon(&output);
        assert_eq!(m.len(), 3);
        assert_eq!(m["0"], "48213");
        assert_eq!(m["2"], "51007");
        // Two processes on gpu 3, the first one wins
        assert_eq!(m["3"], "51220");
        assert!(!m.contains_key("1"));
    }

    #[test]
    fn test_parse_pmon_odd_input() {
        assert!(parse_pmon("").is_empty());
        assert!(parse_pmon("# gpu pid\n# Idx #\n").is_empty());
        let m = parse_pmon("    0  123 C\n garbage\n  x 17 C\n    1\n");
        assert_eq!(m.len(), 1);
        assert_eq!(m["0"], "123");
    }

    #[test]
    fn test_resolve() {
        let proc_root = tempfile::tempdir().unwrap();
        make_process(
            proc_root.path(),
            "48213",
            &[
                ("SLURM_JOB_ID", "30214"),
                ("SLURM_JOB_NAME", "demo_ods"),
                ("SLURM_JOB_QOS", "normal"),
                ("SLURM_JOB_USER", "alice"),
                ("SLURM_JOB_PARTITION", "learn"),
                ("SLURM_JOB_ACCOUNT", "test_account"),
                ("SLURM_JOB_NUM_NODES", "1"),
                ("SLURM_ARRAY_JOB_ID", "30185"),
                ("SLURM_ARRAY_TASK_ID", "28"),
            ],
        );
        make_process(proc_root.path(), "51007", &[("SLURM_JOB_ID", "31000"), ("HOME", "/home/bob")]);

        let mut queries = MockQueries::new(proc_root.path());
        queries.gpu_processes = Some(fs::read_to_string("testdata/nvidia_smi_pmon.txt").unwrap());
        let r = resolve(&queries);

        assert!(r.job_ids.is_empty());
        assert_eq!(r.snapshot.len(), 3);
        assert_eq!(
            r.snapshot["0"],
            JobMetadata {
                job_id: "30214".to_string(),
                job_name: "demo_ods".to_string(),
                qos: "normal".to_string(),
                user: "alice".to_string(),
                partition: "learn".to_string(),
                account: "test_account".to_string(),
                num_nodes: "1".to_string(),
                array_job_id: "30185".to_string(),
                array_task_id: "28".to_string(),
            }
        );
        assert_eq!(r.snapshot["2"], JobMetadata { job_id: "31000".to_string(), ..Default::default() });

        // pid 51220 has no procfs entry
        assert_eq!(r.snapshot["3"], JobMetadata::default());
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn test_resolve_command_failure() {
        let proc_root = tempfile::tempdir().unwrap();
        let queries = MockQueries::new(proc_root.path());
        let r = resolve(&queries);
        assert!(r.snapshot.is_empty());
        assert_eq!(r.warnings.len(), 1);
    }
}
