// The slurmctld source: ask the controller for the full description of every job that has processes
// on this node, and attribute the GPUs named in the GRES allocations of the job to the job.
//
// `scontrol show jobs <id> -d` prints one block of `Key=Value` tokens per job (several for an array
// job), blocks separated by a blank line.  A block applies to this host if its NodeList matches the
// short host name.  The detail lines of the block carry the allocation:
//
//   JobId=30214 ArrayJobId=30185 ArrayTaskId=28 JobName=demo_ods
//      UserId=test_username(1001) GroupId=test_username(1001) MCS_label=N/A
//      ...
//      NodeList=node1751
//      ...
//        Nodes=node1751 CPU_IDs=0-79 Mem=491520 GRES=gpu:ampere:8(IDX:0-7)
//
// The controller is expensive to query, so the result is cached in a file (see cache.rs).

use crate::cache::{read_snapshot, write_snapshot};
use crate::dates::Clock;
use crate::gres::parse_gres;
use crate::hostlist::{hostlist_of, hostname_in_list};
use crate::queries::NodeQueries;
use crate::slurmd::parse_listpids;
use crate::sources::Resolution;
use crate::{JobMetadata, Result, Snapshot};

use itertools::Itertools;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

// The values of each field seen in one block.  A field normally occurs once per block, but nothing
// prevents repetitions, which are deduplicated.

#[derive(Default)]
struct BlockFields {
    job_id: BTreeSet<String>,
    job_name: BTreeSet<String>,
    qos: BTreeSet<String>,
    user: BTreeSet<String>,
    partition: BTreeSet<String>,
    account: BTreeSet<String>,
    num_nodes: BTreeSet<String>,
    array_job_id: BTreeSet<String>,
    array_task_id: BTreeSet<String>,
    gpus: Vec<String>,
}

impl BlockFields {
    fn parse(block: &str) -> BlockFields {
        let mut fields = BlockFields::default();
        for token in block.split_ascii_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let value = value.to_string();
            match key {
                "UserId" => {
                    let user = match value.find('(') {
                        Some(ix) => value[..ix].to_string(),
                        None => value,
                    };
                    fields.user.insert(user);
                }
                "JobId" => {
                    fields.job_id.insert(value);
                }
                "JobName" => {
                    fields.job_name.insert(value);
                }
                "QOS" => {
                    fields.qos.insert(value);
                }
                "ArrayJobId" => {
                    fields.array_job_id.insert(value);
                }
                "ArrayTaskId" => {
                    // Not a number on the record of the array job itself, eg "29-40%4".  The tasks
                    // running here have records of their own.
                    if value.parse::<u64>().is_ok() {
                        fields.array_task_id.insert(value);
                    }
                }
                "Account" => {
                    fields.account.insert(value);
                }
                "Partition" => {
                    fields.partition.insert(value);
                }
                "NumNodes" => {
                    fields.num_nodes.insert(value);
                }
                "GRES" => fields.gpus.extend(parse_gres(&value)),
                _ => {}
            }
        }
        fields
    }

    fn metadata(&self) -> JobMetadata {
        JobMetadata {
            job_id: self.job_id.iter().join(","),
            job_name: self.job_name.iter().join(","),
            qos: self.qos.iter().join(","),
            user: self.user.iter().join(","),
            partition: self.partition.iter().join(","),
            account: self.account.iter().join(","),
            num_nodes: self.num_nodes.iter().join(","),
            array_job_id: self.array_job_id.iter().join(","),
            array_task_id: self.array_task_id.iter().join(","),
        }
    }
}

/// Add to `snapshot` the GPUs allocated to the job blocks that apply to `hostname`.  A later block
/// overwrites the GPUs of an earlier one.

pub fn attribute_blocks<'a>(blocks: impl IntoIterator<Item = &'a str>, hostname: &str, snapshot: &mut Snapshot) {
    for block in blocks {
        let hostlist = hostlist_of(block);
        if !hostname_in_list(hostname, hostlist) {
            continue;
        }
        let fields = BlockFields::parse(block);
        let metadata = fields.metadata();
        debug!("job {} has gpus {:?} on {hostname}", metadata.job_id, fields.gpus);
        for gpu in fields.gpus {
            snapshot.insert(gpu, metadata.clone());
        }
    }
}

/// Split `scontrol show jobs` output into job blocks.

pub fn split_blocks(output: &str) -> impl Iterator<Item = &str> {
    output.split("\n\n")
}

/// Failing scontrol commands give an empty snapshot and a warning, and the cache is left alone.
/// Failing to determine the host name or to read or write the cache is an error.

pub fn resolve(
    queries: &dyn NodeQueries,
    cache_path: &Path,
    cache_duration: u64,
    clock: &dyn Clock,
) -> Result<Resolution> {
    let hostname = queries.hostname()?;
    let mut resolution = Resolution::default();
    match queries.list_pids() {
        Ok(output) => {
            resolution.job_ids = parse_listpids(&output).into_iter().map(|(job, _)| job).collect();
        }
        Err(e) => {
            resolution.warn(format!("listing slurm job pids: {e}"));
            return Ok(resolution);
        }
    }

    if let Some(snapshot) = read_snapshot(cache_path, cache_duration, clock)? {
        debug!("using cached snapshot from {}", cache_path.display());
        resolution.snapshot = snapshot;
        return Ok(resolution);
    }

    let mut snapshot = Snapshot::new();
    for job_id in &resolution.job_ids {
        let output = match queries.show_job(job_id) {
            Ok(output) => output,
            Err(e) => {
                resolution.warn(format!("querying slurmctld for job {job_id}: {e}"));
                return Ok(resolution);
            }
        };
        attribute_blocks(split_blocks(&output), &hostname, &mut snapshot);
    }
    write_snapshot(cache_path, &snapshot)?;
    info!("cached {} gpu entries in {}", snapshot.len(), cache_path.display());
    resolution.snapshot = snapshot;
    Ok(resolution)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dates::{self, FixedClock};
    use crate::queries::mock::MockQueries;
    use crate::Error;
    use chrono::Duration;
    use std::fs;

    fn job(
        job_id: &str,
        job_name: &str,
        qos: &str,
        user: &str,
        partition: &str,
        account: &str,
        num_nodes: &str,
        array: (&str, &str),
    ) -> JobMetadata {
        JobMetadata {
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            qos: qos.to_string(),
            user: user.to_string(),
            partition: partition.to_string(),
            account: account.to_string(),
            num_nodes: num_nodes.to_string(),
            array_job_id: array.0.to_string(),
            array_task_id: array.1.to_string(),
        }
    }

    fn attribute_file(filename: &str, hostname: &str) -> Snapshot {
        let output = fs::read_to_string(filename).unwrap();
        let mut snapshot = Snapshot::new();
        attribute_blocks(split_blocks(&output), hostname, &mut snapshot);
        snapshot
    }

    fn gpus(snapshot: &Snapshot) -> Vec<&str> {
        snapshot.keys().map(|k| k.as_str()).collect()
    }

    #[test]
    fn test_all_gpus() {
        let snapshot = attribute_file("testdata/scontrol_out_all_gpus.txt", "node1751");
        let expected = job("30214", "demo_ods", "normal", "test_username", "learn", "test_account", "1", ("30185", "28"));
        assert_eq!(gpus(&snapshot), vec!["0", "1", "2", "3", "4", "5", "6", "7"]);
        assert!(snapshot.values().all(|m| *m == expected));
    }

    #[test]
    fn test_some_gpus() {
        let snapshot = attribute_file("testdata/scontrol_out_some_gpus.txt", "node1751");
        assert_eq!(gpus(&snapshot), vec!["0", "1", "3", "4", "6"]);
        assert_eq!(snapshot["6"].job_id, "30214");
    }

    #[test]
    fn test_no_gpus() {
        assert!(attribute_file("testdata/scontrol_out_no_gpus.txt", "node1751").is_empty());
    }

    #[test]
    fn test_unique_entries() {
        let snapshot = attribute_file("testdata/scontrol_out_unique_entries.txt", "node1751");
        assert_eq!(gpus(&snapshot), vec!["0", "1", "2", "3", "5", "6", "7"]);
        let first = job("30214", "demo_ods", "normal", "test_username", "learn", "test2_account", "1", ("30185", "28"));
        let second =
            job("31214", "demo_ods2", "dev", "test_username_2", "test", "test_account", "3", ("31185", "128"));
        for gpu in ["0", "1", "2", "3"] {
            assert_eq!(snapshot[gpu], first);
        }
        for gpu in ["5", "6", "7"] {
            assert_eq!(snapshot[gpu], second);
        }
    }

    #[test]
    fn test_main_array_job() {
        let snapshot = attribute_file("testdata/scontrol_out_main_array_job.txt", "node1751");
        assert_eq!(gpus(&snapshot), vec!["0", "1"]);
        assert_eq!(
            snapshot["0"],
            job("30214", "demo_ods", "normal", "test_username", "learn", "test2_account", "1", ("30185", ""))
        );
        assert_eq!(snapshot["1"].job_id, "30213");
        assert_eq!(snapshot["1"].array_task_id, "28");
    }

    #[test]
    fn test_multi_node() {
        assert!(attribute_file("testdata/scontrol_out_multi_node.txt", "node1751").is_empty());
        let snapshot = attribute_file("testdata/scontrol_out_multi_node.txt", "node1890");
        assert_eq!(snapshot.len(), 8);
        assert_eq!(snapshot["7"].num_nodes, "7");
        assert_eq!(snapshot["7"].array_task_id, "");
    }

    #[test]
    fn test_repeated_gres_lines() {
        let snapshot = attribute_file("testdata/scontrol_out_repeated_entry.txt", "node1751");
        assert_eq!(gpus(&snapshot), vec!["0", "1", "3", "4"]);
        assert!(snapshot.values().all(|m| *m == snapshot["0"]));
        assert_eq!(snapshot["0"].user, "test_username");
    }

    #[test]
    fn test_repeated_fields_are_joined() {
        let block = "JobId=1 JobName=a\n   NodeList=n1\n   JobName=b JobName=a UserId=x\n   GRES=gpu:1(IDX:2)";
        let mut snapshot = Snapshot::new();
        attribute_blocks([block], "n1", &mut snapshot);
        assert_eq!(snapshot["2"].job_name, "a,b");
        assert_eq!(snapshot["2"].user, "x");
    }

    fn slurmctld_queries(proc_root: &Path) -> MockQueries {
        let mut queries = MockQueries::new(proc_root);
        queries.list_pids = Some(fs::read_to_string("testdata/scontrol_listpids.txt").unwrap());
        let unique = fs::read_to_string("testdata/scontrol_out_unique_entries.txt").unwrap();
        queries.show_job.insert("30214".to_string(), unique);
        queries.show_job.insert("31214".to_string(), String::new());
        queries.show_job.insert("31500".to_string(), "\n".to_string());
        queries
    }

    #[test]
    fn test_resolve_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache").join("slurm.json");
        let queries = slurmctld_queries(dir.path());
        let clock = FixedClock(dates::now());

        let r = resolve(&queries, &cache, 60, &clock).unwrap();
        assert_eq!(r.job_ids, vec!["30214", "31214", "31500"]);
        assert_eq!(r.snapshot.len(), 7);
        assert!(r.warnings.is_empty());
        assert_eq!(queries.show_job_calls.get(), 3);
        assert!(cache.exists());

        let r2 = resolve(&queries, &cache, 60, &clock).unwrap();
        assert_eq!(r2.snapshot, r.snapshot);
        assert_eq!(queries.show_job_calls.get(), 3);

        // Stale
        let later = FixedClock(clock.0 + Duration::seconds(3600));
        resolve(&queries, &cache, 60, &later).unwrap();
        assert_eq!(queries.show_job_calls.get(), 6);
    }

    #[test]
    fn test_resolve_show_job_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("slurm.json");
        let mut queries = slurmctld_queries(dir.path());
        queries.show_job.remove("31214");

        let r = resolve(&queries, &cache, 60, &FixedClock(dates::now())).unwrap();
        assert!(r.snapshot.is_empty());
        assert_eq!(r.job_ids.len(), 3);
        assert_eq!(r.warnings.len(), 1);
        assert!(!cache.exists());
    }

    #[test]
    fn test_resolve_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("slurm.json");
        let clock = FixedClock(dates::now());

        let mut queries = slurmctld_queries(dir.path());
        queries.hostname = None;
        assert!(matches!(resolve(&queries, &cache, 60, &clock), Err(Error::Hostname)));

        let queries = slurmctld_queries(dir.path());
        fs::write(&cache, "not json").unwrap();
        let clock = FixedClock(dates::from_system_time(fs::metadata(&cache).unwrap().modified().unwrap()));
        assert!(matches!(resolve(&queries, &cache, 60, &clock), Err(Error::Json(_))));

        let mut queries = slurmctld_queries(dir.path());
        queries.list_pids = None;
        let r = resolve(&queries, &cache, 60, &clock).unwrap();
        assert!(r.snapshot.is_empty());
        assert_eq!(r.warnings.len(), 1);
    }
}
