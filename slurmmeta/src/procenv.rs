// Reading and decoding of process environments.
//
// /proc/<pid>/environ holds the environment a process was started with as a sequence of
// NUL-terminated KEY=VALUE entries.  Slurm puts the job's identity into the environment of every
// process it starts, which is how the NVML and slurmd sources learn which job a process belongs to.

use crate::{Error, Result};

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Read the raw environment block of process `pid` from the procfs mounted at `proc_root`.
///
/// Fails with `NotFound` if the process directory does not exist or the environment cannot be
/// read.  Bytes that are not UTF-8 are replaced, not rejected.

pub fn read_environ(pid: &str, proc_root: &Path) -> Result<String> {
    let pid_dir = proc_root.join(pid);
    if !pid_dir.exists() {
        debug!("read_environ: pid {pid} does not exist");
        return Err(Error::NotFound(format!("pid {pid}")));
    }
    match fs::read(pid_dir.join("environ")) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!("read_environ: could not read environment of pid {pid}: {e}");
            Err(Error::NotFound(format!("environment of pid {pid}")))
        }
    }
}

/// Decode an environment block into a map.
///
/// Entries without `=` are dropped with a warning; empty keys and empty values are kept.  If a key
/// occurs more than once the first occurrence wins, as for `lookup_var`.

pub fn parse_environ(env: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for (key, value) in entries(env) {
        vars.entry(key.to_string()).or_insert_with(|| value.to_string());
    }
    vars
}

/// Find the value of the first occurrence of `name` in an environment block.
///
/// Fails with `NotFound` if there is no such variable.  Malformed entries are logged and skipped.

pub fn lookup_var(env: &str, name: &str) -> Result<String> {
    entries(env)
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .ok_or_else(|| Error::NotFound(format!("{name} in process environment")))
}

fn entries(env: &str) -> impl Iterator<Item = (&str, &str)> {
    env.strip_suffix('\0')
        .unwrap_or(env)
        .split('\0')
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let kv = line.split_once('=');
            if kv.is_none() {
                warn!("proc environ entry {line:?} does not conform to the KEY=VALUE format");
            }
            kv
        })
}
