// Everything the metadata sources learn from the node goes through `NodeQueries`, so that the
// sources can be run against canned command output in tests.  `SystemQueries` is the real thing.

use crate::{Error, Result};

use std::path::{Path, PathBuf};
use std::process::Command;
use sysinfo::System;
use tracing::{debug, warn};

pub trait NodeQueries {
    /// The short host name, ie, everything before the first '.'.
    fn hostname(&self) -> Result<String>;

    /// Output of `scontrol listpids`.
    fn list_pids(&self) -> Result<String>;

    /// Output of `scontrol show jobs <job_id> -d`.
    fn show_job(&self, job_id: &str) -> Result<String>;

    /// Output of `nvidia-smi pmon -c 1`.
    fn gpu_processes(&self) -> Result<String>;

    /// The user name owning `pid`.
    fn process_user(&self, pid: &str) -> Result<String>;

    /// Where procfs is mounted.
    fn proc_root(&self) -> &Path;
}

pub struct SystemQueries {
    proc_root: PathBuf,
}

impl SystemQueries {
    pub fn new() -> SystemQueries {
        SystemQueries::with_proc_root(PathBuf::from("/proc"))
    }

    pub fn with_proc_root(proc_root: PathBuf) -> SystemQueries {
        SystemQueries { proc_root }
    }
}

impl Default for SystemQueries {
    fn default() -> SystemQueries {
        SystemQueries::new()
    }
}

impl NodeQueries for SystemQueries {
    fn hostname(&self) -> Result<String> {
        match System::host_name() {
            Some(name) => Ok(short_hostname(&name).to_string()),
            None => Err(Error::Hostname),
        }
    }

    fn list_pids(&self) -> Result<String> {
        run_command("scontrol", &["listpids"])
    }

    fn show_job(&self, job_id: &str) -> Result<String> {
        run_command("scontrol", &["show", "jobs", job_id, "-d"])
    }

    fn gpu_processes(&self) -> Result<String> {
        run_command("nvidia-smi", &["pmon", "-c", "1"])
    }

    fn process_user(&self, pid: &str) -> Result<String> {
        Ok(run_command("ps", &["-o", "user", "-p", pid, "--no-headers"])?.trim().to_string())
    }

    fn proc_root(&self) -> &Path {
        &self.proc_root
    }
}

pub fn short_hostname(name: &str) -> &str {
    match name.find('.') {
        Some(ix) => &name[..ix],
        None => name,
    }
}

// Run a command to completion and return its stdout.  Failure to spawn and a non-zero exit are both
// errors; stderr is included in the error message.

fn run_command(command: &str, args: &[&str]) -> Result<String> {
    let cmdline = format!("{command} {}", args.join(" "));
    debug!("running `{cmdline}`");
    let output = match Command::new(command).args(args).output() {
        Ok(output) => output,
        Err(e) => {
            warn!("could not run `{cmdline}`: {e}");
            return Err(Error::Command { command: cmdline, message: e.to_string() });
        }
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("`{cmdline}` failed with {}: {}", output.status, stderr.trim());
        return Err(Error::Command {
            command: cmdline,
            message: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}


#[test]
fn test_short_hostname() {
    assert_eq!(short_hostname("node1751.cluster.example.com"), "node1751");
    assert_eq!(short_hostname("node1751"), "node1751");
    assert_eq!(short_hostname(""), "");
}

#[test]
fn test_command_failure() {
    match run_command("/nonexistent/binary/for/testing", &[]) {
        Err(Error::Command { command, .. }) => assert_eq!(command, "/nonexistent/binary/for/testing "),
        other => panic!("unexpected {other:?}"),
    }
}
