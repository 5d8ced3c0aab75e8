// This library maps the GPUs of a compute node to the Slurm jobs that occupy them, and attaches the
// job metadata to telemetry records that carry a GPU index.
//
// There are three ways of finding out which job runs on which GPU (see sources.rs): asking the
// driver which processes run on each GPU and reading their environments, asking slurmd which
// processes belong to which job and reading their environments, or asking slurmctld for the full
// job descriptions.  The last one is expensive and is cached in a file for a configurable time.
//
// TODO (normal pri)
//
//  - The slurmctld blocks of a multi-node job carry one `Nodes=... GRES=...` line per node, but all
//    GRES lines of a matching block are attributed to the local host.

mod aggregate;
mod cache;
mod config;
mod dates;
mod enrich;
mod gres;
mod hostlist;
mod nvml;
mod procenv;
mod queries;
mod slurmctld;
mod slurmd;
mod sources;
mod telemetry;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Matching of host names against Slurm hostlists, and extraction of the hostlist of a job block.

pub use hostlist::{hostlist_of, hostname_in_list};

// Extraction of GPU indices from a GRES descriptor.

pub use gres::parse_gres;

// Reading and decoding /proc/<pid>/environ.

pub use procenv::{lookup_var, parse_environ, read_environ};

// The file cache for the slurmctld snapshot.

pub use cache::{read_cache, read_snapshot, write_snapshot};

pub use config::{Config, MetadataSource};

pub use dates::{now, Clock, SystemClock};

pub use queries::{NodeQueries, SystemQueries};

// Resolve a snapshot with the strategy selected by the configuration.

pub use sources::{resolve, Resolution};

pub use aggregate::aggregate;

pub use enrich::{
    Enricher, RecordKind, SlurmProcessor, ARRAY_JOB_ID, ARRAY_TASK_ID, SLURM_ACCOUNT, SLURM_JOB_ID,
    SLURM_JOB_NAME, SLURM_NUM_NODES, SLURM_PARTITION, SLURM_QOS, SLURM_USER, UUID,
};

pub use telemetry::{
    AttrValue, Attributed, Attributes, DataPoints, ExponentialHistogramDataPoint, HistogramDataPoint, LogRecord,
    Logs, Metric, Metrics, NumberDataPoint, Resource, ResourceLogs, ResourceMetrics, ResourceSpans,
    ScopeLogs, ScopeMetrics, ScopeSpans, Span, SummaryDataPoint, Traces,
};

/// The metadata of one Slurm job, as far as it is relevant for attributing GPU telemetry.
///
/// All fields are strings.  Slurm does not promise that IDs are numeric, and several fields may be
/// empty: the NVML source only knows what is in the process environment, the slurmd source only
/// knows the job ID and user, and the array fields are empty for jobs that are not array tasks.
///
/// The serialized field names are those of the cache file.

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMetadata {
    #[serde(rename = "JobID")]
    pub job_id: String,

    #[serde(rename = "JobName")]
    pub job_name: String,

    #[serde(rename = "QOS")]
    pub qos: String,

    #[serde(rename = "User")]
    pub user: String,

    #[serde(rename = "Partition")]
    pub partition: String,

    #[serde(rename = "Account")]
    pub account: String,

    #[serde(rename = "NumNodes")]
    pub num_nodes: String,

    #[serde(rename = "ArrayJobID")]
    pub array_job_id: String,

    #[serde(rename = "ArrayTaskID")]
    pub array_task_id: String,
}

impl JobMetadata {
    /// The fields paired with the attribute keys they are published under, in a fixed order.

    pub fn fields(&self) -> [(&'static str, &str); 9] {
        [
            (SLURM_JOB_ID, &self.job_id),
            (SLURM_JOB_NAME, &self.job_name),
            (SLURM_QOS, &self.qos),
            (ARRAY_JOB_ID, &self.array_job_id),
            (ARRAY_TASK_ID, &self.array_task_id),
            (SLURM_USER, &self.user),
            (SLURM_PARTITION, &self.partition),
            (SLURM_ACCOUNT, &self.account),
            (SLURM_NUM_NODES, &self.num_nodes),
        ]
    }
}

/// The result of one resolution cycle: a map from GPU index (in canonical decimal form) to the job
/// on that GPU.  A GPU without an entry is idle, or nothing is known about it.

pub type Snapshot = BTreeMap<String, JobMetadata>;

/// The values of every JobMetadata field across all jobs of a snapshot, each list sorted and free
/// of duplicates.  This is what is reported for records that are not about any particular GPU.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobMetadataList {
    pub job_id: Vec<String>,
    pub job_name: Vec<String>,
    pub qos: Vec<String>,
    pub user: Vec<String>,
    pub partition: Vec<String>,
    pub account: Vec<String>,
    pub num_nodes: Vec<String>,
    pub array_job_id: Vec<String>,
    pub array_task_id: Vec<String>,
}

impl JobMetadataList {
    /// Same order and keys as `JobMetadata::fields`.

    pub fn fields(&self) -> [(&'static str, &[String]); 9] {
        [
            (SLURM_JOB_ID, &self.job_id),
            (SLURM_JOB_NAME, &self.job_name),
            (SLURM_QOS, &self.qos),
            (ARRAY_JOB_ID, &self.array_job_id),
            (ARRAY_TASK_ID, &self.array_task_id),
            (SLURM_USER, &self.user),
            (SLURM_PARTITION, &self.partition),
            (SLURM_ACCOUNT, &self.account),
            (SLURM_NUM_NODES, &self.num_nodes),
        ]
    }
}

/// Errors that leave the library.  Parse problems never show up here, they are logged and the
/// offending unit is skipped.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A process, its environment file, or an environment variable does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An external command could not be run or exited unsuccessfully.
    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not determine the host name")]
    Hostname,
}

pub type Result<T> = std::result::Result<T, Error>;
