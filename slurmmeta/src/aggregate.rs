use crate::{JobMetadata, JobMetadataList, Snapshot};

use itertools::Itertools;

/// Collect, for each field, the distinct values over all jobs in the snapshot, sorted.  Empty values
/// are values too.

pub fn aggregate(snapshot: &Snapshot) -> JobMetadataList {
    let column = |f: fn(&JobMetadata) -> &String| -> Vec<String> {
        snapshot.values().map(f).sorted().dedup().cloned().collect()
    };
    JobMetadataList {
        job_id: column(|m| &m.job_id),
        job_name: column(|m| &m.job_name),
        qos: column(|m| &m.qos),
        user: column(|m| &m.user),
        partition: column(|m| &m.partition),
        account: column(|m| &m.account),
        num_nodes: column(|m| &m.num_nodes),
        array_job_id: column(|m| &m.array_job_id),
        array_task_id: column(|m| &m.array_task_id),
    }
}
