// Attach job metadata to telemetry records.
//
// A record that names a GPU in its "gpu" attribute gets the metadata of the job on that GPU, if any.
// A metric data point that names no GPU is about the node as a whole and gets, for each field, the
// list of values over all jobs on the node.  Spans and log records without a GPU are left alone.
// Every resource is stamped with the IDs of all jobs on the node.

use crate::aggregate::aggregate;
use crate::config::Config;
use crate::dates::Clock;
use crate::queries::NodeQueries;
use crate::sources::{resolve, Resolution};
use crate::telemetry::{AttrValue, Attributed, Logs, Metrics, Resource, Traces};
use crate::{JobMetadataList, Snapshot};

use std::cell::OnceCell;
use tracing::{debug, error, info};

pub const SLURM_JOB_ID: &str = "job_id";
pub const SLURM_JOB_NAME: &str = "job_name";
pub const SLURM_QOS: &str = "qos";
pub const ARRAY_JOB_ID: &str = "array_job_id";
pub const ARRAY_TASK_ID: &str = "array_task_id";
pub const SLURM_USER: &str = "username";
pub const SLURM_PARTITION: &str = "partition";
pub const SLURM_ACCOUNT: &str = "account";
pub const SLURM_NUM_NODES: &str = "num_nodes";
pub const UUID: &str = "uuid";

// Attributes read from the records.
const GPU_INDEX: &str = "gpu";
const GPU_UUID: &str = "UUID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Span,
    LogRecord,
    DataPoint,
}

/// Enriches the records of one batch from one snapshot.

pub struct Enricher {
    snapshot: Snapshot,
    job_ids: Vec<String>,
    aggregated: OnceCell<JobMetadataList>,
}

impl Enricher {
    pub fn new(snapshot: Snapshot, job_ids: Vec<String>) -> Enricher {
        Enricher { snapshot, job_ids, aggregated: OnceCell::new() }
    }

    pub fn from_resolution(resolution: Resolution) -> Enricher {
        Enricher::new(resolution.snapshot, resolution.job_ids)
    }

    pub fn enrich_record(&self, kind: RecordKind, record: &mut dyn Attributed) {
        match record.attributes().get(GPU_INDEX).map(AttrValue::as_key) {
            Some(Some(gpu)) => {
                if let Some(metadata) = self.snapshot.get(&gpu) {
                    let attributes = record.attributes_mut();
                    for (key, value) in metadata.fields() {
                        attributes.insert(key.to_string(), AttrValue::from(value));
                    }
                }
            }
            Some(None) => {
                debug!("ignoring gpu attribute that is neither string nor integer");
            }
            None => {
                if kind == RecordKind::DataPoint && !self.snapshot.is_empty() {
                    let all = self.aggregated.get_or_init(|| aggregate(&self.snapshot));
                    let attributes = record.attributes_mut();
                    for (key, values) in all.fields() {
                        attributes.insert(key.to_string(), AttrValue::List(values.to_vec()));
                    }
                }
            }
        }

        if let Some(uuid) = record.attributes().get(GPU_UUID).cloned() {
            record.attributes_mut().insert(UUID.to_string(), uuid);
        }
    }

    pub fn enrich_resource(&self, resource: &mut Resource) {
        if !self.job_ids.is_empty() {
            resource.attributes.insert(SLURM_JOB_ID.to_string(), AttrValue::Str(self.job_ids.join(",")));
        }
    }
}

/// Resolves the metadata once per batch and enriches every record of the batch.

pub struct SlurmProcessor {
    config: Config,
    queries: Box<dyn NodeQueries>,
    clock: Box<dyn Clock>,
}

impl SlurmProcessor {
    pub fn new(config: Config, queries: Box<dyn NodeQueries>, clock: Box<dyn Clock>) -> SlurmProcessor {
        SlurmProcessor { config, queries, clock }
    }

    pub fn start(&self) {
        info!(
            source = %self.config.metadata_source(),
            cache_duration = self.config.cache_duration(),
            cache_filepath = ?self.config.cache_filepath(),
            "Starting slurm processor"
        );
    }

    pub fn shutdown(&self) {
        info!("Shutting down slurm processor");
    }

    /// Run one resolution.  If it fails the batch is passed through unchanged.

    pub fn resolve(&self) -> Enricher {
        match resolve(&self.config, self.queries.as_ref(), self.clock.as_ref()) {
            Ok(resolution) => Enricher::from_resolution(resolution),
            Err(e) => {
                error!("Error getting per GPU slurm job ids: {e}");
                Enricher::new(Snapshot::new(), vec![])
            }
        }
    }

    pub fn process_traces(&self, traces: &mut Traces) {
        let enricher = self.resolve();
        for rs in traces.resource_spans.iter_mut() {
            enricher.enrich_resource(&mut rs.resource);
            for span in rs.scope_spans.iter_mut().flat_map(|ss| ss.spans.iter_mut()) {
                enricher.enrich_record(RecordKind::Span, span);
            }
        }
    }

    pub fn process_logs(&self, logs: &mut Logs) {
        let enricher = self.resolve();
        for rl in logs.resource_logs.iter_mut() {
            enricher.enrich_resource(&mut rl.resource);
            for record in rl.scope_logs.iter_mut().flat_map(|sl| sl.log_records.iter_mut()) {
                enricher.enrich_record(RecordKind::LogRecord, record);
            }
        }
    }

    pub fn process_metrics(&self, metrics: &mut Metrics) {
        let enricher = self.resolve();
        for rm in metrics.resource_metrics.iter_mut() {
            enricher.enrich_resource(&mut rm.resource);
            for metric in rm.scope_metrics.iter_mut().flat_map(|sm| sm.metrics.iter_mut()) {
                metric.for_each_data_point(|point| enricher.enrich_record(RecordKind::DataPoint, point));
            }
        }
    }
}
