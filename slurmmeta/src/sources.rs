// Dispatch to the metadata source selected by the configuration.

use crate::config::{Config, MetadataSource};
use crate::dates::Clock;
use crate::queries::NodeQueries;
use crate::{nvml, slurmctld, slurmd, Result, Snapshot};

use serde::Serialize;
use tracing::{info, warn};

/// The outcome of one resolution cycle.
///
/// `job_ids` are the jobs with processes on this host, in the order slurmd lists them; the NVML source
/// leaves it empty.  `warnings` describe what could not be resolved.  Whatever was resolved is in
/// `snapshot` even if there are warnings.

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub snapshot: Snapshot,
    pub job_ids: Vec<String>,
    pub warnings: Vec<String>,
}

impl Resolution {
    pub(crate) fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

/// Compute a fresh snapshot.  Only the slurmctld source can fail, see slurmctld::resolve.

pub fn resolve(config: &Config, queries: &dyn NodeQueries, clock: &dyn Clock) -> Result<Resolution> {
    let source = config.metadata_source();
    info!("Metadata source: {source}");
    match source {
        MetadataSource::Nvml => Ok(nvml::resolve(queries)),
        MetadataSource::Slurmd => Ok(slurmd::resolve(queries)),
        MetadataSource::Slurmctld => {
            slurmctld::resolve(queries, &config.cache_filepath, config.cache_duration(), clock)
        }
    }
}
