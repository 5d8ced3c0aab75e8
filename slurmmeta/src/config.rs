// Configuration of the metadata resolution.
//
// The file format is a JSON object with these optional fields:
//
//   metadata_source - string, one of "nvml", "slurmd", "slurmctld"; empty or null means "derive from
//                     query_slurmctld"
//   query_slurmctld - bool, legacy switch, true selects slurmctld and false selects slurmd
//   cache_duration  - integer, seconds the slurmctld snapshot is reused
//   cache_filepath  - string, where the slurmctld snapshot is cached
//
// Missing fields take the defaults of `Config::default()`.

use anyhow::Result;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where the GPU to job mapping comes from.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataSource {
    /// Processes running on the GPUs, per the driver, and their environments.
    Nvml,

    /// Processes of the jobs known to slurmd, and their environments.  Never talks to slurmctld.
    Slurmd,

    /// Job descriptions from slurmctld, cached in a file.
    Slurmctld,
}

impl FromStr for MetadataSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<MetadataSource> {
        match s {
            "nvml" => Ok(MetadataSource::Nvml),
            "slurmd" => Ok(MetadataSource::Slurmd),
            "slurmctld" => Ok(MetadataSource::Slurmctld),
            _ => anyhow::bail!("Unknown metadata source '{s}', expected nvml, slurmd or slurmctld"),
        }
    }
}

impl fmt::Display for MetadataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetadataSource::Nvml => "nvml",
            MetadataSource::Slurmd => "slurmd",
            MetadataSource::Slurmctld => "slurmctld",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The explicitly selected source, if any.  Use `metadata_source()` to get the effective one.
    #[serde(deserialize_with = "empty_as_none")]
    pub metadata_source: Option<MetadataSource>,

    /// Legacy switch, consulted only when `metadata_source` is None.
    pub query_slurmctld: bool,

    /// Seconds the slurmctld snapshot is reused.  This bounds how long GPUs are misattributed at the
    /// start and end of a job.
    pub cache_duration: u64,

    pub cache_filepath: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            metadata_source: Some(MetadataSource::Slurmctld),
            query_slurmctld: false,
            cache_duration: 60,
            cache_filepath: PathBuf::from("/tmp/slurmprocessor_cache.json"),
        }
    }
}

impl Config {
    /// Read a configuration from a JSON file.

    pub fn read_from_json(filename: &Path) -> Result<Config> {
        let file = File::open(filename)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// The effective source: the explicit one, or else the one selected by the legacy switch.

    pub fn metadata_source(&self) -> MetadataSource {
        match self.metadata_source {
            Some(source) => source,
            None if self.query_slurmctld => MetadataSource::Slurmctld,
            None => MetadataSource::Slurmd,
        }
    }

    /// The cache duration, which is zero unless the effective source is slurmctld.

    pub fn cache_duration(&self) -> u64 {
        if self.metadata_source() == MetadataSource::Slurmctld {
            self.cache_duration
        } else {
            0
        }
    }

    /// The cache file, which is None unless the effective source is slurmctld.

    pub fn cache_filepath(&self) -> Option<&Path> {
        if self.metadata_source() == MetadataSource::Slurmctld {
            Some(&self.cache_filepath)
        } else {
            None
        }
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<MetadataSource>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => MetadataSource::from_str(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_explicit_source_wins() {
        let cfg = Config {
            metadata_source: Some(MetadataSource::Nvml),
            query_slurmctld: true,
            cache_duration: 60,
            cache_filepath: PathBuf::from("/tmp/cache.json"),
        };
        assert_eq!(cfg.metadata_source(), MetadataSource::Nvml);
        assert_eq!(cfg.cache_duration(), 0);
        assert_eq!(cfg.cache_filepath(), None);
    }

    #[test]
    fn test_legacy_switch() {
        let cfg = Config {
            metadata_source: None,
            query_slurmctld: true,
            cache_duration: 120,
            cache_filepath: PathBuf::from("/tmp/cache2.json"),
        };
        assert_eq!(cfg.metadata_source(), MetadataSource::Slurmctld);
        assert_eq!(cfg.cache_duration(), 120);
        assert_eq!(cfg.cache_filepath(), Some(Path::new("/tmp/cache2.json")));

        let cfg = Config { query_slurmctld: false, ..cfg };
        assert_eq!(cfg.metadata_source(), MetadataSource::Slurmd);
        assert_eq!(cfg.cache_duration(), 0);
        assert_eq!(cfg.cache_filepath(), None);
    }

    #[test]
    fn test_deserialize() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.metadata_source(), MetadataSource::Slurmctld);

        let cfg: Config = serde_json::from_str(r#"{"metadata_source": "", "query_slurmctld": false}"#).unwrap();
        assert_eq!(cfg.metadata_source(), MetadataSource::Slurmd);

        let cfg: Config = serde_json::from_str(r#"{"metadata_source": null, "query_slurmctld": true}"#).unwrap();
        assert_eq!(cfg.metadata_source(), MetadataSource::Slurmctld);

        let cfg: Config = serde_json::from_str(
            r#"{"metadata_source": "nvml", "cache_duration": 5, "cache_filepath": "/var/tmp/c.json"}"#,
        )
        .unwrap();
        assert_eq!(cfg.metadata_source(), MetadataSource::Nvml);
        assert_eq!(cfg.cache_duration, 5);

        assert!(serde_json::from_str::<Config>(r#"{"metadata_source": "dcgm"}"#).is_err());
    }

    #[test]
    fn test_from_str() {
        assert_eq!(MetadataSource::from_str("slurmd").unwrap(), MetadataSource::Slurmd);
        assert!(MetadataSource::from_str("Slurmd").is_err());
        assert_eq!(MetadataSource::Slurmctld.to_string(), "slurmctld");
    }

    #[test]
    fn test_read_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"metadata_source": "slurmd"}"#).unwrap();
        let cfg = Config::read_from_json(&path).unwrap();
        assert_eq!(cfg.metadata_source(), MetadataSource::Slurmd);
        assert_eq!(cfg.cache_filepath, PathBuf::from("/tmp/slurmprocessor_cache.json"));

        assert!(Config::read_from_json(&dir.path().join("missing.json")).is_err());
    }
}
