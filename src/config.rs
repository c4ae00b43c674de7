//! Run configuration: defaults, an optional YAML file, environment overrides
//! and cluster topology detection.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::error::SetupError;
use crate::record::{PrunedSchema, VehicleSchema};

// Environment variable names
pub const ENV_WORKERS: &str = "RANGEAGG_WORKERS";
pub const ENV_THREADS: &str = "RANGEAGG_THREADS";
pub const ENV_RANK: &str = "RANGEAGG_RANK";
pub const ENV_OUT_DIR: &str = "RANGEAGG_OUT_DIR";
pub const ENV_LOG_DIR: &str = "RANGEAGG_LOG_DIR";
pub const ENV_JOB_ID: &str = "RANGEAGG_JOB_ID";

pub const DEFAULT_OUT_DIR: &str = "output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    /// `violation_code,vehicle_year,issue_date,vehicle_age`
    Vehicle,
    /// Keep every column not in `drop_columns`.
    Pruned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub input: PathBuf,
    pub workers: usize,
    pub threads: usize,
    pub out_dir: PathBuf,
    /// Where `log_process_<rank>.txt` goes; defaults to `out_dir`.
    pub log_dir: Option<PathBuf>,
    pub delimiter: char,
    pub schema: SchemaKind,
    pub drop_columns: Vec<usize>,
    pub key_column: usize,
    pub min_fields: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            workers: 1,
            threads: num_cpus::get().max(1),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            log_dir: None,
            delimiter: ',',
            schema: SchemaKind::Vehicle,
            drop_columns: Vec::new(),
            key_column: 3,
            min_fields: 4,
        }
    }
}

impl RunConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Overlay `RANGEAGG_*` variables that are set.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(n) = env_usize(ENV_WORKERS)? {
            self.workers = n;
        }
        if let Some(n) = env_usize(ENV_THREADS)? {
            self.threads = n;
        }
        if let Ok(dir) = env::var(ENV_OUT_DIR) {
            self.out_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        if self.input.as_os_str().is_empty() {
            return Err(SetupError::InvalidTopology("no input path configured".into()));
        }
        if self.workers == 0 {
            return Err(SetupError::InvalidTopology("worker count must be at least 1".into()));
        }
        if self.threads == 0 {
            return Err(SetupError::InvalidTopology("thread count must be at least 1".into()));
        }
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.out_dir.clone())
    }

    pub fn vehicle_schema(&self) -> VehicleSchema {
        VehicleSchema::new(self.delimiter)
    }

    pub fn pruned_schema(&self) -> PrunedSchema {
        PrunedSchema::new(
            self.delimiter,
            self.min_fields,
            self.drop_columns.iter().copied(),
            self.key_column,
        )
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<usize>()
            .map(Some)
            .with_context(|| format!("{} is not a number: {:?}", name, v)),
        Err(_) => Ok(None),
    }
}

/// Position of this process in a multi-process job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEnv {
    pub job_id: String,
    pub rank: usize,
    pub workers: usize,
}

impl ClusterEnv {
    /// Slurm variables first, then explicit `RANGEAGG_RANK`/`RANGEAGG_WORKERS`.
    /// `None` means every rank runs inside this process.
    pub fn detect() -> Option<Self> {
        if let Ok(job_id) = env::var("SLURM_JOB_ID") {
            let workers = env::var("SLURM_NTASKS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(1);
            let rank = env::var("SLURM_PROCID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            return Some(Self {
                job_id,
                rank,
                workers: workers.max(1),
            });
        }
        let rank = env::var(ENV_RANK).ok()?.parse::<usize>().ok()?;
        let workers = env::var(ENV_WORKERS).ok()?.parse::<usize>().ok()?;
        let job_id = env::var(ENV_JOB_ID).unwrap_or_else(|_| "local".to_string());
        Some(Self {
            job_id,
            rank,
            workers: workers.max(1),
        })
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        if self.workers == 0 {
            return Err(SetupError::InvalidTopology("worker count must be at least 1".into()));
        }
        if self.rank >= self.workers {
            return Err(SetupError::InvalidTopology(format!(
                "rank {} out of range for {} workers",
                self.rank, self.workers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn yaml_overrides_defaults() -> Result<()> {
        let mut tmp = NamedTempFile::new()?;
        writeln!(
            tmp,
            "input: data/violations.csv\nworkers: 3\nschema: pruned\ndrop_columns: [1, 2]\nkey_column: 0\ndelimiter: ';'"
        )?;
        let cfg = RunConfig::from_yaml_file(tmp.path())?;
        assert_eq!(cfg.input, PathBuf::from("data/violations.csv"));
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.schema, SchemaKind::Pruned);
        assert_eq!(cfg.drop_columns, vec![1, 2]);
        assert_eq!(cfg.delimiter, ';');
        // untouched fields keep their defaults
        assert_eq!(cfg.out_dir, PathBuf::from(DEFAULT_OUT_DIR));
        assert_eq!(cfg.log_dir(), PathBuf::from(DEFAULT_OUT_DIR));
        Ok(())
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let cfg = RunConfig {
            input: "in.csv".into(),
            workers: 0,
            ..RunConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(SetupError::InvalidTopology(_))));
    }

    #[test]
    fn cluster_rank_must_fall_inside_topology() {
        let env = |rank, workers| ClusterEnv {
            job_id: "job".into(),
            rank,
            workers,
        };
        assert!(env(1, 2).validate().is_ok());
        assert!(matches!(env(2, 2).validate(), Err(SetupError::InvalidTopology(_))));
        assert!(matches!(env(5, 2).validate(), Err(SetupError::InvalidTopology(_))));
        assert!(env(0, 0).validate().is_err());
    }

    #[test]
    fn validate_requires_input() {
        assert!(RunConfig::default().validate().is_err());
    }

    #[test]
    fn bad_yaml_is_an_error() -> Result<()> {
        let mut tmp = NamedTempFile::new()?;
        writeln!(tmp, "workers: many")?;
        assert!(RunConfig::from_yaml_file(tmp.path()).is_err());
        Ok(())
    }
}
