use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rangeagg::{
    config::ENV_JOB_ID,
    logging::init_tracing,
    run::{run_cluster_rank, run_local},
    ClusterEnv, RunConfig, SchemaKind,
};
use std::{path::PathBuf, time::Instant};
use tracing::info;

#[derive(Clone, Copy, ValueEnum)]
enum SchemaArg {
    Vehicle,
    Pruned,
}

impl From<SchemaArg> for SchemaKind {
    fn from(s: SchemaArg) -> Self {
        match s {
            SchemaArg::Vehicle => SchemaKind::Vehicle,
            SchemaArg::Pruned => SchemaKind::Pruned,
        }
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Split a delimited file into record-aligned ranges and count records per key in parallel"
)]
struct Args {
    /// Input file, one record per line.
    #[arg(short, long)]
    input: Option<PathBuf>,
    #[arg(short, long)]
    workers: Option<usize>,
    /// Threads per worker.
    #[arg(short, long)]
    threads: Option<usize>,
    #[arg(long)]
    out_dir: Option<PathBuf>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// YAML file with any of the settings above.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    schema: Option<SchemaArg>,
    /// Column indices the pruned schema drops, e.g. `1,4,5`.
    #[arg(long, value_delimiter = ',')]
    drop_columns: Option<Vec<usize>>,
    #[arg(long)]
    key_column: Option<usize>,
    #[arg(long)]
    min_fields: Option<usize>,
    #[arg(long)]
    delimiter: Option<char>,
    /// Run only this rank; peers are separate processes sharing the run dir.
    #[arg(long)]
    rank: Option<usize>,
    #[arg(long)]
    job_id: Option<String>,
    #[arg(long, default_value = ".rangeagg_runs")]
    run_root: PathBuf,
}

impl Args {
    fn into_config(self) -> Result<(RunConfig, Option<ClusterEnv>, PathBuf)> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_yaml_file(path)?,
            None => RunConfig::default(),
        };
        config.apply_env()?;

        if let Some(v) = self.input {
            config.input = v;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.threads {
            config.threads = v;
        }
        if let Some(v) = self.out_dir {
            config.out_dir = v;
        }
        if let Some(v) = self.log_dir {
            config.log_dir = Some(v);
        }
        if let Some(v) = self.schema {
            config.schema = v.into();
        }
        if let Some(v) = self.drop_columns {
            config.drop_columns = v;
        }
        if let Some(v) = self.key_column {
            config.key_column = v;
        }
        if let Some(v) = self.min_fields {
            config.min_fields = v;
        }
        if let Some(v) = self.delimiter {
            config.delimiter = v;
        }

        let cluster = match self.rank {
            Some(rank) => Some(ClusterEnv {
                job_id: self
                    .job_id
                    .or_else(|| std::env::var(ENV_JOB_ID).ok())
                    .unwrap_or_else(|| "local".to_string()),
                rank,
                workers: config.workers,
            }),
            None => ClusterEnv::detect(),
        };
        if let Some(c) = &cluster {
            config.workers = c.workers;
        }
        Ok((config, cluster, self.run_root))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let started = Instant::now();

    let (config, cluster, run_root) = Args::parse().into_config()?;
    config.validate()?;
    info!(?config, "startup");

    match cluster {
        Some(cluster) => {
            let run_dir = run_root.join(&cluster.job_id);
            let report = tokio::task::spawn_blocking(move || run_cluster_rank(&config, &cluster, &run_dir))
                .await
                .context("rank task panicked")??;
            info!(
                rank = report.rank,
                records = report.records,
                skipped = report.skipped,
                "rank finished"
            );
            if let Some(combine) = &report.combine {
                info!(keys = combine.aggregate.len(), missing = ?combine.missing, "combined");
                println!("Total Execution Time: {:.3} seconds.", started.elapsed().as_secs_f64());
            }
        }
        None => {
            let summary = run_local(&config).await?;
            if let Some(combine) = summary.combine() {
                for (key, count) in combine.aggregate.iter() {
                    println!("{}\t{}", key, count);
                }
            }
            info!(
                records = summary.total_records(),
                skipped = summary.total_skipped(),
                "run finished"
            );
            println!("Total Execution Time: {:.3} seconds.", started.elapsed().as_secs_f64());
        }
    }
    Ok(())
}
