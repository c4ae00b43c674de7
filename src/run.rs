use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info, instrument, warn};

use crate::{
    aggregate::{aggregate_parallel, CountByKey},
    combine::{combine_outputs, CombineReport},
    config::{ClusterEnv, RunConfig, SchemaKind},
    error::SetupError,
    logging::{EventLog, FileEventLog},
    loader::load_range,
    output::{write_aggregate, write_cleaned, write_throughput},
    partition::{plan_ranges, OffsetTable, WorkerRange},
    record::RecordSchema,
    transport::{CompletionBarrier, FsTransport, LocalFabric, RangeChannel},
};

pub const COORDINATOR_RANK: usize = 0;

/// Every local rank holds a blocking-pool thread until the barrier, so the
/// count may not exceed tokio's default blocking pool size.
pub const MAX_LOCAL_WORKERS: usize = 512;

/// What a rank does beyond loading and aggregating its own range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// Builds the offset table, scatters ranges and combines after the barrier.
    Coordinator,
    /// Receives its range from the coordinator.
    Worker,
}

impl Role {
    pub fn for_rank(rank: usize) -> Self {
        if rank == COORDINATOR_RANK {
            Role::Coordinator
        } else {
            Role::Worker
        }
    }

    fn acquire_range<C: RangeChannel + ?Sized>(
        self,
        ctx: &RankContext,
        channel: &C,
    ) -> Result<WorkerRange> {
        match self {
            Role::Coordinator => {
                let table = OffsetTable::build(&ctx.input)?;
                let ranges = plan_ranges(&table, ctx.workers)?;
                for (rank, range) in ranges.iter().enumerate() {
                    if rank != ctx.rank {
                        channel.send(rank, *range)?;
                    }
                }
                info!(
                    records = table.record_count(),
                    workers = ctx.workers,
                    "distributed ranges"
                );
                Ok(ranges[ctx.rank])
            }
            Role::Worker => Ok(channel.receive()?),
        }
    }

    fn after_barrier(self, ctx: &RankContext) -> Result<Option<CombineReport>> {
        match self {
            Role::Coordinator => {
                let report = combine_outputs(&ctx.out_dir, ctx.workers, ctx.rank, ctx.log.as_ref())?;
                Ok(Some(report))
            }
            Role::Worker => Ok(None),
        }
    }
}

/// Everything one rank needs to know about the run.
#[derive(Clone)]
pub struct RankContext {
    pub rank: usize,
    pub workers: usize,
    pub threads: usize,
    pub input: PathBuf,
    pub out_dir: PathBuf,
    pub log: Arc<dyn EventLog>,
}

impl RankContext {
    pub fn from_config(config: &RunConfig, rank: usize, workers: usize, log: Arc<dyn EventLog>) -> Self {
        Self {
            rank,
            workers,
            threads: config.threads,
            input: config.input.clone(),
            out_dir: config.out_dir.clone(),
            log,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankReport {
    pub rank: usize,
    pub role: Role,
    pub range: WorkerRange,
    pub lines: u64,
    pub records: u64,
    pub skipped: u64,
    pub counts: CountByKey,
    /// Per-rank output files that could not be written.
    pub output_errors: usize,
    pub elapsed: Duration,
    pub combine: Option<CombineReport>,
}

/// Abandons the barrier if the rank leaves before reaching it, panics included.
struct AbandonGuard<'a, B: CompletionBarrier + ?Sized> {
    barrier: &'a B,
    rank: usize,
    armed: bool,
}

impl<B: CompletionBarrier + ?Sized> Drop for AbandonGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.barrier.abandon(self.rank);
        }
    }
}

/// One rank's whole pipeline: range, load, aggregate, persist, barrier and,
/// on the coordinator, combine.
#[instrument(level = "info", skip_all, fields(rank = ctx.rank))]
pub fn run_rank<S, C, B>(ctx: &RankContext, schema: &S, channel: &C, barrier: &B) -> Result<RankReport>
where
    S: RecordSchema,
    C: RangeChannel + ?Sized,
    B: CompletionBarrier + ?Sized,
{
    let started = Instant::now();
    let role = Role::for_rank(ctx.rank);
    let log = ctx.log.as_ref();
    log.record("Worker initialized.", ctx.rank);

    let mut guard = AbandonGuard {
        barrier,
        rank: ctx.rank,
        armed: true,
    };
    let mut report = match local_phase(role, ctx, schema, channel) {
        Ok(report) => report,
        Err(e) => {
            error!(rank = ctx.rank, error = %format!("{:#}", e), "rank failed");
            log.record(&format!("Aborting: {:#}", e), ctx.rank);
            if role == Role::Coordinator {
                channel.close();
            }
            return Err(e);
        }
    };

    let waited = Instant::now();
    let arrived = barrier.await_all(ctx.rank);
    // a rank that failed to arrive still has to release the others
    guard.armed = arrived.is_err();
    arrived.with_context(|| format!("rank {} waiting for all ranks", ctx.rank))?;
    info!(rank = ctx.rank, wait = ?waited.elapsed(), "all ranks finished");

    report.combine = role.after_barrier(ctx)?;
    report.elapsed = started.elapsed();
    log.record("Finalizing worker.", ctx.rank);
    Ok(report)
}

fn local_phase<S, C>(role: Role, ctx: &RankContext, schema: &S, channel: &C) -> Result<RankReport>
where
    S: RecordSchema,
    C: RangeChannel + ?Sized,
{
    let log = ctx.log.as_ref();
    let range = role.acquire_range(ctx, channel)?;
    log.record(
        &format!("Assigned byte range [{}, {}).", range.start, range.end),
        ctx.rank,
    );

    let loaded = load_range(&ctx.input, range, schema, log, ctx.rank)?;
    log.record(
        &format!("Starting to process records. Total records: {}", loaded.records.len()),
        ctx.rank,
    );

    let merged = aggregate_parallel(&loaded.records, ctx.threads, schema)?;
    log.record(
        &format!("Finished processing records. Total records processed: {}", merged.records),
        ctx.rank,
    );
    for (key, count) in merged.counts.iter() {
        log.record(
            &format!("{}: {}, Violations: {}", schema.key_label(), key, count),
            ctx.rank,
        );
    }

    let mut output_errors = 0;
    let writes: [(&str, Result<()>); 3] = [
        ("cleaned data", write_cleaned(&ctx.out_dir, ctx.rank, &merged.cleaned).map(|_| ())),
        ("aggregate", write_aggregate(&ctx.out_dir, ctx.rank, &merged.counts)),
        ("throughput", write_throughput(&ctx.out_dir, ctx.rank, &loaded.per_second)),
    ];
    for (what, res) in writes {
        if let Err(e) = res {
            output_errors += 1;
            warn!(rank = ctx.rank, error = %format!("{:#}", e), "failed writing {}", what);
            log.record(&format!("Failed to write {} output: {:#}", what, e), ctx.rank);
        }
    }

    Ok(RankReport {
        rank: ctx.rank,
        role,
        range,
        lines: loaded.lines,
        records: merged.records,
        skipped: loaded.skipped,
        counts: merged.counts,
        output_errors,
        elapsed: Duration::ZERO,
        combine: None,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ranks: Vec<RankReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn combine(&self) -> Option<&CombineReport> {
        self.ranks.iter().find_map(|r| r.combine.as_ref())
    }

    pub fn total_records(&self) -> u64 {
        self.ranks.iter().map(|r| r.records).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.ranks.iter().map(|r| r.skipped).sum()
    }
}

/// Run every rank of `config` as a blocking task of the current runtime.
pub async fn run_local(config: &RunConfig) -> Result<RunSummary> {
    config.validate()?;
    if config.workers > MAX_LOCAL_WORKERS {
        return Err(SetupError::InvalidTopology(format!(
            "{} local workers exceed the limit of {}; run ranks as separate processes instead",
            config.workers, MAX_LOCAL_WORKERS
        ))
        .into());
    }
    match config.schema {
        SchemaKind::Vehicle => run_local_with(config, Arc::new(config.vehicle_schema())).await,
        SchemaKind::Pruned => run_local_with(config, Arc::new(config.pruned_schema())).await,
    }
}

async fn run_local_with<S: RecordSchema + 'static>(config: &RunConfig, schema: Arc<S>) -> Result<RunSummary> {
    let started = Instant::now();
    prepare_dirs(config)?;
    let log: Arc<dyn EventLog> = Arc::new(FileEventLog::new(config.log_dir()));
    let (endpoints, barrier) = LocalFabric::connect(config.workers);

    info!(workers = config.workers, threads = config.threads, input = %config.input.display(), "starting local run");
    let handles: Vec<_> = endpoints
        .into_iter()
        .map(|endpoint| {
            let ctx = RankContext::from_config(config, endpoint.rank(), config.workers, Arc::clone(&log));
            let schema = Arc::clone(&schema);
            let barrier = Arc::clone(&barrier);
            tokio::task::spawn_blocking(move || run_rank(&ctx, schema.as_ref(), &endpoint, barrier.as_ref()))
        })
        .collect();

    let mut ranks = Vec::with_capacity(handles.len());
    let mut first_failure = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(report)) => ranks.push(report),
            Ok(Err(e)) => {
                error!(rank, error = %format!("{:#}", e), "rank failed");
                first_failure.get_or_insert(e.context(format!("rank {} failed", rank)));
            }
            Err(join) => {
                error!(rank, error = %join, "rank panicked");
                first_failure.get_or_insert(anyhow::anyhow!("rank {} panicked: {}", rank, join));
            }
        }
    }
    if let Some(e) = first_failure {
        return Err(e);
    }

    let summary = RunSummary {
        ranks,
        elapsed: started.elapsed(),
    };
    info!(
        records = summary.total_records(),
        skipped = summary.total_skipped(),
        elapsed = ?summary.elapsed,
        "local run finished"
    );
    Ok(summary)
}

/// Run the single rank `cluster.rank` of a multi-process job that shares
/// `run_dir` with its peers.
pub fn run_cluster_rank(config: &RunConfig, cluster: &ClusterEnv, run_dir: &Path) -> Result<RankReport> {
    config.validate()?;
    cluster.validate()?;
    prepare_dirs(config)?;
    let transport = FsTransport::connect(run_dir, cluster.rank, cluster.workers)?;
    let log: Arc<dyn EventLog> = Arc::new(FileEventLog::new(config.log_dir()));
    let ctx = RankContext::from_config(config, cluster.rank, cluster.workers, log);
    info!(job_id = %cluster.job_id, rank = cluster.rank, workers = cluster.workers, "starting cluster rank");
    match config.schema {
        SchemaKind::Vehicle => run_rank(&ctx, &config.vehicle_schema(), &transport, &transport),
        SchemaKind::Pruned => run_rank(&ctx, &config.pruned_schema(), &transport, &transport),
    }
}

fn prepare_dirs(config: &RunConfig) -> Result<()> {
    for dir in [config.out_dir.clone(), config.log_dir()] {
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(())
}
