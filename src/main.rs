use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use set_view::core::{ChangeRecord, PartitionId, PartitionState, ViewKey};
use set_view::index::CompactionTarget;
use set_view::query::{reduce, Grouping, MergeRequest, Stale};
use set_view::{Collaborators, EngineConfig, SetView};

/// Partitioned set-view index maintenance engine
#[derive(Parser, Debug)]
#[command(name = "set-view")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件（TOML）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 数据目录（覆盖配置文件）
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show partition states, row counts and engine counters
    Status,

    /// Burst-submit change records (JSON lines) and checkpoint
    Ingest {
        /// JSON lines file; `-` reads stdin
        file: PathBuf,

        /// Activate partitions that do not exist yet
        #[arg(long)]
        activate: bool,
    },

    /// Merge-read the view and print rows as JSON lines
    Query {
        #[arg(long, default_value = "ok")]
        stale: Stale,

        /// Include passive partitions
        #[arg(long)]
        passive: bool,

        /// Restrict to these partitions (comma separated)
        #[arg(long, value_delimiter = ',')]
        partitions: Vec<u16>,

        /// Skip unavailable partitions named in --partitions instead of failing
        #[arg(long)]
        skip_unavailable: bool,

        /// Built-in reducer: _count, _sum, _stats
        #[arg(long)]
        reduce: Option<String>,

        /// Collapse the whole range into one reduced row
        #[arg(long, requires = "reduce")]
        reduce_all: bool,

        /// Start key (JSON)
        #[arg(long)]
        start_key: Option<String>,

        /// End key (JSON)
        #[arg(long)]
        end_key: Option<String>,

        #[arg(long)]
        descending: bool,

        #[arg(long, default_value_t = 0)]
        skip: usize,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Move a partition to a new state
    SetState {
        partition: u16,
        state: PartitionState,
    },

    /// Compact one partition, or all indexable partitions
    Compact {
        #[arg(long)]
        partition: Option<u16>,
    },
}

fn parse_key(raw: &Option<String>) -> anyhow::Result<Option<ViewKey>> {
    raw.as_deref()
        .map(|s| ViewKey::from_json(s).with_context(|| format!("invalid JSON key: {}", s)))
        .transpose()
}

fn read_records(path: &PathBuf) -> anyhow::Result<Vec<ChangeRecord>> {
    let reader: Box<dyn BufRead> = if path.as_os_str() == "-" {
        Box::new(std::io::BufReader::new(std::io::stdin()))
    } else {
        let f = std::fs::File::open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Box::new(std::io::BufReader::new(f))
    };
    let mut out = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: ChangeRecord = serde_json::from_str(&line)
            .with_context(|| format!("line {}: invalid change record", n + 1))?;
        out.push(rec);
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(p) => EngineConfig::from_toml_file(p)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let view = SetView::open(config, Collaborators::default()).await?;

    match cli.command {
        Commands::Status => {
            println!("{}", view.info());
        }

        Commands::Ingest { file, activate } => {
            let records = read_records(&file)?;
            if activate {
                let missing: Vec<_> = records
                    .iter()
                    .map(|r| r.partition)
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .filter(|p| view.partition_state(*p) == PartitionState::Missing)
                    .map(|p| (p, PartitionState::Active))
                    .collect();
                if !missing.is_empty() {
                    view.set_partition_states(missing).await?;
                }
            }

            let total = records.len();
            let report = view.submit_records(records).await;
            // 快速失败的 burst 可能还有分区在后台跑
            let partitions: Vec<_> = report.outcomes.keys().copied().collect();
            view.coordinator().drain(&partitions).await;

            for (p, e) in report.failed() {
                tracing::warn!("Partition {} rejected: {}", p, e);
            }
            view.checkpoint().await?;
            info!(
                "Ingested {} records into {} partitions ({} failed)",
                total,
                partitions.len(),
                report.failed().len()
            );
        }

        Commands::Query {
            stale,
            passive,
            partitions,
            skip_unavailable,
            reduce: reducer,
            reduce_all,
            start_key,
            end_key,
            descending,
            skip,
            limit,
        } => {
            let mut req = MergeRequest::new()
                .stale(stale)
                .key_range(parse_key(&start_key)?, parse_key(&end_key)?)
                .skip(skip);
            if passive {
                req = req.with_passive();
            }
            if !partitions.is_empty() {
                req = req.include(partitions.into_iter().map(PartitionId));
            }
            if skip_unavailable {
                req = req.skip_unavailable();
            }
            if descending {
                req = req.descending();
            }
            if let Some(n) = limit {
                req = req.limit(n);
            }
            if let Some(name) = reducer {
                let r = reduce::builtin(&name)
                    .with_context(|| format!("unknown reducer: {}", name))?;
                let grouping = if reduce_all {
                    Grouping::All
                } else {
                    Grouping::Exact
                };
                req = req.reduce(r, grouping);
            }

            let stream = view.merge_read(req).await?;
            for (p, state) in &stream.selection().skipped {
                tracing::warn!("Skipped partition {} ({})", p, state);
            }
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for row in stream.rows() {
                serde_json::to_writer(&mut out, &row)?;
                out.write_all(b"\n")?;
            }
        }

        Commands::SetState { partition, state } => {
            let change = view
                .set_partition_state(PartitionId(partition), state)
                .await?;
            view.checkpoint().await?;
            println!("partition {}: {} -> {}", change.partition, change.from, change.to);
        }

        Commands::Compact { partition } => {
            let target = match partition {
                Some(p) => CompactionTarget::Partition(PartitionId(p)),
                None => CompactionTarget::Merged,
            };
            let report = view.run_compaction(target).await?;
            for c in &report.compacted {
                println!(
                    "partition {}: {} -> {} slots ({} replayed)",
                    c.partition,
                    c.before.live_entries + c.before.tombstones,
                    c.after.live_entries + c.after.tombstones,
                    c.replayed
                );
            }
            for (p, e) in &report.aborted {
                println!("partition {}: {}", p, e);
            }
            for p in &report.disposed {
                println!("partition {}: disposed", p);
            }
            view.run_cleanup(false).await?;
            view.checkpoint().await?;
        }
    }

    Ok(())
}
