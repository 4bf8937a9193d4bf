use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use feedmerge::merger::DEFAULT_PAGE_SIZE;
use feedmerge::pipeline::{append_artifacts, find_artifacts, run_ingest, table_name, today_stamp};
use feedmerge::{append, collapse_duplicates, log, merge_files, AppendOptions, MergeOptions, RelationalStore, RunReport, Settings};

#[derive(Parser, Debug)]
#[command(name = "feedmerge")]
#[command(about = "Flatten XML feeds and merge them into SQLite stores")]
struct Args {
    /// Write logs to a daily-rolling file in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flatten every configured feed, append the artifacts and deduplicate
    Ingest {
        #[arg(long)]
        config: PathBuf,
        /// Value for the scraped_date column (DD-MM-YYYY), today if omitted
        #[arg(long)]
        date: Option<String>,
    },
    /// Merge two stores into a fresh one
    Merge {
        a: PathBuf,
        b: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,
        /// Skip collapsing duplicate rows afterwards
        #[arg(long)]
        no_dedup: bool,
    },
    /// Collapse duplicate rows in every table of a store
    Dedup { db: PathBuf },
    /// Append a parquet artifact, or every artifact under a directory, to a store
    Append {
        artifact: PathBuf,
        db: PathBuf,
        /// Destination table, the artifact's file stem if omitted.
        /// Ignored for a directory, where each artifact goes to its own stem.
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        date: Option<String>,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let settings = match &args.command {
        Command::Ingest { config, .. } => Some(
            Settings::load(Some(config.as_path())).with_context(|| format!("loading settings from {}", config.display()))?,
        ),
        _ => None,
    };
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| settings.as_ref().and_then(|s| s.log_dir.clone()));
    let _guard = log::init(log_dir.as_deref());

    let report = match args.command {
        Command::Ingest { date, .. } => {
            let settings = settings.unwrap_or_default();
            run_ingest(&settings, date).context("ingest run")?
        }
        Command::Merge {
            a,
            b,
            output,
            page_size,
            no_dedup,
        } => {
            let opts = MergeOptions {
                page_size,
                ..MergeOptions::default()
            };
            let (mut store, mut report) = merge_files(&a, &b, &output, opts)
                .with_context(|| format!("merging {} and {}", a.display(), b.display()))?;
            if !no_dedup {
                report.extend(collapse_duplicates(&mut store).context("deduplicating merged store")?);
            }
            report
        }
        Command::Dedup { db } => {
            let mut store = RelationalStore::open(&db).with_context(|| format!("opening {}", db.display()))?;
            collapse_duplicates(&mut store).context("deduplicating store")?
        }
        Command::Append {
            artifact,
            db,
            table,
            date,
        } => {
            let mut store = RelationalStore::open(&db).with_context(|| format!("opening {}", db.display()))?;
            let opts = AppendOptions {
                scraped_date: Some(date.unwrap_or_else(today_stamp)),
                ..AppendOptions::default()
            };
            if artifact.is_dir() {
                let found =
                    find_artifacts(&artifact).with_context(|| format!("listing artifacts in {}", artifact.display()))?;
                append_artifacts(&found, &mut store, &opts)
            } else {
                let table = table
                    .or_else(|| table_name(&artifact))
                    .with_context(|| format!("no table name for {}", artifact.display()))?;
                let summary = append(&artifact, &mut store, &table, &opts)
                    .with_context(|| format!("appending {} to {}", artifact.display(), db.display()))?;
                info!(table = %summary.table, rows = summary.rows_appended, "append finished");
                RunReport::default()
            }
        }
    };

    Ok(exit_code(&report))
}

fn exit_code(report: &RunReport) -> ExitCode {
    if report.all_failed() {
        error!(units = report.outcomes.len(), "every unit failed");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
