// src/main.rs
//
// obj-bench: gated-start load driver for object stores.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::runtime::Builder as RtBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use obj_bench::buffer::MemoryClass;
use obj_bench::config::{CorpusConfig, PacingConfig, RangeConfig, RunConfig, WorkloadKind};
use obj_bench::constants::{DEFAULT_CONCURRENCY, DEFAULT_OBJECT_COUNT};
use obj_bench::report::RunReport;
use obj_bench::run::Runner;
use obj_bench::size_parser::parse_size_spec;
use obj_bench::store::store_for_uri;

// -----------------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------------
#[derive(Parser)]
#[command(name = "obj-bench", version, about = "Gated-start load driver for object stores")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Args)]
struct CommonArgs {
    /// Target store URI (mem:// or file:///path)
    #[arg(long)]
    uri: String,

    /// Bucket to run against
    #[arg(long, default_value = "benchdata")]
    bucket: String,

    /// Measured window length (e.g. "60s", "2m")
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Concurrent workers
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Object size, with optional suffix (e.g. "10MiB", "256KB")
    #[arg(long, default_value = "10MiB")]
    obj_size: String,

    /// Transfer buffer memory class (host or device)
    #[arg(long, default_value = "host")]
    memory: MemoryClass,

    /// Cap operations per second across all workers
    #[arg(long)]
    iops: Option<u64>,

    /// Draw pacing delays from an exponential distribution
    #[arg(long)]
    poisson: bool,

    /// Keep the objects this run created
    #[arg(long)]
    no_cleanup: bool,
}

#[derive(Args)]
struct PutArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct GetArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Objects in the read corpus
    #[arg(long, default_value_t = DEFAULT_OBJECT_COUNT)]
    objects: usize,

    /// Versions kept per object; reads pin versions when > 1
    #[arg(long, default_value_t = 1)]
    versions: usize,

    /// Read an existing corpus instead of uploading one
    #[arg(long)]
    list_existing: bool,

    /// List only the top level when discovering objects
    #[arg(long)]
    list_flat: bool,

    /// Key prefix to discover objects under
    #[arg(long, default_value = "")]
    prefix: String,

    /// Issue range reads instead of whole-object reads
    #[arg(long)]
    range: bool,

    /// Fixed range length (random lengths when omitted), e.g. "64KiB"
    #[arg(long)]
    range_size: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload objects until the duration elapses
    ///
    /// Examples:
    ///   obj-bench put --uri "mem://" --obj-size 1MiB --duration 30s
    ///   obj-bench put --uri "file:///tmp/bench" --concurrency 8
    Put(PutArgs),
    /// Download from a synthesized or discovered corpus
    ///
    /// Examples:
    ///   obj-bench get --uri "file:///tmp/bench" --objects 500
    ///   obj-bench get --uri "file:///tmp/bench" --list-existing --range
    Get(GetArgs),
    /// Run a workload described by a YAML config file
    ///
    /// Examples:
    ///   obj-bench run --config workload.yaml
    ///   obj-bench run --config workload.yaml --no-cleanup
    Run {
        #[arg(long)]
        config: PathBuf,

        /// Keep the objects this run created
        #[arg(long)]
        no_cleanup: bool,
    },
}

// -----------------------------------------------------------------------------
// main
// -----------------------------------------------------------------------------
fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::new(format!("obj_bench={}", level));
    fmt().with_env_filter(filter).init();

    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    match cli.command {
        Commands::Put(args) => {
            let no_cleanup = args.common.no_cleanup;
            let config = build_config(
                args.common,
                WorkloadKind::Put,
                CorpusConfig::default(),
                RangeConfig::default(),
            )?;
            rt.block_on(execute(config, no_cleanup))
        }
        Commands::Get(args) => {
            let corpus = CorpusConfig {
                objects: args.objects,
                versions: args.versions,
                list_existing: args.list_existing,
                list_flat: args.list_flat,
                prefix: args.prefix,
            };
            let range = RangeConfig {
                enabled: args.range || args.range_size.is_some(),
                size: args
                    .range_size
                    .as_deref()
                    .map(parse_size_spec)
                    .transpose()?,
            };
            let no_cleanup = args.common.no_cleanup;
            let config = build_config(args.common, WorkloadKind::Get, corpus, range)?;
            rt.block_on(execute(config, no_cleanup))
        }
        Commands::Run { config, no_cleanup } => {
            let config = RunConfig::from_yaml_file(&config)?;
            rt.block_on(execute(config, no_cleanup))
        }
    }
}

fn build_config(
    common: CommonArgs,
    workload: WorkloadKind,
    corpus: CorpusConfig,
    range: RangeConfig,
) -> Result<RunConfig> {
    Ok(RunConfig {
        workload,
        target: common.uri,
        bucket: common.bucket,
        duration: common.duration,
        concurrency: common.concurrency,
        object_size: parse_size_spec(&common.obj_size)?,
        corpus,
        range,
        memory: common.memory,
        pacing: common.iops.map(|iops| PacingConfig {
            iops,
            poisson: common.poisson,
        }),
    })
}

// -----------------------------------------------------------------------------
// Run execution
// -----------------------------------------------------------------------------
async fn execute(config: RunConfig, no_cleanup: bool) -> Result<()> {
    config.validate()?;
    let store = store_for_uri(&config.target)?;

    let synthesizing =
        matches!(config.workload, WorkloadKind::Get) && !config.corpus.list_existing;
    let total_uploads = (config.corpus.objects * config.corpus.versions) as u64;

    let mut runner = Runner::new(config, store);

    let token = CancellationToken::new();
    let ctrl_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping run");
            ctrl_token.cancel();
        }
    });

    if synthesizing {
        let pb = ProgressBar::new(total_uploads);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} uploads ({eta_precise}) {msg}",
            )?
            .progress_chars("#>-"),
        );
        pb.set_message("preparing corpus");
        let bar = pb.clone();
        runner.set_progress(Arc::new(move |fraction: f64| {
            bar.set_position((fraction * total_uploads as f64) as u64);
        }));
        let prepared = runner.prepare(&token).await;
        pb.finish_and_clear();
        prepared?;
    } else {
        runner.prepare(&token).await?;
    }

    let outcome = runner.start(&token).await?;

    let report = RunReport::new(&outcome.operations);
    report.print();

    if !no_cleanup {
        if let Err(err) = runner.cleanup().await {
            error!("cleanup failed: {:#}", err);
        }
    }

    if let Some(err) = outcome.error {
        return Err(err.context("run failed"));
    }
    Ok(())
}
