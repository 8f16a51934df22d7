//! Backfill daemon: runs Athena queries on a schedule and merges the results
//! into a block store.

mod athena;
mod error;

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use log::info;
use query_backfill_core::{
    BackfillConfig, IngestJob, IngestPipeline, ParquetBlockBuilder, PipelinePaths,
};
use snafu::{ResultExt, ensure};
use tokio_util::sync::CancellationToken;

use crate::{
    athena::AthenaQueryService,
    error::{
        CliResult, ConfigSnafu, CreateTmpRootSnafu, CycleSnafu, DestinationMissingSnafu,
        DestinationNotDirSnafu,
    },
};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file path
    #[arg(long = "config.file", default_value = "./backfill.yml")]
    config_file: PathBuf,

    /// Destination block store (must already exist)
    #[arg(long = "tsdb.path")]
    tsdb_path: PathBuf,

    /// Root for per-cycle temporary blocks
    #[arg(long = "tsdb.tmp.path")]
    tsdb_tmp_path: PathBuf,

    /// Run every query once, immediately, and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Exit on the first failed cycle
    #[arg(long = "fail-fast", default_value_t = false)]
    fail_fast: bool,
}

async fn check_paths(cli: &Cli) -> CliResult<PipelinePaths> {
    let meta = tokio::fs::metadata(&cli.tsdb_path)
        .await
        .context(DestinationMissingSnafu {
            path: cli.tsdb_path.display().to_string(),
        })?;
    ensure!(
        meta.is_dir(),
        DestinationNotDirSnafu {
            path: cli.tsdb_path.display().to_string(),
        }
    );

    tokio::fs::create_dir_all(&cli.tsdb_tmp_path)
        .await
        .context(CreateTmpRootSnafu {
            path: cli.tsdb_tmp_path.display().to_string(),
        })?;

    Ok(PipelinePaths {
        dest: cli.tsdb_path.clone(),
        tmp_root: cli.tsdb_tmp_path.clone(),
    })
}

fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let config = BackfillConfig::load(&cli.config_file)
        .await
        .context(ConfigSnafu)?;
    let specs = config.query_specs().context(ConfigSnafu)?;
    let options = config.builder_options().context(ConfigSnafu)?;
    let paths = check_paths(&cli).await?;

    let mut jobs = Vec::with_capacity(specs.len());
    for spec in specs {
        let service = Arc::new(AthenaQueryService::connect(&spec).await);
        jobs.push(IngestJob { spec, service });
    }
    info!(
        "Loaded {} query definition(s) from {}",
        jobs.len(),
        cli.config_file.display()
    );

    let pipeline = IngestPipeline::new(jobs, Arc::new(ParquetBlockBuilder::new(options)), paths)
        .with_fail_fast(cli.fail_fast);

    let cancel = CancellationToken::new();
    shutdown_on_ctrl_c(cancel.clone());

    if cli.once {
        pipeline.run_once(&cancel).await.context(CycleSnafu)?;
    } else {
        pipeline.run(&cancel).await.context(CycleSnafu)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
