//! CLI tool converting solution archives into plexstore array stores.

mod archive;
mod error;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use plexstore_core::store::DEFAULT_COMPRESSION_LEVEL;
use plexstore_core::{ConversionReport, ConvertOptions, convert_solution};
use snafu::{ResultExt, ensure};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::{
    archive::{SolutionArchive, default_output},
    error::{CliError, CliResult, ConvertSnafu, OutputWithManyArchivesSnafu, ReportSnafu},
};

#[derive(Debug, Parser)]
#[command(name = "plexstore", version, about)]
struct Cli {
    /// Store path to write (default: archive path with a .plexstore extension)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// zstd level for datasets
    #[arg(long = "compression-level", default_value_t = DEFAULT_COMPRESSION_LEVEL)]
    compression_level: i32,

    /// Decode resolutions one after another instead of in parallel
    #[arg(long, default_value_t = false)]
    sequential: bool,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short, default_value_t = false)]
    verbose: bool,

    /// Print each conversion report as JSON on stdout
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Solution archives to convert
    #[arg(required = true)]
    archives: Vec<PathBuf>,
}

fn default_env_filter(verbose: bool) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = if verbose {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            };
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy()
        }
    }
}

fn init_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(default_env_filter(verbose))
        .init();
}

async fn convert_archive(
    archive: &Path,
    output: &Path,
    options: &ConvertOptions,
) -> CliResult<ConversionReport> {
    let solution = SolutionArchive::open(archive)?;
    info!(
        archive = %solution.path().display(),
        metadata = solution.metadata_member(),
        log = solution.log_member(),
        "archive opened"
    );

    let metadata = solution.read_metadata()?;
    convert_solution(
        Cursor::new(metadata),
        Arc::new(solution.payloads()),
        output,
        options,
    )
    .await
    .context(ConvertSnafu {
        archive: archive.display().to_string(),
        output: output.display().to_string(),
    })
}

fn print_report(report: &ConversionReport, json: bool, elapsed_ms: u128) -> CliResult<()> {
    if json {
        println!("{}", serde_json::to_string(report).context(ReportSnafu)?);
    } else {
        println!(
            "Converted {} ({} datasets, {} values, {} keys skipped, elapsed_ms: {elapsed_ms})",
            report.output.display(),
            report.datasets,
            report.values_written,
            report.skipped_keys(),
        );
    }
    Ok(())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    ensure!(
        cli.output.is_none() || cli.archives.len() == 1,
        OutputWithManyArchivesSnafu {
            count: cli.archives.len(),
        }
    );
    let options = ConvertOptions {
        compression_level: cli.compression_level,
        parallel: !cli.sequential,
    };

    for archive in &cli.archives {
        let output = cli.output.clone().unwrap_or_else(|| default_output(archive));
        let start = Instant::now();
        let report = convert_archive(archive, &output, &options).await?;
        print_report(&report, cli.json, start.elapsed().as_millis())?;
    }
    Ok(())
}

fn print_error_chain(err: &CliError) {
    eprintln!("error: {err}");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error_chain(&e);
        std::process::exit(1);
    }
}
