//! tailcore-cli — the thin binary wrapper around the `tailcore` pipeline.
//! Loads configuration, wires up tracing, and runs the collection loop
//! until it is killed or the sink gives up.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use tailcore::sink::NdjsonFileSink;
use tailcore::{config, Pipeline};

/// Tail a set of configured log directories and forward batched records to
/// an NDJSON output file.
#[derive(Parser, Debug)]
#[command(name = "tailcore-cli", version, about)]
struct Cli {
    /// Path to a TOML config file. If omitted, configuration comes entirely
    /// from TAILCORE_* environment variables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to write delivered records, one JSON payload per line.
    #[arg(short, long, default_value = "tailcore-output.ndjson")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        path.try_exists()
            .with_context(|| format!("checking whether config file exists: {}", path.display()))?;
    }

    let pipeline_config = config::load_config(cli.config.as_deref())
        .context("failed to load pipeline configuration")?;

    let sink = NdjsonFileSink::open(&cli.output)
        .await
        .with_context(|| format!("opening output file {}", cli.output.display()))?;

    let pipeline = Pipeline::new(pipeline_config, sink)
        .await
        .context("failed to initialize pipeline")?;

    if let Err(err) = pipeline.run().await {
        error!("pipeline exited with error: {err}");
        for cause in err.chain().skip(1) {
            error!("caused by: {cause}");
        }
        std::process::exit(1);
    }

    Ok(())
}
