//! speechport - export wav2vec2 to ONNX and check the result.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use speechport_export::{artifact_checksums, Paths, Pipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;

mod output;

use output::{Output, OutputFormat};

/// speechport - export a pretrained speech encoder to ONNX.
///
/// Exports facebook/wav2vec2-base to models/wav2vec2_encoder.onnx, checks
/// the graph, runs it through ONNX Runtime and compares SHA-256 digests
/// against pinned values. Checksum mismatches are warnings only.
///
/// Without --config, ~/.speechport/export/config.yaml is used when present,
/// built-in defaults otherwise.
#[derive(Parser)]
#[command(name = "speechport")]
#[command(about = "Export wav2vec2 to ONNX, verify it and check its checksums")]
#[command(version)]
pub struct Cli {
    /// Config file (default is ~/.speechport/export/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output file for the final report (default: stdout)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<String>,

    /// Output as JSON (for piping)
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Export, verify, then run the embedding smoke test (default)
    Run,
    /// Export and verify
    Export,
    /// Validate and verify the artifact already on disk
    Verify,
    /// Embed the test clip, exporting first if needed
    Smoke,
    /// Print digests of the current artifact as a pin table
    Checksums,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_ref())?;
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Yaml
    };
    let out = Output::new(format, cli.output.clone());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => out.write(&Pipeline::standard(config)?.run()?),
        Commands::Export => out.write(&Pipeline::standard(config)?.export()?),
        Commands::Verify => out.write(&Pipeline::standard(config)?.verify_existing()?),
        Commands::Smoke => out.write(&Pipeline::standard(config)?.smoke_test()?),
        Commands::Checksums => {
            let table = artifact_checksums(&config).context("hash artifact")?;
            out.write(&table)
        }
    }
}

/// Progress lines go to stdout; `RUST_LOG` overrides the level.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stdout)
        .init();
}

fn load_config(explicit: Option<&PathBuf>) -> anyhow::Result<PipelineConfig> {
    if let Some(path) = explicit {
        return PipelineConfig::load(path).with_context(|| format!("load config {path:?}"));
    }
    let default_path = Paths::new("export").ok().map(|p| p.config_file());
    match default_path {
        Some(path) if path.is_file() => {
            tracing::debug!("using config {}", path.display());
            PipelineConfig::load(&path).with_context(|| format!("load config {path:?}"))
        }
        _ => Ok(PipelineConfig::default()),
    }
}
