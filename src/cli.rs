//! CLI argument parsing for the preprocessing driver.
use crate::artifact::ArtifactKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "cordprep",
    version,
    about = "Spinal cord MRI preprocessing driver with manual-label resolution",
    after_help = "Commands:\n  init --config <path>                         Write a config stub\n  resolve --subject <id> --image <name> --kind <k>  Resolve one artifact\n  process --subject <id>                      Run the per-subject pipeline\n  mscc-summary --input-dir <dir> ...           Summarize MSCC against mJOA\n\nExamples:\n  cordprep init --config cordprep.json\n  cordprep resolve --subject sub-01 --image sub-01_T2w_RPI_r --kind seg --data-dir /data\n  cordprep process --subject sub-01 --data-dir /data --output-dir /out\n  cordprep mscc-summary --input-dir /out/results --participants /data/participants.tsv --out /out/stats",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Config file (defaults to ./cordprep.json, then the user config dir)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Init(InitArgs),
    Resolve(ResolveArgs),
    Process(ProcessArgs),
    MsccSummary(MsccSummaryArgs),
}

/// Init writes a config stub to `--config` (or ./cordprep.json).
#[derive(Parser, Debug)]
#[command(about = "Write a pipeline config stub")]
pub struct InitArgs {
    /// Naming profile for the derivatives store
    #[arg(long, value_name = "NAME", default_value = crate::naming::DEFAULT_PROFILE)]
    pub profile: String,

    /// Overwrite an existing config
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Resolve a segmentation or disc-label artifact for one image")]
pub struct ResolveArgs {
    /// Subject identifier, e.g. sub-01
    #[arg(long, value_name = "ID")]
    pub subject: String,

    /// Base image file name (with or without extension) in the work dir
    #[arg(long, value_name = "NAME")]
    pub image: String,

    /// Artifact kind: seg or disc_labels
    #[arg(long, value_name = "KIND")]
    pub kind: ArtifactKind,

    /// Contrast passed to the automatic producer
    #[arg(long, default_value = "t2")]
    pub contrast: String,

    /// Directory holding the base image (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Dataset root containing the derivatives store
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Print the resolution plan without copying or running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Run the configured pipeline for one subject")]
pub struct ProcessArgs {
    /// Subject identifier, e.g. sub-01
    #[arg(long, value_name = "ID")]
    pub subject: String,

    /// Dataset root (overrides the config's data_dir)
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Output root (overrides the config's output_dir)
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Correlate MSCC at the maximum compression level with mJOA")]
pub struct MsccSummaryArgs {
    /// Directory holding per-subject `*_mscc*.csv` tables
    #[arg(long, value_name = "DIR")]
    pub input_dir: PathBuf,

    /// participants.tsv with max_compression_level and mjoa columns
    #[arg(long, value_name = "PATH")]
    pub participants: PathBuf,

    /// Output directory for the summary CSV and stats JSON
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// YAML list of subjects or files to leave out
    #[arg(long, value_name = "PATH")]
    pub exclude: Option<PathBuf>,
}
