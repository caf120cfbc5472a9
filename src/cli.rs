//! CLI argument parsing for the dataset preparation pipeline.
//!
//! The CLI is intentionally thin: each subcommand maps one-to-one onto a
//! stage module's options struct, so the same core logic can be driven
//! from tests without going through argument parsing.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::archive::Space;
use crate::sampler::BatchUnits;

/// Root CLI entrypoint for the four-stage pipeline.
#[derive(Parser, Debug)]
#[command(
    name = "dwiprep",
    version,
    about = "Prepare diffusion-MRI tractography datasets for ML training",
    after_help = "Stages:\n  organize   Standardize per-subject data into dwi_ml_ready/\n  package    Build one HDF5 archive from the standardized tree\n  check      Validate an archive (schema, subjects, shapes, sampling)\n  train      Hand the archive to an external trainer\n\nExamples:\n  dwiprep organize --source /data/tractoflow --database /data/db \\\n      --subjects subjects.txt --rules layout.json\n  dwiprep package /data/db groups.json training.txt validation.txt \\\n      --name run1 --step-size 0.5\n  dwiprep check /data/db/run1.hdf5 groups.json training.txt validation.txt\n  dwiprep train /data/experiments --hdf5-filename /data/db/run1.hdf5 \\\n      --parameters-filename params.yaml --experiment-name exp1 \\\n      --trainer-cmd 'python train_model.py'",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Default log level (RUST_LOG overrides)
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub logging: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

/// Log levels accepted by `--logging`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Pipeline stages.
#[derive(Subcommand, Debug)]
pub enum Command {
    Organize(OrganizeArgs),
    Package(PackageArgs),
    Check(CheckArgs),
    Train(TrainArgs),
}

/// Organize command inputs.
#[derive(Parser, Debug)]
#[command(about = "Standardize per-subject data into the dwi_ml_ready layout")]
pub struct OrganizeArgs {
    /// Source derivatives tree holding one directory per subject
    #[arg(long, value_name = "DIR")]
    pub source: PathBuf,

    /// Database folder that owns dwi_ml_ready/
    #[arg(long, value_name = "DIR")]
    pub database: PathBuf,

    /// Subject list file (one id per line, # comments)
    #[arg(long, value_name = "FILE")]
    pub subjects: PathBuf,

    /// Layout rules JSON ([{"source": rel, "dest": rel}], * = subject id)
    #[arg(long, value_name = "FILE")]
    pub rules: PathBuf,

    /// Replace already organized subjects instead of skipping them
    #[arg(long)]
    pub force: bool,
}

/// Package command inputs.
#[derive(Parser, Debug)]
#[command(about = "Build one HDF5 archive from the standardized tree")]
pub struct PackageArgs {
    /// Database folder holding dwi_ml_ready/; the archive lands here too
    pub database_folder: PathBuf,

    /// Groups configuration JSON
    pub config_file: PathBuf,

    /// Training subject list file
    pub training_subjs: PathBuf,

    /// Validation subject list file
    pub validation_subjs: PathBuf,

    /// Archive file name (default dataset.hdf5; .hdf5 appended if missing)
    #[arg(long, value_name = "FILE")]
    pub name: Option<String>,

    /// Subject-relative standardization mask(s); * = subject id
    #[arg(long = "std-mask", value_name = "REL")]
    pub std_masks: Vec<String>,

    /// Coordinate space tag recorded in the archive
    #[arg(long, value_enum, default_value_t = Space::Rasmm)]
    pub space: Space,

    /// Fail when a configured file is missing instead of skipping it
    #[arg(
        long,
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enforce_files_presence: bool,

    /// Resample streamlines to this arc-length step, in millimeters
    #[arg(long, value_name = "MM")]
    pub step_size: Option<f32>,

    /// Write per-subject manifests next to the archive
    #[arg(long)]
    pub save_intermediate: bool,

    /// Replace an existing archive of the same name
    #[arg(long)]
    pub force: bool,
}

/// Check command inputs.
#[derive(Parser, Debug)]
#[command(about = "Validate an archive against its config and subject lists")]
pub struct CheckArgs {
    /// Archive file produced by `package`
    pub archive: PathBuf,

    /// Groups configuration JSON the archive was built from
    pub config_file: PathBuf,

    /// Training subject list file
    pub training_subjs: PathBuf,

    /// Validation subject list file
    pub validation_subjs: PathBuf,

    /// Batch size for the sampling smoke test
    #[arg(long, default_value_t = 100.0)]
    pub batch_size: f32,

    /// How the batch size is measured
    #[arg(long, value_enum, default_value_t = BatchUnits::NbStreamlines)]
    pub batch_units: BatchUnits,

    /// Streamlines drawn per chunk
    #[arg(long, default_value_t = 25)]
    pub chunk_size: usize,

    /// Cap on subjects contributing to one batch
    #[arg(long, value_name = "N")]
    pub subjects_per_batch: Option<usize>,

    /// Draw this many cycles from the same subjects per batch
    #[arg(long, value_name = "N", requires = "subjects_per_batch")]
    pub cycles: Option<usize>,

    /// Seed for the sampling smoke test
    #[arg(long, default_value_t = 1234)]
    pub seed: u64,
}

/// Train command inputs.
#[derive(Parser, Debug)]
#[command(about = "Run an external trainer under a per-run experiment directory")]
pub struct TrainArgs {
    /// Directory that collects experiment directories
    pub experiments_root: PathBuf,

    /// Archive file produced by `package`
    #[arg(long, value_name = "FILE")]
    pub hdf5_filename: PathBuf,

    /// YAML hyperparameter file, copied into the experiment directory
    #[arg(long, value_name = "FILE")]
    pub parameters_filename: PathBuf,

    /// Experiment name; becomes the directory name under the root
    #[arg(long, value_name = "NAME")]
    pub experiment_name: String,

    /// External trainer command, split shell-style and resolved on PATH
    #[arg(long, value_name = "CMD")]
    pub trainer_cmd: String,

    /// Replace an existing experiment directory of the same name
    #[arg(long)]
    pub force: bool,
}
