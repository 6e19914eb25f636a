use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "psha",
    version,
    about = "Classical probabilistic seismic hazard calculations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Calc(CalcArgs),
    Resume(ResumeArgs),
    Status(StatusArgs),
    Maps(MapsArgs),
    Discard(DiscardArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CalcArgs {
    #[arg(long)]
    pub job: PathBuf,

    #[arg(long, default_value = ".cache/psha")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub workers: Option<usize>,

    /// Stop issuing blocks after this many; the job stays resumable.
    #[arg(long)]
    pub max_blocks: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ResumeArgs {
    #[arg(long)]
    pub job_id: i64,

    #[arg(long, default_value = ".cache/psha")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/psha")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub job_id: Option<i64>,
}

#[derive(Args, Debug, Clone)]
pub struct MapsArgs {
    #[arg(long)]
    pub job_id: i64,

    /// Overrides the job's `poes_hazard_maps`.
    #[arg(long = "poe")]
    pub poes: Vec<f64>,

    #[arg(long, default_value = ".cache/psha")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct DiscardArgs {
    #[arg(long)]
    pub job_id: i64,

    #[arg(long, default_value = ".cache/psha")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}
