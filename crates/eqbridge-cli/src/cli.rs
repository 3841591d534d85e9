use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "eqbridge developers",
    version,
    about = "eqbridge CLI - Mineral scaling analysis of concentrated brines with equilibrium properties coupled into an equation-oriented flowsheet.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Solve the feed and concentrate flowsheet once and report densities and scaling tendencies.
    Analyze(AnalyzeArgs),
    /// Sweep the water recovery and write one CSV row per sample.
    Sweep(SweepArgs),
}

/// Options shared by every flowsheet command.
#[derive(Args, Debug, Clone, Default)]
pub struct FlowsheetArgs {
    /// Path to a configuration file in TOML format. Built-in seawater defaults are used without one.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override `process.water-recovery` from the config file.
    #[arg(short = 'r', long, value_name = "FRACTION")]
    pub water_recovery: Option<f64>,

    /// Override the activity model (ideal, debye-huckel, davies).
    #[arg(short = 'a', long, value_name = "NAME")]
    pub activity_model: Option<String>,

    /// Use finite-difference derivatives instead of engine-provided ones.
    #[arg(long)]
    pub finite_difference: bool,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S feed.concentrations.Ca=450
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `analyze` subcommand.
#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub flowsheet: FlowsheetArgs,

    /// Write the converged report to this path as TOML.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Print the per-bridge output table after the report.
    #[arg(long)]
    pub show_bridges: bool,
}

/// Arguments for the `sweep` subcommand.
#[derive(Args, Debug)]
pub struct SweepArgs {
    #[command(flatten)]
    pub flowsheet: FlowsheetArgs,

    /// Path for the CSV file with one row per sample.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub output: PathBuf,

    /// First water recovery of the sweep.
    #[arg(long, value_name = "FRACTION")]
    pub start: Option<f64>,

    /// Last water recovery of the sweep.
    #[arg(long, value_name = "FRACTION")]
    pub stop: Option<f64>,

    /// Number of evenly spaced samples.
    #[arg(short = 'n', long, value_name = "INT")]
    pub count: Option<usize>,

    /// Fill outputs of failed samples from their converged neighbours.
    #[arg(long)]
    pub interpolate: bool,
}
