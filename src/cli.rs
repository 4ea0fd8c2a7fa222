use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative service orchestration", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Converge every declared resource
    Run(RunArgs),

    /// Check a config without touching anything
    Validate {
        /// Config file (TOML, YAML or JSON)
        config: PathBuf,
    },

    /// Show the execution order
    Plan {
        /// Config file (TOML, YAML or JSON)
        config: PathBuf,

        /// Only these resources and what they depend on
        #[arg(long, value_name = "ID")]
        only: Vec<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Run
// ============================================================================

#[derive(Parser)]
pub struct RunArgs {
    /// Config file (TOML, YAML or JSON)
    pub config: PathBuf,

    /// Probe and diff only; change nothing
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Stop scheduling after the first failure (overrides the config)
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub fail_fast: Option<bool>,

    /// Number of parallel workers (overrides the config)
    #[arg(short = 'j', long, value_name = "N")]
    pub parallelism: Option<usize>,

    /// Only these resources and what they depend on
    #[arg(long, value_name = "ID")]
    pub only: Vec<String>,

    /// Write the JSON run report to this file
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
