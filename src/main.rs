mod adapters;
mod cli;
mod config;
mod engine;
mod progress;
mod resource;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command, OutputFormat};
use std::io;
use std::process::ExitCode;

/// Exit code for configuration and validation failures
const EXIT_CONFIG: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            ui::error(&format!("{e:#}"));
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8> {
    match cli.command {
        Command::Run(args) => {
            let run_args = engine::RunArgs {
                dry_run: args.dry_run,
                fail_fast: args.fail_fast,
                parallelism: args.parallelism,
                only: args.only,
                report: args.report,
                json: args.format == OutputFormat::Json,
                quiet: cli.quiet,
            };
            engine::run(&args.config, &run_args)
        }
        Command::Validate { config } => engine::validate(&config),
        Command::Plan { config, only } => engine::show_plan(&config, &only),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "stagehand", &mut io::stdout());
            Ok(0)
        }
    }
}
