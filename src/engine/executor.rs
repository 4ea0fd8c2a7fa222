//! Run command - wires real adapters into the coordinator

use anyhow::{Context, Result};
use declarative::{Adapters, Coordinator, RunReport, SystemClock};
use std::fs;
use std::path::{Path, PathBuf};

use crate::adapters::{ProcessRunner, UreqTransport};
use crate::progress::RunProgress;
use crate::ui;

use super::differ::display_report;

/// Options for `stagehand run`; `None` keeps the config's value
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub dry_run: bool,
    pub fail_fast: Option<bool>,
    pub parallelism: Option<usize>,
    pub only: Vec<String>,
    /// Write the JSON report here
    pub report: Option<PathBuf>,
    /// Print the JSON report to stdout instead of the summary
    pub json: bool,
    pub quiet: bool,
}

/// Converge every resource in a config and return the process exit code
pub fn run(path: &Path, args: &RunArgs) -> Result<u8> {
    let loaded = super::load(path)?;
    let secrets = loaded
        .config
        .secret_broker()
        .with_context(|| format!("Could not load secrets for {}", path.display()))?;

    let mut options = loaded.config.run.to_options();
    options.dry_run = args.dry_run;
    options.only.clone_from(&args.only);
    if let Some(fail_fast) = args.fail_fast {
        options.fail_fast = fail_fast;
    }
    if let Some(parallelism) = args.parallelism {
        options.parallelism = Some(parallelism.max(1));
    }

    let runner = ProcessRunner;
    let http = UreqTransport::new(options.default_timeout);
    let adapters = Adapters {
        commands: &runner,
        http: &http,
        clock: &SystemClock,
    };

    let coordinator = Coordinator::new(adapters, &secrets, options);
    let mut progress = RunProgress::new(!args.quiet && !args.json);
    let report = coordinator.run(&loaded.resources, &mut progress);

    let mut code = report.exit_code();
    if let Some(target) = &args.report
        && let Err(e) = write_report(&report, target)
    {
        ui::error(&format!("{e:#}"));
        code = code.max(1);
    }

    if args.json {
        println!("{}", report.to_json()?);
    } else if !args.quiet {
        display_report(&report);
    }

    Ok(code)
}

fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    let json = report.to_json().context("Could not serialize run report")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Could not create {}", parent.display()))?;
    }
    fs::write(path, json).with_context(|| format!("Could not write report to {}", path.display()))?;
    log::info!("report written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::RunPhase;

    fn stack(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("stack.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_run_writes_files_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let config = stack(
            dir.path(),
            r#"
[run]
parallelism = 2

[secrets.api_key]
value = "sk-live-0042"

[[resources]]
id = "env"
kind = "file"
[resources.desired]
path = "out/.env"
content = "API_KEY={{ secret.api_key }}\n"
mode = "0600"

[[resources]]
id = "values"
kind = "file"
depends_on = ["env"]
[resources.desired]
path = "out/values.yaml"
set = { "serve.replicas" = 2 }
"#,
        );
        let report_path = dir.path().join("reports/run.json");
        let args = RunArgs {
            report: Some(report_path.clone()),
            quiet: true,
            ..RunArgs::default()
        };

        assert_eq!(run(&config, &args).unwrap(), 0);
        assert_eq!(
            fs::read_to_string(dir.path().join("out/.env")).unwrap(),
            "API_KEY=sk-live-0042\n"
        );

        let json = fs::read_to_string(&report_path).unwrap();
        assert!(!json.contains("sk-live-0042"));
        let report: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report.phase, RunPhase::Completed);
        assert_eq!(report.summary.applied, 2);

        // Second run converges without changes
        assert_eq!(run(&config, &args).unwrap(), 0);
        let report: RunReport =
            serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(report.summary.already_satisfied, 2);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = stack(
            dir.path(),
            r#"
[[resources]]
id = "motd"
kind = "file"
[resources.desired]
path = "motd"
content = "hello"
"#,
        );
        let args = RunArgs {
            dry_run: true,
            quiet: true,
            ..RunArgs::default()
        };

        assert_eq!(run(&config, &args).unwrap(), 0);
        assert!(!dir.path().join("motd").exists());
    }

    #[test]
    fn test_failed_resource_exits_one() {
        let dir = tempfile::tempdir().unwrap();
        let config = stack(
            dir.path(),
            r#"
[run.retry]
max_attempts = 1

[[resources]]
id = "broken"
kind = "process"
[resources.desired]
command = ["sh", "-c", "echo nope >&2; exit 3"]

[[resources]]
id = "after"
kind = "file"
depends_on = ["broken"]
[resources.desired]
path = "after"
content = "x"
"#,
        );
        let args = RunArgs {
            quiet: true,
            ..RunArgs::default()
        };

        assert_eq!(run(&config, &args).unwrap(), 1);
        assert!(!dir.path().join("after").exists());
    }

    #[test]
    fn test_cycle_exits_two() {
        let dir = tempfile::tempdir().unwrap();
        let config = stack(
            dir.path(),
            r#"
[[resources]]
id = "a"
kind = "file"
depends_on = ["b"]
[resources.desired]
path = "a"

[[resources]]
id = "b"
kind = "file"
depends_on = ["a"]
[resources.desired]
path = "b"
"#,
        );
        let args = RunArgs {
            quiet: true,
            ..RunArgs::default()
        };
        assert_eq!(run(&config, &args).unwrap(), 2);
    }
}
