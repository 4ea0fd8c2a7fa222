//! Report and plan display

use colored::Colorize;
use declarative::{ExecutionPlan, Outcome, Resource, ResourceReport, RunPhase, RunReport};
use std::collections::HashMap;

use crate::progress::symbol;
use crate::resource::ManagedResource;
use crate::ui;

/// Detail lines printed under a resource
fn detail_lines(resource: &ResourceReport) -> Vec<String> {
    let mut lines: Vec<String> = resource.changes.clone();
    match &resource.outcome {
        Outcome::Failed { error } => lines.push(format!("error: {error}")),
        Outcome::SkippedDueToDependencyFailure { dependency } => {
            lines.push(format!("skipped: {dependency} did not succeed"));
        }
        Outcome::SkippedDueToCancellation => lines.push("skipped: run was cancelled".into()),
        _ => {}
    }
    if resource.attempts > 1 {
        lines.push(format!("{} attempts", resource.attempts));
    }
    lines
}

/// Summary bullet lines, zero counts omitted
fn summary_lines(report: &RunReport) -> Vec<String> {
    let s = &report.summary;
    [
        (s.applied, "applied"),
        (s.planned, "would change"),
        (s.already_satisfied, "already satisfied"),
        (s.skipped, "skipped"),
        (s.failed, "failed"),
    ]
    .into_iter()
    .filter(|(count, _)| *count > 0)
    .map(|(count, label)| format!("{count} {label}"))
    .collect()
}

/// Print a finished run
pub fn display_report(report: &RunReport) {
    ui::header(if report.dry_run { "Dry run" } else { "Run" });

    for resource in &report.resources {
        println!(
            "  {} {:<24} {}",
            symbol(&resource.outcome),
            resource.id,
            resource.description.dimmed()
        );
        for line in detail_lines(resource) {
            let line = if resource.outcome.is_failure() && line.starts_with("error:") {
                line.red().to_string()
            } else {
                line
            };
            ui::dim(&format!("    {line}"));
        }
    }

    println!();
    match &report.phase {
        RunPhase::Failed { reason } => {
            ui::error(&format!("Planning failed: {reason}"));
            return;
        }
        RunPhase::Aborted { reason } => {
            println!("  {} Run aborted: {}", "✗".red().bold(), reason);
        }
        _ if report.success && report.dry_run => {
            ui::info("Dry run - no changes made");
        }
        _ if report.success => {
            println!("  {} Converged successfully!", "✓".green().bold());
        }
        _ => {
            println!("  {} Run completed with errors", "⚠".yellow().bold());
        }
    }

    for line in summary_lines(report) {
        println!("    • {line}");
    }
    if let Some(finished) = report.finished_at {
        ui::dim(&format!("took {}", ui::format_duration(finished - report.started_at)));
    }
}

/// Print the execution order of a plan
pub fn display_plan(plan: &ExecutionPlan, resources: &[ManagedResource]) {
    let by_id: HashMap<&str, &ManagedResource> = resources.iter().map(|r| (r.id(), r)).collect();

    ui::header(&format!("Execution plan ({} resources)", plan.len()));
    if plan.is_empty() {
        ui::warn("Nothing to do");
        return;
    }

    for (i, id) in plan.order().iter().enumerate() {
        let Some(resource) = by_id.get(id.as_str()) else {
            continue;
        };
        ui::step(
            i + 1,
            plan.len(),
            &format!("{} {}", id.bold(), resource.resource_type().dimmed()),
        );
        ui::dim(&format!("    {}", resource.describe()));

        let deps = plan.dependencies_of(id);
        if !deps.is_empty() {
            ui::dim(&format!("    after {}", deps.join(", ")));
        }
        if let Some(ready) = resource.readiness() {
            ui::dim(&format!("    ready when {}", ready.describe()));
        }
    }

    println!();
    ui::kv("default parallelism", &plan.frontier_width().to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, outcome: Outcome) -> ResourceReport {
        ResourceReport::new(id, "file", format!("file {id}"), outcome)
    }

    #[test]
    fn test_detail_lines() {
        let mut applied = entry("env", Outcome::Applied);
        applied.changes = vec!["content_hash: (unset) -> ab12".into()];
        applied.attempts = 2;
        assert_eq!(
            detail_lines(&applied),
            ["content_hash: (unset) -> ab12", "2 attempts"]
        );

        let skipped = entry(
            "app",
            Outcome::SkippedDueToDependencyFailure {
                dependency: "db".into(),
            },
        );
        assert_eq!(detail_lines(&skipped), ["skipped: db did not succeed"]);

        let failed = entry(
            "db",
            Outcome::Failed {
                error: "docker exited with 125".into(),
            },
        );
        assert_eq!(detail_lines(&failed), ["error: docker exited with 125"]);
    }

    #[test]
    fn test_summary_lines_skip_zero_counts() {
        let mut report = RunReport::new(false);
        report.resources = vec![
            entry("a", Outcome::Applied),
            entry("b", Outcome::AlreadySatisfied),
            entry("c", Outcome::Applied),
        ];
        report.finish(RunPhase::Completed);

        assert_eq!(summary_lines(&report), ["2 applied", "1 already satisfied"]);
    }
}
