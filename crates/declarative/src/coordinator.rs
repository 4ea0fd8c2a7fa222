//! Run coordinator - drives a whole plan to completion
//!
//! One coordinating thread owns the plan and the report. Resources whose
//! dependencies have all settled are dispatched to a bounded rayon pool;
//! workers send finished [`ResourceReport`]s back over a channel, so the
//! coordinating thread is the only writer of the report.

use crate::clock::CancellationToken;
use crate::context::{Adapters, ProgressCallback};
use crate::error::{Error, Result, ValidationError};
use crate::executor::{ExecuteOptions, Executor};
use crate::planner::ExecutionPlan;
use crate::report::{Outcome, ResourceReport, RunPhase, RunReport};
use crate::resource::Resource;
use crate::retry::RetryConfig;
use crate::secrets::SecretBroker;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Duration;

/// Options for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Cancel the remaining plan after the first failure
    pub fail_fast: bool,
    /// Worker count; defaults to the plan's frontier width
    pub parallelism: Option<usize>,
    pub dry_run: bool,
    pub retry: RetryConfig,
    /// Readiness timeout for checks that declare none
    pub default_timeout: Duration,
    /// Restrict the run to these resources and their dependencies
    pub only: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            fail_fast: true,
            parallelism: None,
            dry_run: false,
            retry: RetryConfig::default(),
            default_timeout: Duration::from_secs(60),
            only: Vec::new(),
        }
    }
}

/// Top-level driver for a run
///
/// Holds the run's cancellation token. A coordinator is meant for a single
/// run; once cancelled, later runs skip every resource.
pub struct Coordinator<'a> {
    adapters: Adapters<'a>,
    secrets: &'a SecretBroker,
    options: RunOptions,
    cancel: CancellationToken,
}

impl<'a> Coordinator<'a> {
    pub fn new(adapters: Adapters<'a>, secrets: &'a SecretBroker, options: RunOptions) -> Self {
        Self {
            adapters,
            secrets,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels this run when triggered (e.g. from a signal handler)
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Build the execution plan for `resources`, honoring `only`.
    pub fn plan<R: Resource>(&self, resources: &[R]) -> Result<ExecutionPlan> {
        let mut seen = HashSet::new();
        for resource in resources {
            if !seen.insert(resource.id()) {
                return Err(Error::Validation(ValidationError::DuplicateId {
                    id: resource.id().to_string(),
                }));
            }
        }

        let plan =
            ExecutionPlan::from_nodes(resources.iter().map(|r| (r.id(), r.dependencies())))?;
        if self.options.only.is_empty() {
            Ok(plan)
        } else {
            Ok(plan.restrict_to(&self.options.only)?)
        }
    }

    /// Execute every resource and return the report.
    ///
    /// Planning errors produce a report in phase `failed` with no entries.
    /// Otherwise the report holds one entry per planned resource, in
    /// declaration order.
    pub fn run<R, P>(&self, resources: &[R], progress: &mut P) -> RunReport
    where
        R: Resource,
        P: ProgressCallback + ?Sized,
    {
        self.secrets.clear_run_scope();
        let mut report = RunReport::new(self.options.dry_run);

        let plan = match self.plan(resources) {
            Ok(plan) => plan,
            Err(e) => {
                let reason = self.secrets.redact(&e.to_string());
                log::error!("planning failed: {reason}");
                report.finish(RunPhase::Failed { reason });
                return report;
            }
        };

        report.phase = RunPhase::Executing;
        let workers = self
            .options
            .parallelism
            .unwrap_or_else(|| plan.frontier_width())
            .max(1);
        log::info!(
            "executing {} resource(s) with {} worker(s){}",
            plan.len(),
            workers,
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("stagehand-worker-{i}"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                report.finish(RunPhase::Aborted {
                    reason: format!("failed to create worker pool: {e}"),
                });
                return report;
            }
        };

        let by_id: HashMap<&str, &R> = resources.iter().map(|r| (r.id(), r)).collect();
        let executor = Executor::new(
            self.adapters,
            self.secrets,
            &self.cancel,
            ExecuteOptions {
                dry_run: self.options.dry_run,
                retry: self.options.retry.clone(),
                default_timeout: self.options.default_timeout,
            },
        );

        progress.on_run_start(plan.len());
        let mut run = RunState::new(&plan);
        let abort_reason = pool.in_place_scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, ResourceReport)>();
            let mut in_flight = 0usize;
            let mut abort_reason = None;

            loop {
                while in_flight < workers {
                    let Some(pos) = run.next_ready() else { break };
                    let id = plan.order()[pos].as_str();
                    let Some(resource) = by_id.get(id).copied() else {
                        continue;
                    };

                    if let Some(skipped) = run.skip_outcome(&plan, id, &self.cancel) {
                        let entry = ResourceReport::new(
                            id,
                            resource.resource_type(),
                            self.secrets.redact(&resource.describe()),
                            skipped,
                        );
                        log::info!("[{id}] {}", entry.outcome.label());
                        progress.on_resource_complete(id, &entry.outcome);
                        run.settle(&plan, pos, entry);
                        continue;
                    }

                    progress.on_resource_start(id, &self.secrets.redact(&resource.describe()));
                    let tx = tx.clone();
                    let executor = &executor;
                    let secrets = self.secrets;
                    scope.spawn(move |_| {
                        let entry = panic::catch_unwind(AssertUnwindSafe(|| {
                            executor.execute(resource)
                        }))
                        .unwrap_or_else(|payload| panicked(resource, secrets, &*payload));
                        // The receiver only goes away once the run is over
                        let _ = tx.send((pos, entry));
                    });
                    in_flight += 1;
                }

                if in_flight == 0 {
                    break;
                }

                // Every spawned job sends exactly once, panics included
                let Ok((pos, entry)) = rx.recv() else { break };
                in_flight -= 1;

                if entry.outcome.is_failure()
                    && self.options.fail_fast
                    && abort_reason.is_none()
                {
                    let reason = format!("fail-fast: resource '{}' failed", entry.id);
                    log::warn!("{reason}; cancelling remaining resources");
                    self.cancel.cancel();
                    abort_reason = Some(reason);
                }

                progress.on_resource_complete(&entry.id, &entry.outcome);
                run.settle(&plan, pos, entry);
            }

            drop(tx);
            abort_reason
        });
        progress.on_run_complete();

        let mut entries = run.into_entries();
        report.resources = resources
            .iter()
            .filter(|r| plan.position(r.id()).is_some())
            .map(|r| {
                entries.remove(r.id()).unwrap_or_else(|| {
                    ResourceReport::new(
                        r.id(),
                        r.resource_type(),
                        self.secrets.redact(&r.describe()),
                        Outcome::SkippedDueToCancellation,
                    )
                })
            })
            .collect();

        // Values captured late in the run may appear in earlier entries
        report.redact(self.secrets);
        report.finish(match abort_reason {
            Some(reason) => RunPhase::Aborted {
                reason: self.secrets.redact(&reason),
            },
            None => RunPhase::Completed,
        });
        report
    }
}

/// Report for a resource whose probe or apply panicked
fn panicked<R: Resource>(
    resource: &R,
    secrets: &SecretBroker,
    payload: &(dyn Any + Send),
) -> ResourceReport {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    let error = secrets.redact(&format!("panicked: {message}"));
    log::error!("[{}] {}", resource.id(), error);

    let mut entry = ResourceReport::new(
        resource.id(),
        resource.resource_type(),
        secrets.redact(&resource.describe()),
        Outcome::Failed { error },
    );
    entry.finished_at = Some(chrono::Utc::now());
    entry
}

/// Bookkeeping owned by the coordinating thread
struct RunState {
    /// Unsettled dependency count per plan position
    waiting_on: Vec<usize>,
    /// Ready positions; ordered so dispatch follows the plan
    ready: BTreeSet<usize>,
    entries: HashMap<String, ResourceReport>,
}

impl RunState {
    fn new(plan: &ExecutionPlan) -> Self {
        let waiting_on: Vec<usize> = plan
            .order()
            .iter()
            .map(|id| plan.dependencies_of(id).len())
            .collect();
        let ready = waiting_on
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n == 0)
            .map(|(pos, _)| pos)
            .collect();
        Self {
            waiting_on,
            ready,
            entries: HashMap::new(),
        }
    }

    fn next_ready(&mut self) -> Option<usize> {
        self.ready.pop_first()
    }

    /// Outcome for a resource that must not start, if any.
    ///
    /// Only called once every dependency has settled.
    fn skip_outcome(
        &self,
        plan: &ExecutionPlan,
        id: &str,
        cancel: &CancellationToken,
    ) -> Option<Outcome> {
        for dep in plan.dependencies_of(id) {
            match self.entries.get(dep).map(|e| &e.outcome) {
                Some(Outcome::SkippedDueToCancellation) => {
                    return Some(Outcome::SkippedDueToCancellation);
                }
                Some(outcome) if !outcome.is_success() => {
                    return Some(Outcome::SkippedDueToDependencyFailure {
                        dependency: dep.clone(),
                    });
                }
                _ => {}
            }
        }

        cancel
            .is_cancelled()
            .then_some(Outcome::SkippedDueToCancellation)
    }

    /// Record a terminal outcome and release dependents whose dependencies have all settled
    fn settle(&mut self, plan: &ExecutionPlan, pos: usize, entry: ResourceReport) {
        let id = plan.order()[pos].clone();
        for dependent in plan.dependents_of(&id) {
            if let Some(dpos) = plan.position(dependent) {
                self.waiting_on[dpos] = self.waiting_on[dpos].saturating_sub(1);
                if self.waiting_on[dpos] == 0 {
                    self.ready.insert(dpos);
                }
            }
        }
        self.entries.insert(id, entry);
    }

    fn into_entries(self) -> HashMap<String, ResourceReport> {
        self.entries
    }
}
