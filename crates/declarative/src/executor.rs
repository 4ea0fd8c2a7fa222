//! Execution engine - converges one resource to its desired state
//!
//! probe -> diff -> apply (with retry) -> verify -> readiness gate

use crate::clock::CancellationToken;
use crate::context::{Adapters, ApplyContext};
use crate::diff::ResourceDiff;
use crate::error::{AdapterError, ExecutionError};
use crate::report::{Outcome, ResourceReport};
use crate::resource::Resource;
use crate::retry::{RetryCallback, RetryConfig, with_retry};
use crate::secrets::SecretBroker;
use crate::spec::Attributes;
use crate::types::ResourceState;
use chrono::Utc;
use std::time::Duration;

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Don't make changes, just report what would happen
    pub dry_run: bool,
    pub retry: RetryConfig,
    /// Readiness timeout for checks that declare none
    pub default_timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            retry: RetryConfig::default(),
            default_timeout: Duration::from_secs(60),
        }
    }
}

/// Applies single resources
///
/// Shared by every worker of a run; holds only borrowed, thread-safe state.
pub struct Executor<'a> {
    adapters: Adapters<'a>,
    secrets: &'a SecretBroker,
    cancel: &'a CancellationToken,
    options: ExecuteOptions,
}

/// Logs retries through the resource's redacting context
struct LogRetries<'c, 'a> {
    ctx: &'c ApplyContext<'a>,
    step: &'static str,
}

impl RetryCallback for LogRetries<'_, '_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &AdapterError, delay: Duration) {
        log::warn!(
            "[{}] {} attempt {}/{} failed, retrying in {:?}: {}",
            self.ctx.resource_id(),
            self.step,
            attempt,
            max_attempts,
            delay,
            self.ctx.redact(&error.to_string())
        );
    }
}

impl<'a> Executor<'a> {
    pub fn new(
        adapters: Adapters<'a>,
        secrets: &'a SecretBroker,
        cancel: &'a CancellationToken,
        options: ExecuteOptions,
    ) -> Self {
        Self {
            adapters,
            secrets,
            cancel,
            options,
        }
    }

    pub fn options(&self) -> &ExecuteOptions {
        &self.options
    }

    /// Converge one resource and report what happened.
    ///
    /// Never panics on resource failure; every error ends up in the
    /// returned report with secrets masked.
    pub fn execute<R: Resource + ?Sized>(&self, resource: &R) -> ResourceReport {
        let mut report = ResourceReport::new(
            resource.id(),
            resource.resource_type(),
            self.secrets.redact(&resource.describe()),
            Outcome::SkippedDueToCancellation,
        );

        if self.cancel.is_cancelled() {
            return report;
        }

        report.started_at = Some(Utc::now());
        let ctx = ApplyContext::new(
            resource.id(),
            self.options.dry_run,
            self.secrets,
            self.cancel,
            self.adapters,
        );
        let mut state = ResourceState::new(resource.id());

        let result = self.converge(resource, &ctx, &mut state, &mut report);
        report.outcome = match result {
            Ok(outcome) => {
                state.mark_healthy();
                outcome
            }
            Err(e) => {
                let error = ctx.redact(&e.to_string());
                log::error!("[{}] {}", resource.id(), error);
                state.record_error(error.clone());
                Outcome::Failed { error }
            }
        };

        if !report.outcome.is_failure() && self.options.dry_run {
            // A dry run never proved the resource usable
            state.healthy = false;
        }

        report.state = Some(state);
        report.finished_at = Some(Utc::now());
        report.redact(self.secrets);
        report
    }

    fn converge<R: Resource + ?Sized>(
        &self,
        resource: &R,
        ctx: &ApplyContext<'_>,
        state: &mut ResourceState,
        report: &mut ResourceReport,
    ) -> Result<Outcome, ExecutionError> {
        let observed = self.probe(resource, ctx)?;
        let desired = resource.desired();
        let diff = ResourceDiff::compute(resource.id(), &desired, &observed);
        state.record_probe(observed);

        if diff.is_empty() {
            ctx.debug("already in desired state");
            if !ctx.dry_run {
                self.await_ready(resource, ctx)?;
            }
            return Ok(Outcome::AlreadySatisfied);
        }

        report.changes = diff.render(self.secrets);
        for change in &report.changes {
            ctx.info(&format!("change {change}"));
        }

        if ctx.dry_run {
            return Ok(Outcome::Planned);
        }

        let outcome = with_retry(
            &self.options.retry,
            ctx.clock(),
            self.cancel,
            Some(&LogRetries { ctx, step: "apply" }),
            || resource.apply(ctx, &diff),
        );
        report.attempts = outcome.attempts;
        if let Err(last) = outcome.result {
            return Err(match last {
                AdapterError::Transient { .. } => ExecutionError::RetriesExhausted {
                    attempts: outcome.attempts,
                    last,
                },
                other => ExecutionError::Adapter(other),
            });
        }

        // Verify against a fresh probe
        let observed = self.probe(resource, ctx)?;
        let remaining = ResourceDiff::compute(resource.id(), &desired, &observed);
        state.record_probe(observed);
        if !remaining.is_empty() {
            return Err(ExecutionError::ApplyVerificationFailed {
                remaining: remaining.keys(),
            });
        }

        self.await_ready(resource, ctx)?;
        ctx.info("applied");
        Ok(Outcome::Applied)
    }

    /// Probe with the same retry policy as apply
    fn probe<R: Resource + ?Sized>(
        &self,
        resource: &R,
        ctx: &ApplyContext<'_>,
    ) -> Result<Attributes, ExecutionError> {
        let outcome = with_retry(
            &self.options.retry,
            ctx.clock(),
            self.cancel,
            Some(&LogRetries { ctx, step: "probe" }),
            || resource.probe(ctx),
        );
        outcome.result.map_err(ExecutionError::Adapter)
    }

    fn await_ready<R: Resource + ?Sized>(
        &self,
        resource: &R,
        ctx: &ApplyContext<'_>,
    ) -> Result<(), ExecutionError> {
        if let Some(readiness) = resource.readiness() {
            readiness.wait(ctx, self.options.default_timeout)?;
        }
        Ok(())
    }
}
