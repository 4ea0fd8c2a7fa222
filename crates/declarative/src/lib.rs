//! # Declarative
//!
//! A framework for declarative resource orchestration.
//!
//! This crate provides the core abstractions for declaring desired state,
//! probing current state, and converging systems to match the desired state
//! in dependency order.
//!
//! ## Core Concepts
//!
//! - **ResourceSpec**: A declared unit of desired state (immutable once loaded)
//! - **Resource**: The {probe, apply, describe} capability every kind implements
//! - **ExecutionPlan**: A deterministic topological order of resources
//! - **Executor**: Converges one resource: probe, diff, apply with retry, verify
//! - **Poller**: Waits until a readiness probe passes or time runs out
//! - **SecretBroker**: Resolves secret placeholders and redacts output
//! - **Coordinator**: Runs a plan on a worker pool and builds a [`RunReport`]
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{Adapters, Coordinator, NoHttp, NoProgress, RunOptions, SecretBroker, SystemClock};
//!
//! let secrets = SecretBroker::from_values([("db_password", "hunter2")]);
//! let adapters = Adapters { commands: &my_runner, http: &NoHttp, clock: &SystemClock };
//! let coordinator = Coordinator::new(adapters, &secrets, RunOptions::default());
//!
//! let report = coordinator.run(&resources, &mut NoProgress);
//! println!("{}", report.to_json()?);
//! std::process::exit(report.exit_code().into());
//! ```
//!
//! ## Adapter Traits
//!
//! The crate uses traits for dependency injection:
//!
//! - [`CommandRunner`]: Runs processes on the target host
//! - [`HttpTransport`]: Sends HTTP requests
//! - [`Clock`]: Source of time for backoff and polling
//! - [`ProgressCallback`]: Receives progress updates
//!
//! This allows the crate to be used without hard dependencies on
//! specific process runners, HTTP clients or UI frameworks.

pub mod adapter;
pub mod clock;
pub mod context;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod executor;
pub mod planner;
pub mod readiness;
pub mod report;
pub mod resource;
pub mod retry;
pub mod secrets;
pub mod spec;
pub mod types;

// Re-export main types at crate root
pub use adapter::{
    CommandLine, CommandOutput, CommandRequest, CommandRunner, HttpAuth, HttpRequest,
    HttpResponse, HttpTransport, NoHttp,
};
pub use clock::{CancellationToken, Clock, ManualClock, SystemClock};
pub use context::{Adapters, ApplyContext, NoProgress, ProgressCallback};
pub use coordinator::{Coordinator, RunOptions};
pub use diff::{AttributeChange, ResourceDiff};
pub use error::{
    AdapterError, Error, ErrorCategory, ExecutionError, GraphError, ReadinessError, Result,
    SecretError, ValidationError,
};
pub use executor::{ExecuteOptions, Executor};
pub use planner::ExecutionPlan;
pub use readiness::{Poller, ProbeStatus, ReadinessCheck, ReadinessSpec};
pub use report::{Outcome, ResourceReport, RunPhase, RunReport, RunSummary};
pub use resource::{BoxedResource, Resource};
pub use retry::{RetryCallback, RetryConfig, with_retry};
pub use secrets::{MASK, Secret, SecretBroker, SecretScope, referenced_names};
pub use spec::{Attributes, ResourceKind, ResourceSpec, validate, validate_all};
pub use types::ResourceState;
