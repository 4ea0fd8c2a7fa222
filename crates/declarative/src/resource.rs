//! Resource trait for declarative state management
//!
//! A Resource represents something that can be in a certain state,
//! and can be changed to reach a desired state.

use crate::context::ApplyContext;
use crate::diff::ResourceDiff;
use crate::error::AdapterError;
use crate::readiness::ReadinessSpec;
use crate::spec::Attributes;
use std::fmt;

/// Core trait for declarative resources
///
/// Every resource kind implements this trait, which provides:
/// - Identity and ordering (id, dependencies, type, description)
/// - State detection (probe vs desired projection)
/// - State convergence (apply)
/// - An optional readiness gate for dependents
///
/// The executor is written once against this trait. Probes and applies must
/// go through the [`ApplyContext`] adapters so that placeholders are
/// resolved and output is redacted in one place.
///
/// # Example
///
/// ```ignore
/// use declarative::{Attributes, AdapterError, ApplyContext, Resource, ResourceDiff};
///
/// #[derive(Debug)]
/// struct Marker { id: String, path: String }
///
/// impl Resource for Marker {
///     fn id(&self) -> &str { &self.id }
///     fn dependencies(&self) -> &[String] { &[] }
///     fn resource_type(&self) -> &'static str { "marker" }
///     fn describe(&self) -> String { format!("marker file {}", self.path) }
///
///     fn desired(&self) -> Attributes {
///         Attributes::from([("exists".into(), true.into())])
///     }
///
///     fn probe(&self, _ctx: &ApplyContext<'_>) -> Result<Attributes, AdapterError> {
///         let exists = std::path::Path::new(&self.path).exists();
///         Ok(Attributes::from([("exists".into(), exists.into())]))
///     }
///
///     fn apply(&self, _ctx: &ApplyContext<'_>, _diff: &ResourceDiff) -> Result<(), AdapterError> {
///         std::fs::write(&self.path, "").map_err(|e| AdapterError::permanent(e.to_string()))
///     }
/// }
/// ```
pub trait Resource: Send + Sync + fmt::Debug {
    /// Unique identifier within a run
    fn id(&self) -> &str;

    /// Identifiers of resources that must succeed first
    fn dependencies(&self) -> &[String];

    /// Resource type category
    ///
    /// Used for grouping and display. Examples:
    /// - "file"
    /// - "container_service"
    /// - "systemd_unit"
    fn resource_type(&self) -> &'static str;

    /// Human-readable description of what this resource manages
    ///
    /// May contain placeholders but never resolved secret values.
    fn describe(&self) -> String;

    /// The comparable projection of desired state
    ///
    /// Keys here are compared against the same keys returned by
    /// [`Resource::probe`]; a resource is satisfied when all of them match.
    /// Read after the first probe of each pass, so a kind may derive it from
    /// values resolved while probing.
    fn desired(&self) -> Attributes;

    /// Query the current observed state
    fn probe(&self, ctx: &ApplyContext<'_>) -> Result<Attributes, AdapterError>;

    /// Perform the minimal change that moves observed toward desired
    ///
    /// Only called when `diff` is non-empty and never in a dry run.
    fn apply(&self, ctx: &ApplyContext<'_>, diff: &ResourceDiff) -> Result<(), AdapterError>;

    /// Readiness gate awaited before dependents start
    fn readiness(&self) -> Option<&ReadinessSpec> {
        None
    }
}

impl<R: Resource + ?Sized> Resource for Box<R> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn dependencies(&self) -> &[String] {
        (**self).dependencies()
    }

    fn resource_type(&self) -> &'static str {
        (**self).resource_type()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn desired(&self) -> Attributes {
        (**self).desired()
    }

    fn probe(&self, ctx: &ApplyContext<'_>) -> Result<Attributes, AdapterError> {
        (**self).probe(ctx)
    }

    fn apply(&self, ctx: &ApplyContext<'_>, diff: &ResourceDiff) -> Result<(), AdapterError> {
        (**self).apply(ctx, diff)
    }

    fn readiness(&self) -> Option<&ReadinessSpec> {
        (**self).readiness()
    }
}

/// A boxed resource for type-erased storage
pub type BoxedResource = Box<dyn Resource>;
