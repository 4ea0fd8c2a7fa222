//! Concrete resource kinds
//!
//! Every kind decodes its desired-state mapping into typed settings when the
//! configuration is loaded, so shape errors surface before anything runs.
//! [`ManagedResource`] is the closed set the engine executes.

mod container;
mod file;
mod http;
mod process;
mod systemd;
#[cfg(test)]
mod testing;
pub mod yaml_path;

pub use container::ContainerResource;
pub use file::FileResource;
pub use http::HttpResource;
pub use process::ProcessResource;
pub use systemd::SystemdUnit;

use declarative::{
    AdapterError, ApplyContext, Attributes, ReadinessSpec, Resource, ResourceDiff, ResourceKind,
    ResourceSpec, ValidationError,
};
use serde::de::DeserializeOwned;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Settings that come from the run rather than from a resource
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Container runtime CLI
    pub container_runtime: String,
    /// Directory relative host paths are resolved against
    pub base_dir: PathBuf,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            container_runtime: "docker".to_string(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl RuntimeSettings {
    /// Expand `~` and anchor relative paths at the config directory
    pub fn host_path(&self, path: &str) -> PathBuf {
        let expanded = expand(path);
        if expanded.is_relative() {
            self.base_dir.join(expanded)
        } else {
            expanded
        }
    }
}

/// Identity shared by every kind
#[derive(Debug, Clone)]
pub struct Common {
    pub id: String,
    pub depends_on: Vec<String>,
    pub ready: Option<ReadinessSpec>,
}

impl Common {
    fn from_spec(spec: &ResourceSpec) -> Result<Self, ValidationError> {
        Ok(Self {
            id: spec.id.clone(),
            depends_on: spec.depends_on.clone(),
            ready: spec
                .desired
                .get("ready")
                .map(|value| ReadinessSpec::from_value(&spec.id, value))
                .transpose()?,
        })
    }
}

/// Decode the desired mapping, minus the `ready` block, into typed settings
fn decode<T: DeserializeOwned>(spec: &ResourceSpec) -> Result<T, ValidationError> {
    let fields: serde_json::Map<String, serde_json::Value> = spec
        .desired
        .iter()
        .filter(|(key, _)| key.as_str() != "ready")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    serde_json::from_value(serde_json::Value::Object(fields))
        .map_err(|e| invalid(&spec.id, "desired", e.to_string()))
}

fn invalid(id: &str, field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        id: id.to_string(),
        field: field.to_string(),
        message: message.into(),
    }
}

/// Expand `~` in a path
fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Classify a filesystem error
fn io_error(action: &str, path: &Path, error: &io::Error) -> AdapterError {
    let message = format!("failed to {action} {}: {error}", path.display());
    match error.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::ResourceBusy => AdapterError::transient(message),
        _ => AdapterError::permanent(message),
    }
}

/// Lock a mutex, recovering the data if a worker panicked while holding it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Managed resource
// ============================================================================

/// One declared resource, of any supported kind
#[derive(Debug)]
pub enum ManagedResource {
    File(FileResource),
    Container(ContainerResource),
    Process(ProcessResource),
    Http(HttpResource),
    Systemd(SystemdUnit),
}

impl ManagedResource {
    /// Validate a declaration and build its resource
    pub fn from_spec(
        spec: &ResourceSpec,
        settings: &RuntimeSettings,
    ) -> Result<Self, ValidationError> {
        declarative::validate(spec)?;
        Ok(match spec.resource_kind()? {
            ResourceKind::File => Self::File(FileResource::from_spec(spec, settings)?),
            ResourceKind::ContainerService => {
                Self::Container(ContainerResource::from_spec(spec, settings)?)
            }
            ResourceKind::ProcessInvocation => {
                Self::Process(ProcessResource::from_spec(spec, settings)?)
            }
            ResourceKind::HttpResource => Self::Http(HttpResource::from_spec(spec)?),
            ResourceKind::SystemdUnit => Self::Systemd(SystemdUnit::from_spec(spec)?),
        })
    }

    /// Build every declared resource, stopping at the first invalid one
    pub fn from_specs(
        specs: &[ResourceSpec],
        settings: &RuntimeSettings,
    ) -> Result<Vec<Self>, ValidationError> {
        declarative::validate_all(specs)?;
        specs
            .iter()
            .map(|spec| Self::from_spec(spec, settings))
            .collect()
    }
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            ManagedResource::File($inner) => $body,
            ManagedResource::Container($inner) => $body,
            ManagedResource::Process($inner) => $body,
            ManagedResource::Http($inner) => $body,
            ManagedResource::Systemd($inner) => $body,
        }
    };
}

impl Resource for ManagedResource {
    fn id(&self) -> &str {
        dispatch!(self, r => r.id())
    }

    fn dependencies(&self) -> &[String] {
        dispatch!(self, r => r.dependencies())
    }

    fn resource_type(&self) -> &'static str {
        dispatch!(self, r => r.resource_type())
    }

    fn describe(&self) -> String {
        dispatch!(self, r => r.describe())
    }

    fn desired(&self) -> Attributes {
        dispatch!(self, r => r.desired())
    }

    fn probe(&self, ctx: &ApplyContext<'_>) -> Result<Attributes, AdapterError> {
        dispatch!(self, r => r.probe(ctx))
    }

    fn apply(&self, ctx: &ApplyContext<'_>, diff: &ResourceDiff) -> Result<(), AdapterError> {
        dispatch!(self, r => r.apply(ctx, diff))
    }

    fn readiness(&self) -> Option<&ReadinessSpec> {
        dispatch!(self, r => r.readiness())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::ReadinessCheck;
    use serde_json::json;

    #[test]
    fn test_builds_each_kind() {
        let settings = RuntimeSettings::default();
        let specs = [
            ResourceSpec::new("conf", ResourceKind::File).with("path", "/tmp/x"),
            ResourceSpec::new("db", ResourceKind::ContainerService)
                .with("name", "db")
                .with("image", "postgres:15"),
            ResourceSpec::new("init", ResourceKind::ProcessInvocation).with("command", "true"),
            ResourceSpec::new("admin", ResourceKind::HttpResource).with("url", "http://x/api"),
            ResourceSpec::new("unit", ResourceKind::SystemdUnit).with("unit", "fluent-bit"),
        ];

        let types: Vec<&str> = ManagedResource::from_specs(&specs, &settings)
            .unwrap()
            .iter()
            .map(Resource::resource_type)
            .collect();
        assert_eq!(
            types,
            ["file", "container_service", "process_invocation", "http_resource", "systemd_unit"]
        );
    }

    #[test]
    fn test_missing_required_field() {
        let spec = ResourceSpec::new("db", ResourceKind::ContainerService).with("name", "db");
        let err = ManagedResource::from_spec(&spec, &RuntimeSettings::default()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingField {
                id: "db".into(),
                kind: "container_service".into(),
                field: "image".into(),
            }
        );
    }

    #[test]
    fn test_unknown_desired_key_is_invalid() {
        let spec = ResourceSpec::new("unit", ResourceKind::SystemdUnit)
            .with("unit", "x")
            .with("enabeld", true);
        let err = ManagedResource::from_spec(&spec, &RuntimeSettings::default()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { ref message, .. } if message.contains("enabeld")));
    }

    #[test]
    fn test_ready_block_is_parsed() {
        let spec = ResourceSpec::new("db", ResourceKind::ContainerService)
            .with("name", "db")
            .with("image", "postgres:15")
            .with("ready", json!({"tcp": "127.0.0.1:5432", "timeout_secs": 30}));

        let resource = ManagedResource::from_spec(&spec, &RuntimeSettings::default()).unwrap();
        let ready = resource.readiness().unwrap();
        assert_eq!(
            ready.check,
            ReadinessCheck::Tcp {
                address: "127.0.0.1:5432".into()
            }
        );
    }

    #[test]
    fn test_host_path() {
        let settings = RuntimeSettings {
            base_dir: PathBuf::from("/srv/stack"),
            ..RuntimeSettings::default()
        };
        assert_eq!(settings.host_path("files/a.conf"), PathBuf::from("/srv/stack/files/a.conf"));
        assert_eq!(settings.host_path("/etc/a.conf"), PathBuf::from("/etc/a.conf"));
    }
}
