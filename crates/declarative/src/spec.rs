//! Resource specifications as declared in configuration
//!
//! A [`ResourceSpec`] is read-only once loaded. The engine never mutates it;
//! observed state lives in [`crate::types::ResourceState`].

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Attribute mapping used for desired and observed state.
///
/// Ordered so diffs and reports are deterministic.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// The closed set of resource kinds the engine manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    File,
    ContainerService,
    ProcessInvocation,
    HttpResource,
    SystemdUnit,
}

impl ResourceKind {
    /// All kinds, in a stable order
    pub const ALL: [ResourceKind; 5] = [
        Self::File,
        Self::ContainerService,
        Self::ProcessInvocation,
        Self::HttpResource,
        Self::SystemdUnit,
    ];

    /// Canonical configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::ContainerService => "container_service",
            Self::ProcessInvocation => "process_invocation",
            Self::HttpResource => "http_resource",
            Self::SystemdUnit => "systemd_unit",
        }
    }

    /// Desired-state keys that must be present for this kind
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::File => &["path"],
            Self::ContainerService => &["name", "image"],
            Self::ProcessInvocation => &["command"],
            Self::HttpResource => &["url"],
            Self::SystemdUnit => &["unit"],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Allow common aliases
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "file" => Ok(Self::File),
            "container_service" | "container" => Ok(Self::ContainerService),
            "process_invocation" | "process" | "command" => Ok(Self::ProcessInvocation),
            "http_resource" | "http" => Ok(Self::HttpResource),
            "systemd_unit" | "systemd" | "service" => Ok(Self::SystemdUnit),
            _ => Err(()),
        }
    }
}

/// A declared unit of desired state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Unique identifier within a run
    pub id: String,
    /// Kind name as written in configuration
    pub kind: String,
    /// Desired-state key/value pairs
    #[serde(default)]
    pub desired: Attributes,
    /// Identifiers that must reach a terminal success before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind: kind.as_str().to_string(),
            desired: Attributes::new(),
            depends_on: Vec::new(),
        }
    }

    /// Builder-style desired-state entry
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.desired.insert(key.to_string(), value.into());
        self
    }

    /// Builder-style dependency
    pub fn after(mut self, dependency: &str) -> Self {
        self.depends_on.push(dependency.to_string());
        self
    }

    /// Parse the declared kind
    pub fn resource_kind(&self) -> Result<ResourceKind, ValidationError> {
        self.kind
            .parse()
            .map_err(|()| ValidationError::UnknownKind {
                id: self.id.clone(),
                kind: self.kind.clone(),
            })
    }

    /// Look up a desired-state string value
    pub fn desired_str(&self, key: &str) -> Option<&str> {
        self.desired.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Validate a single specification against its kind's requirements.
pub fn validate(spec: &ResourceSpec) -> Result<(), ValidationError> {
    if spec.id.trim().is_empty() {
        return Err(ValidationError::MissingField {
            id: spec.id.clone(),
            kind: spec.kind.clone(),
            field: "id".to_string(),
        });
    }

    let kind = spec.resource_kind()?;

    for field in kind.required_fields() {
        let present = spec
            .desired
            .get(*field)
            .is_some_and(|value| !value.is_null());
        if !present {
            return Err(ValidationError::MissingField {
                id: spec.id.clone(),
                kind: kind.to_string(),
                field: (*field).to_string(),
            });
        }
    }

    Ok(())
}

/// Validate a whole declaration set, including identifier uniqueness.
pub fn validate_all(specs: &[ResourceSpec]) -> Result<(), ValidationError> {
    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        validate(spec)?;
        if !seen.insert(spec.id.as_str()) {
            return Err(ValidationError::DuplicateId {
                id: spec.id.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_aliases() {
        assert_eq!("container".parse(), Ok(ResourceKind::ContainerService));
        assert_eq!("systemd-unit".parse(), Ok(ResourceKind::SystemdUnit));
        assert_eq!("HTTP".parse(), Ok(ResourceKind::HttpResource));
        assert!("helm_chart".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_validate_missing_field() {
        let spec = ResourceSpec::new("db", ResourceKind::ContainerService).with("name", "pg");
        assert_eq!(
            validate(&spec),
            Err(ValidationError::MissingField {
                id: "db".into(),
                kind: "container_service".into(),
                field: "image".into(),
            })
        );
    }

    #[test]
    fn test_validate_null_counts_as_missing() {
        let spec = ResourceSpec::new("cfg", ResourceKind::File).with("path", serde_json::Value::Null);
        assert!(matches!(
            validate(&spec),
            Err(ValidationError::MissingField { field, .. }) if field == "path"
        ));
    }

    #[test]
    fn test_validate_unknown_kind() {
        let mut spec = ResourceSpec::new("x", ResourceKind::File).with("path", "/tmp/x");
        spec.kind = "helm_chart".into();
        assert_eq!(
            validate(&spec),
            Err(ValidationError::UnknownKind {
                id: "x".into(),
                kind: "helm_chart".into(),
            })
        );
    }

    #[test]
    fn test_validate_all_rejects_duplicates() {
        let a = ResourceSpec::new("a", ResourceKind::SystemdUnit).with("unit", "nginx.service");
        let result = validate_all(&[a.clone(), a]);
        assert_eq!(result, Err(ValidationError::DuplicateId { id: "a".into() }));
    }

    #[test]
    fn test_every_kind_accepts_its_required_fields() {
        for kind in ResourceKind::ALL {
            let mut spec = ResourceSpec::new("r", kind);
            for field in kind.required_fields() {
                spec = spec.with(field, "value");
            }
            assert_eq!(validate(&spec), Ok(()), "kind {kind}");
        }
    }
}
