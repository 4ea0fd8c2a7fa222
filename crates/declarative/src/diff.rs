//! Diff computation for resources

use crate::secrets::SecretBroker;
use crate::spec::Attributes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One desired-state key whose observed value differs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub key: String,
    /// Observed value, `None` when the probe did not report the key
    pub observed: Option<Value>,
    pub desired: Value,
}

impl AttributeChange {
    /// One-line rendering with secret values masked
    pub fn render(&self, secrets: &SecretBroker) -> String {
        let from = self
            .observed
            .as_ref()
            .map_or_else(|| "(unset)".to_string(), render_value);
        secrets.redact(&format!("{}: {} -> {}", self.key, from, render_value(&self.desired)))
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A diff between observed and desired state of a resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDiff {
    /// Unique identifier of the resource
    pub resource_id: String,
    /// Keys that need to change, in key order
    pub changes: Vec<AttributeChange>,
}

impl ResourceDiff {
    /// Compare a desired projection against probed attributes.
    ///
    /// Only keys present in `desired` are compared; extra observed keys
    /// are informational.
    pub fn compute(resource_id: &str, desired: &Attributes, observed: &Attributes) -> Self {
        let changes = desired
            .iter()
            .filter(|(key, value)| observed.get(key.as_str()) != Some(*value))
            .map(|(key, value)| AttributeChange {
                key: key.clone(),
                observed: observed.get(key).cloned(),
                desired: value.clone(),
            })
            .collect();

        Self {
            resource_id: resource_id.to_string(),
            changes,
        }
    }

    /// Check if desired and observed already agree
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Keys that differ
    pub fn keys(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.key.clone()).collect()
    }

    /// Check whether a particular key needs to change
    pub fn changes_key(&self, key: &str) -> bool {
        self.changes.iter().any(|c| c.key == key)
    }

    /// Desired value for a changing key
    pub fn desired(&self, key: &str) -> Option<&Value> {
        self.changes.iter().find(|c| c.key == key).map(|c| &c.desired)
    }

    /// Rendered changes with secret values masked
    pub fn render(&self, secrets: &SecretBroker) -> Vec<String> {
        self.changes.iter().map(|c| c.render(secrets)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_equal_state_has_no_changes() {
        let desired = attrs(&[("exists", json!(true)), ("running", json!(true))]);
        let mut observed = desired.clone();
        observed.insert("id".into(), json!("3f2a"));

        let diff = ResourceDiff::compute("db", &desired, &observed);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_changed_and_missing_keys() {
        let desired = attrs(&[("image", json!("postgres:15")), ("running", json!(true))]);
        let observed = attrs(&[("image", json!("postgres:14"))]);

        let diff = ResourceDiff::compute("db", &desired, &observed);
        assert_eq!(diff.keys(), vec!["image", "running"]);
        assert!(diff.changes_key("image"));
        assert_eq!(diff.desired("running"), Some(&json!(true)));
        assert_eq!(diff.changes[1].observed, None);
    }

    #[test]
    fn test_render_masks_secrets() {
        let secrets = SecretBroker::from_values([("token", "tok-998877")]);
        let desired = attrs(&[("header", json!("Bearer tok-998877"))]);
        let diff = ResourceDiff::compute("api", &desired, &Attributes::new());

        let rendered = diff.render(&secrets);
        assert_eq!(rendered, vec!["header: (unset) -> Bearer ********"]);
    }
}
