//! Secret broker - holds sensitive values and keeps them out of output
//!
//! Values enter the broker at run start (process scope) or are captured
//! from a prior step's output (run scope). They leave it in exactly two
//! ways: [`SecretBroker::resolve`] at the adapter call boundary, and never
//! otherwise. Everything written to a log or report goes through
//! [`SecretBroker::redact`].

use crate::error::SecretError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{LazyLock, RwLock};

/// Fixed replacement for any secret value in output
pub const MASK: &str = "********";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*secret\.([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Lifetime of a secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretScope {
    /// Supplied at start, shared by every run of this process
    Process,
    /// Captured during a run, discarded when the next run begins
    Run,
}

/// A named sensitive value
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    value: String,
    pub scope: SecretScope,
}

impl Secret {
    pub fn new(name: impl Into<String>, value: impl Into<String>, scope: SecretScope) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            scope,
        }
    }

    /// Raw value, for adapter calls only
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &MASK)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Placeholder text referencing a secret by name
pub fn placeholder(name: &str) -> String {
    format!("{{{{ secret.{name} }}}}")
}

/// Names of every secret referenced by placeholders in a JSON value
pub fn referenced_names(value: &serde_json::Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_references(value, &mut names);
    names
}

fn collect_references(value: &serde_json::Value, names: &mut BTreeSet<String>) {
    use serde_json::Value;
    match value {
        Value::String(s) => {
            names.extend(PLACEHOLDER.captures_iter(s).map(|caps| caps[1].to_string()));
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, names)),
        _ => {}
    }
}

/// Holder and redactor of secret values
///
/// Process-scope values are fixed at construction and read without locking.
/// Run-scope values sit behind a lock because steps capture them while
/// other workers may be redacting.
#[derive(Default)]
pub struct SecretBroker {
    process: BTreeMap<String, Secret>,
    run: RwLock<BTreeMap<String, Secret>>,
}

impl SecretBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a broker from process-scope name/value pairs
    pub fn from_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut broker = Self::new();
        for (name, value) in values {
            broker.insert(name, value);
        }
        broker
    }

    /// Add a process-scope secret (only possible before sharing the broker)
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.process
            .insert(name.clone(), Secret::new(name, value, SecretScope::Process));
    }

    /// Register a value captured during a run
    pub fn capture(&self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let secret = Secret::new(name.clone(), value, SecretScope::Run);
        match self.run.write() {
            Ok(mut run) => {
                run.insert(name, secret);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(name, secret);
            }
        }
    }

    /// Drop every run-scope secret
    pub fn clear_run_scope(&self) {
        match self.run.write() {
            Ok(mut run) => run.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Whether a secret with this name is held in either scope
    pub fn contains(&self, name: &str) -> bool {
        self.process.contains_key(name) || self.with_run(|run| run.contains_key(name))
    }

    /// Number of secrets held across both scopes
    pub fn len(&self) -> usize {
        self.process.len() + self.with_run(BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the raw value of a single secret
    pub fn value(&self, name: &str) -> Result<String, SecretError> {
        if let Some(secret) = self.process.get(name) {
            return Ok(secret.value.clone());
        }
        self.with_run(|run| run.get(name).map(|s| s.value.clone()))
            .ok_or_else(|| SecretError::UnknownSecret {
                name: name.to_string(),
            })
    }

    /// Substitute every `{{ secret.NAME }}` placeholder with its value.
    ///
    /// Only for use at the adapter call boundary; never log the result.
    pub fn resolve(&self, text: &str) -> Result<String, SecretError> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }

        let mut resolved = String::with_capacity(text.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let whole = caps.get(0).expect("group 0 always matches");
            resolved.push_str(&text[last..whole.start()]);
            resolved.push_str(&self.value(&caps[1])?);
            last = whole.end();
        }
        resolved.push_str(&text[last..]);
        Ok(resolved)
    }

    /// Resolve placeholders in every string of a JSON value
    pub fn resolve_value(&self, value: &serde_json::Value) -> Result<serde_json::Value, SecretError> {
        use serde_json::Value;
        Ok(match value {
            Value::String(s) => Value::String(self.resolve(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_value(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
                    .collect::<Result<_, SecretError>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Replace every known secret value occurring in `text` with [`MASK`].
    ///
    /// Occurrences are located in the original text, including overlapping
    /// ones, and each merged run of secret bytes becomes a single mask.
    pub fn redact(&self, text: &str) -> String {
        let mut values: Vec<String> = self
            .process
            .values()
            .map(|s| s.value.clone())
            .chain(self.with_run(|run| {
                run.values().map(|s| s.value.clone()).collect::<Vec<_>>()
            }))
            .filter(|v| !v.is_empty())
            .collect();
        values.sort_unstable();
        values.dedup();

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for value in &values {
            let mut from = 0;
            while let Some(found) = text[from..].find(value.as_str()) {
                let start = from + found;
                ranges.push((start, start + value.len()));
                // Step one character so overlapping occurrences are found too
                from = start + text[start..].chars().next().map_or(1, char::len_utf8);
            }
        }
        if ranges.is_empty() {
            return text.to_string();
        }
        ranges.sort_unstable();

        let mut redacted = String::with_capacity(text.len());
        let mut last = 0;
        let mut iter = ranges.into_iter().peekable();
        while let Some((start, mut end)) = iter.next() {
            while let Some(&(next_start, next_end)) = iter.peek() {
                if next_start > end {
                    break;
                }
                end = end.max(next_end);
                iter.next();
            }
            redacted.push_str(&text[last..start]);
            redacted.push_str(MASK);
            last = end;
        }
        redacted.push_str(&text[last..]);
        redacted
    }

    /// Mask secret values in every string of a JSON value
    pub fn redact_value(&self, value: &serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(self.redact(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn with_run<T>(&self, f: impl FnOnce(&BTreeMap<String, Secret>) -> T) -> T {
        match self.run.read() {
            Ok(run) => f(&run),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl fmt::Debug for SecretBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .process
            .keys()
            .cloned()
            .chain(self.with_run(|run| run.keys().cloned().collect::<Vec<_>>()))
            .collect();
        f.debug_struct("SecretBroker").field("names", &names).finish()
    }
}
