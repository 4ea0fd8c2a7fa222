//! Key paths into YAML documents
//!
//! `serve.vllm.args[1]` addresses mapping keys with dots and list indices
//! with brackets; `labels["app.kubernetes.io/name"]` quotes keys that
//! contain dots.

use serde_yaml::{Mapping, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Most nulls a single index may pad onto the end of a list
const MAX_PADDING: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty key path")]
    Empty,

    #[error("unbalanced brackets in '{0}'")]
    Unbalanced(String),

    #[error("expected a {expected} at '{at}', found {found}")]
    TypeMismatch {
        at: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("index {index} at '{at}' is too far past the end of a list of {len}")]
    IndexOutOfReach { at: String, index: usize, len: usize },
}

impl KeyPath {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for KeyPath {
    type Err = PathError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_brackets = false;

        for ch in raw.chars() {
            match ch {
                '.' if !in_brackets => {
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                }
                '[' if !in_brackets => {
                    if !current.is_empty() {
                        segments.push(Segment::Key(std::mem::take(&mut current)));
                    }
                    in_brackets = true;
                }
                ']' if in_brackets => {
                    let inner = std::mem::take(&mut current);
                    let inner = inner.trim().trim_matches('"').trim_matches('\'').trim();
                    segments.push(match inner.parse::<usize>() {
                        Ok(index) => Segment::Index(index),
                        Err(_) => Segment::Key(inner.to_string()),
                    });
                    in_brackets = false;
                }
                '[' | ']' => return Err(PathError::Unbalanced(raw.to_string())),
                _ => current.push(ch),
            }
        }

        if in_brackets {
            return Err(PathError::Unbalanced(raw.to_string()));
        }
        if !current.is_empty() {
            segments.push(Segment::Key(current));
        }
        if segments.is_empty() {
            return Err(PathError::Empty);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

/// Look up the value at `path`
pub fn get<'a>(doc: &'a Value, path: &KeyPath) -> Option<&'a Value> {
    path.segments().iter().try_fold(doc, |node, segment| match segment {
        Segment::Key(key) => node.as_mapping()?.get(key.as_str()),
        Segment::Index(index) => node.as_sequence()?.get(*index),
    })
}

/// Set the value at `path`, creating missing structure.
///
/// Missing keys get empty mappings, short lists are padded with nulls, and
/// null or empty containers are converted to the shape the path needs.
/// Any other shape mismatch is an error.
pub fn set(doc: &mut Value, path: &KeyPath, value: Value) -> Result<(), PathError> {
    let (last, parents) = path
        .segments()
        .split_last()
        .ok_or(PathError::Empty)?;

    let mut node = doc;
    for (depth, segment) in parents.iter().enumerate() {
        let at = || render(&path.segments()[..=depth]);
        node = match segment {
            Segment::Key(key) => mapping(node, &at)?
                .entry(Value::String(key.clone()))
                .or_insert_with(|| Value::Mapping(Mapping::new())),
            Segment::Index(index) => {
                let item = slot(sequence(node, &at)?, *index, &at)?;
                if item.is_null() {
                    *item = Value::Mapping(Mapping::new());
                }
                item
            }
        };
    }

    let at = || path.as_str().to_string();
    match last {
        Segment::Key(key) => {
            mapping(node, &at)?.insert(Value::String(key.clone()), value);
        }
        Segment::Index(index) => *slot(sequence(node, &at)?, *index, &at)? = value,
    }
    Ok(())
}

fn mapping<'a>(
    node: &'a mut Value,
    at: &dyn Fn() -> String,
) -> Result<&'a mut Mapping, PathError> {
    let convertible = match node {
        Value::Null => true,
        Value::Sequence(seq) => seq.is_empty(),
        _ => false,
    };
    if convertible {
        *node = Value::Mapping(Mapping::new());
    }
    let found = type_name(node);
    node.as_mapping_mut().ok_or_else(|| PathError::TypeMismatch {
        at: at(),
        expected: "mapping",
        found,
    })
}

fn sequence<'a>(
    node: &'a mut Value,
    at: &dyn Fn() -> String,
) -> Result<&'a mut Vec<Value>, PathError> {
    let convertible = match node {
        Value::Null => true,
        Value::Mapping(map) => map.is_empty(),
        _ => false,
    };
    if convertible {
        *node = Value::Sequence(Vec::new());
    }
    let found = type_name(node);
    node.as_sequence_mut().ok_or_else(|| PathError::TypeMismatch {
        at: at(),
        expected: "list",
        found,
    })
}

fn slot<'a>(
    seq: &'a mut Vec<Value>,
    index: usize,
    at: &dyn Fn() -> String,
) -> Result<&'a mut Value, PathError> {
    let len = seq.len();
    if index >= len {
        let padded = index
            .checked_add(1)
            .filter(|needed| needed - len <= MAX_PADDING)
            .ok_or_else(|| PathError::IndexOutOfReach { at: at(), index, len })?;
        seq.resize(padded, Value::Null);
    }
    Ok(&mut seq[index])
}

fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Key(key) if key.contains('.') => out.push_str(&format!("[\"{key}\"]")),
            Segment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            Segment::Index(index) => out.push_str(&format!("[{index}]")),
        }
    }
    out
}
