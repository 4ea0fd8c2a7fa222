//! Core types for observed resource state

use crate::spec::Attributes;
use serde::{Deserialize, Serialize};

/// What the engine last saw of a resource
///
/// Created on the first probe of a run and updated after every probe or
/// action. Never carried across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    /// Attributes reported by the last probe
    pub observed: Attributes,
    /// Whether the last probe matched desired state and passed readiness
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ResourceState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            observed: Attributes::new(),
            healthy: false,
            last_error: None,
        }
    }

    /// Record the result of a successful probe
    pub fn record_probe(&mut self, observed: Attributes) {
        self.observed = observed;
        self.last_error = None;
    }

    /// Record a failure; the resource is no longer considered healthy
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.healthy = false;
        self.last_error = Some(error.into());
    }

    pub fn mark_healthy(&mut self) {
        self.healthy = true;
        self.last_error = None;
    }
}
