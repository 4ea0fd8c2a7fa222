//! Systemd unit - enablement and run state via systemctl

use super::{Common, decode, invalid};
use declarative::{
    AdapterError, ApplyContext, Attributes, CommandRequest, ReadinessSpec, Resource, ResourceDiff,
    ResourceSpec, ValidationError,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum UnitState {
    Started,
    Stopped,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitSettings {
    unit: String,
    enabled: Option<bool>,
    state: Option<UnitState>,
    #[serde(default)]
    daemon_reload: bool,
}

#[derive(Debug)]
pub struct SystemdUnit {
    common: Common,
    unit: String,
    enabled: Option<bool>,
    state: UnitState,
    daemon_reload: bool,
}

impl SystemdUnit {
    pub fn from_spec(spec: &ResourceSpec) -> Result<Self, ValidationError> {
        let common = Common::from_spec(spec)?;
        let s: UnitSettings = decode(spec)?;

        if s.unit.trim().is_empty() || s.unit.contains(char::is_whitespace) {
            return Err(invalid(&spec.id, "unit", format!("'{}' is not a unit name", s.unit)));
        }

        Ok(Self {
            common,
            unit: s.unit,
            enabled: s.enabled,
            // A unit declared with nothing else is expected to run
            state: s.state.unwrap_or(UnitState::Started),
            daemon_reload: s.daemon_reload,
        })
    }

    fn systemctl(&self, verb: &str) -> CommandRequest {
        CommandRequest::new("systemctl").args([verb, self.unit.as_str()])
    }

    /// Run a query verb and return its one-word answer.
    ///
    /// `is-enabled` and `is-active` exit non-zero for negative answers, so
    /// only an empty answer with an unexpected error counts as a failure.
    fn query(&self, ctx: &ApplyContext<'_>, verb: &str) -> Result<String, AdapterError> {
        let output = ctx.exec(&self.systemctl(verb))?;
        let answer = output.stdout_str().trim().to_string();
        if !answer.is_empty() || output.success {
            return Ok(answer);
        }

        let stderr = output.stderr_str();
        let lower = stderr.to_lowercase();
        if lower.contains("not found") || lower.contains("no such file") {
            return Ok("not-found".to_string());
        }
        Err(AdapterError::from_command_failure(
            "systemctl",
            output.code,
            &ctx.redact(&stderr),
        ))
    }

    fn run(&self, ctx: &ApplyContext<'_>, request: &CommandRequest) -> Result<(), AdapterError> {
        ctx.exec_checked(request)?;
        ctx.info(&request.command_line());
        Ok(())
    }
}

impl Resource for SystemdUnit {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn dependencies(&self) -> &[String] {
        &self.common.depends_on
    }

    fn resource_type(&self) -> &'static str {
        "systemd_unit"
    }

    fn describe(&self) -> String {
        let state = match self.state {
            UnitState::Started => "started",
            UnitState::Stopped => "stopped",
        };
        match self.enabled {
            Some(true) => format!("unit {} (enabled, {state})", self.unit),
            Some(false) => format!("unit {} (disabled, {state})", self.unit),
            None => format!("unit {} ({state})", self.unit),
        }
    }

    fn desired(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("active".into(), json!(self.state == UnitState::Started));
        if let Some(enabled) = self.enabled {
            attrs.insert("enabled".into(), json!(enabled));
        }
        attrs
    }

    fn probe(&self, ctx: &ApplyContext<'_>) -> Result<Attributes, AdapterError> {
        let enabled = self.query(ctx, "is-enabled")?;
        let active = self.query(ctx, "is-active")?;
        ctx.debug(&format!("is-enabled={enabled} is-active={active}"));

        Ok(Attributes::from([
            (
                "enabled".to_string(),
                json!(matches!(enabled.as_str(), "enabled" | "enabled-runtime")),
            ),
            (
                "active".to_string(),
                json!(matches!(active.as_str(), "active" | "reloading")),
            ),
        ]))
    }

    fn apply(&self, ctx: &ApplyContext<'_>, diff: &ResourceDiff) -> Result<(), AdapterError> {
        if self.daemon_reload {
            self.run(ctx, &CommandRequest::new("systemctl").arg("daemon-reload"))?;
        }

        if diff.changes_key("enabled") {
            let verb = if self.enabled == Some(true) { "enable" } else { "disable" };
            self.run(ctx, &self.systemctl(verb))?;
        }

        if diff.changes_key("active") {
            let verb = match self.state {
                UnitState::Started => "start",
                UnitState::Stopped => "stop",
            };
            self.run(ctx, &self.systemctl(verb))?;
        }
        Ok(())
    }

    fn readiness(&self) -> Option<&ReadinessSpec> {
        self.common.ready.as_ref()
    }
}
