//! One-shot command, guarded by `creates` or `unless`

use super::{Common, RuntimeSettings, decode, invalid};
use declarative::{
    AdapterError, ApplyContext, Attributes, CommandLine, CommandRequest, ReadinessSpec, Resource,
    ResourceDiff, ResourceSpec, ValidationError,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaptureSettings {
    secret: String,
    pattern: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessSettings {
    command: CommandLine,
    creates: Option<String>,
    unless: Option<CommandLine>,
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    capture: Option<CaptureSettings>,
}

/// Registers the first group of a stdout match as a run secret
#[derive(Debug)]
struct Capture {
    secret: String,
    pattern: Regex,
}

#[derive(Debug)]
pub struct ProcessResource {
    common: Common,
    command: CommandLine,
    creates: Option<PathBuf>,
    unless: Option<CommandLine>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    capture: Option<Capture>,
    /// Unguarded commands count as done once they have run in this process
    ran: AtomicBool,
}

impl ProcessResource {
    pub fn from_spec(
        spec: &ResourceSpec,
        settings: &RuntimeSettings,
    ) -> Result<Self, ValidationError> {
        let common = Common::from_spec(spec)?;
        let s: ProcessSettings = decode(spec)?;

        if s.command.is_empty() {
            return Err(invalid(&spec.id, "command", "command is empty"));
        }
        if s.unless.as_ref().is_some_and(CommandLine::is_empty) {
            return Err(invalid(&spec.id, "unless", "command is empty"));
        }

        let capture = s
            .capture
            .map(|c| {
                let pattern = Regex::new(&c.pattern)
                    .map_err(|e| invalid(&spec.id, "capture", e.to_string()))?;
                if pattern.captures_len() < 2 {
                    return Err(invalid(
                        &spec.id,
                        "capture",
                        "pattern needs a capture group",
                    ));
                }
                Ok(Capture {
                    secret: c.secret,
                    pattern,
                })
            })
            .transpose()?;

        Ok(Self {
            common,
            command: s.command,
            creates: s.creates.as_deref().map(|p| settings.host_path(p)),
            unless: s.unless,
            cwd: s.cwd.as_deref().map(|p| settings.host_path(p)),
            env: s.env,
            capture,
            ran: AtomicBool::new(false),
        })
    }

    fn request(&self, command: &CommandLine) -> CommandRequest {
        let mut request = command.to_request();
        request.cwd.clone_from(&self.cwd);
        request.env.clone_from(&self.env);
        request
    }

    fn completed(&self, ctx: &ApplyContext<'_>) -> Result<bool, AdapterError> {
        if let Some(creates) = &self.creates
            && creates.exists()
        {
            return Ok(true);
        }
        if let Some(unless) = &self.unless {
            return Ok(ctx.exec(&self.request(unless))?.success);
        }
        if self.creates.is_some() {
            return Ok(false);
        }
        Ok(self.ran.load(Ordering::SeqCst))
    }
}

impl Resource for ProcessResource {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn dependencies(&self) -> &[String] {
        &self.common.depends_on
    }

    fn resource_type(&self) -> &'static str {
        "process_invocation"
    }

    fn describe(&self) -> String {
        format!("run {}", self.command.to_request().command_line())
    }

    fn desired(&self) -> Attributes {
        Attributes::from([("completed".to_string(), json!(true))])
    }

    fn probe(&self, ctx: &ApplyContext<'_>) -> Result<Attributes, AdapterError> {
        Ok(Attributes::from([(
            "completed".to_string(),
            json!(self.completed(ctx)?),
        )]))
    }

    fn apply(&self, ctx: &ApplyContext<'_>, _diff: &ResourceDiff) -> Result<(), AdapterError> {
        let output = ctx.exec_checked(&self.request(&self.command))?;
        ctx.info(&format!("ran {}", self.command.to_request().command_line()));

        if let Some(capture) = &self.capture {
            let stdout = output.stdout_str();
            let value = capture
                .pattern
                .captures(&stdout)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| {
                    AdapterError::permanent(format!(
                        "output did not match the capture pattern for secret '{}'",
                        capture.secret
                    ))
                })?;
            ctx.secrets().capture(capture.secret.as_str(), value);
            ctx.debug(&format!("captured secret '{}'", capture.secret));
        }

        self.ran.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn readiness(&self) -> Option<&ReadinessSpec> {
        self.common.ready.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::{FakeRunner, Harness};
    use declarative::{CommandOutput, Outcome, ResourceKind, SecretBroker};

    fn spec(command: serde_json::Value) -> ResourceSpec {
        ResourceSpec::new("init", ResourceKind::ProcessInvocation).with("command", command)
    }

    fn build(spec: &ResourceSpec) -> ProcessResource {
        ProcessResource::from_spec(spec, &RuntimeSettings::default()).unwrap()
    }

    #[test]
    fn test_creates_guard() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("initialized");
        let resource = build(
            &spec(json!(["touch", marker.display().to_string()]))
                .with("creates", marker.display().to_string()),
        );
        let runner = FakeRunner::new();
        let secrets = SecretBroker::new();

        std::fs::write(&marker, "").unwrap();
        let report = Harness::new(&runner, &secrets).execute(&resource);
        assert_eq!(report.outcome, Outcome::AlreadySatisfied);
        assert!(runner.lines().is_empty());
    }

    #[test]
    fn test_unless_guard() {
        let resource = build(
            &spec(json!("createdb chat"))
                .with("unless", json!(["psql", "-lqt"]))
                .with("env", json!({"PGPASSWORD": "{{ secret.pg }}"})),
        );
        let runner = FakeRunner::new()
            .on("psql -lqt", CommandOutput::failed(1, ""))
            .on("psql -lqt", CommandOutput::ok("chat"));
        let secrets = SecretBroker::from_values([("pg", "s3cret")]);

        let report = Harness::new(&runner, &secrets).execute(&resource);
        assert_eq!(report.outcome, Outcome::Applied);
        assert_eq!(
            runner.lines(),
            ["psql -lqt", "sh -c createdb chat", "psql -lqt"]
        );
        assert_eq!(runner.calls()[1].env["PGPASSWORD"], "s3cret");
    }

    #[test]
    fn test_unguarded_runs_once_per_process() {
        let resource = build(&spec(json!(["echo", "hello"])));
        let runner = FakeRunner::new();
        let secrets = SecretBroker::new();
        let harness = Harness::new(&runner, &secrets);

        assert_eq!(harness.execute(&resource).outcome, Outcome::Applied);
        assert_eq!(harness.execute(&resource).outcome, Outcome::AlreadySatisfied);
        assert_eq!(runner.lines(), ["echo hello"]);
    }

    #[test]
    fn test_capture_registers_secret() {
        let resource = build(&spec(json!(["vault", "token", "create"])).with(
            "capture",
            json!({"secret": "vault_token", "pattern": r"token\s+(\S+)"}),
        ));
        let runner = FakeRunner::new().on(
            "vault token create",
            CommandOutput::ok("Key    Value\ntoken  hvs.CAESIJ9\n"),
        );
        let secrets = SecretBroker::new();

        let report = Harness::new(&runner, &secrets).execute(&resource);
        assert_eq!(report.outcome, Outcome::Applied);
        assert_eq!(secrets.value("vault_token").unwrap(), "hvs.CAESIJ9");
        assert_eq!(secrets.redact("got hvs.CAESIJ9"), "got ********");
    }

    #[test]
    fn test_capture_without_match_fails() {
        let resource = build(
            &spec(json!(["vault", "token", "create"]))
                .with("capture", json!({"secret": "t", "pattern": "token=(\\w+)"})),
        );
        let runner = FakeRunner::new().on("vault", CommandOutput::ok("nothing useful"));
        let secrets = SecretBroker::new();

        let report = Harness::new(&runner, &secrets).execute(&resource);
        assert!(report.outcome.is_failure());
        assert!(!secrets.contains("t"));
    }

    #[test]
    fn test_failing_command_is_permanent() {
        let resource = build(&spec(json!(["false"])));
        let runner = FakeRunner::new().on("false", CommandOutput::failed(1, "nope"));
        let secrets = SecretBroker::new();

        let report = Harness::new(&runner, &secrets).execute(&resource);
        assert!(matches!(report.outcome, Outcome::Failed { ref error } if error.contains("nope")));
        assert_eq!(report.attempts, 1);
    }

    #[test]
    fn test_capture_needs_a_group() {
        let bad = spec(json!("true")).with("capture", json!({"secret": "x", "pattern": "token"}));
        assert!(ProcessResource::from_spec(&bad, &RuntimeSettings::default()).is_err());

        let empty = spec(json!([]));
        assert!(ProcessResource::from_spec(&empty, &RuntimeSettings::default()).is_err());
    }
}
