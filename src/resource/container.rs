//! Container service - one named container driven through the runtime CLI

use super::{Common, RuntimeSettings, decode, invalid};
use declarative::{
    AdapterError, ApplyContext, Attributes, CommandLine, CommandRequest, ReadinessSpec, Resource,
    ResourceDiff, ResourceSpec, ValidationError,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// `inspect` output: configured image and running flag
const INSPECT_FORMAT: &str = "{{.Config.Image}}|{{.State.Running}}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ContainerState {
    #[default]
    Running,
    Stopped,
    Absent,
}

#[derive(Debug, Deserialize)]
struct CopySettings {
    src: String,
    dest: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContainerSettings {
    name: String,
    image: String,
    #[serde(default)]
    state: ContainerState,
    #[serde(default)]
    ports: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    volumes: Vec<String>,
    network: Option<String>,
    restart: Option<String>,
    command: Option<CommandLine>,
    #[serde(default)]
    copy: Vec<CopySettings>,
    #[serde(default)]
    exec: Vec<CommandLine>,
}

/// Host file copied into the container after creation
#[derive(Debug, Clone)]
struct CopyStep {
    src: PathBuf,
    dest: String,
}

/// What `inspect` reported for an existing container
#[derive(Debug, Clone, PartialEq, Eq)]
struct Inspected {
    image: String,
    running: bool,
}

#[derive(Debug)]
pub struct ContainerResource {
    common: Common,
    runtime: String,
    name: String,
    image: String,
    state: ContainerState,
    ports: Vec<String>,
    env: BTreeMap<String, String>,
    volumes: Vec<String>,
    network: Option<String>,
    restart: Option<String>,
    command: Option<CommandLine>,
    copy: Vec<CopyStep>,
    exec: Vec<CommandLine>,
}

impl ContainerResource {
    pub fn from_spec(
        spec: &ResourceSpec,
        settings: &RuntimeSettings,
    ) -> Result<Self, ValidationError> {
        let common = Common::from_spec(spec)?;
        let s: ContainerSettings = decode(spec)?;

        if s.name.trim().is_empty() {
            return Err(invalid(&spec.id, "name", "container name is empty"));
        }
        if s.image.trim().is_empty() {
            return Err(invalid(&spec.id, "image", "image is empty"));
        }
        if s.command.as_ref().is_some_and(CommandLine::is_empty) {
            return Err(invalid(&spec.id, "command", "command is empty"));
        }
        if s.exec.iter().any(CommandLine::is_empty) {
            return Err(invalid(&spec.id, "exec", "exec step is empty"));
        }

        Ok(Self {
            common,
            runtime: settings.container_runtime.clone(),
            name: s.name,
            image: s.image,
            state: s.state,
            ports: s.ports,
            env: s.env,
            volumes: s.volumes,
            network: s.network,
            restart: s.restart,
            command: s.command,
            copy: s
                .copy
                .into_iter()
                .map(|c| CopyStep {
                    src: settings.host_path(&c.src),
                    dest: c.dest,
                })
                .collect(),
            exec: s.exec,
        })
    }

    fn runtime(&self) -> CommandRequest {
        CommandRequest::new(self.runtime.as_str())
    }

    fn inspect(&self, ctx: &ApplyContext<'_>) -> Result<Option<Inspected>, AdapterError> {
        let request = self.runtime().args([
            "inspect",
            "--type",
            "container",
            "--format",
            INSPECT_FORMAT,
            self.name.as_str(),
        ]);
        let output = ctx.exec(&request)?;

        if !output.success {
            let stderr = output.stderr_str();
            if stderr.to_lowercase().contains("no such") {
                return Ok(None);
            }
            return Err(AdapterError::from_command_failure(
                &self.runtime,
                output.code,
                &ctx.redact(&stderr),
            ));
        }

        let stdout = output.stdout_str();
        let (image, running) = stdout.trim().split_once('|').ok_or_else(|| {
            AdapterError::permanent(format!(
                "unexpected inspect output for {}: {}",
                self.name,
                stdout.trim()
            ))
        })?;
        Ok(Some(Inspected {
            image: image.to_string(),
            running: running == "true",
        }))
    }

    fn run_args(&self) -> CommandRequest {
        let mut request = self.runtime().args(["run", "-d", "--name", self.name.as_str()]);
        if let Some(restart) = &self.restart {
            request = request.args(["--restart", restart.as_str()]);
        }
        if let Some(network) = &self.network {
            request = request.args(["--network", network.as_str()]);
        }
        for port in &self.ports {
            request = request.args(["-p", port.as_str()]);
        }
        for (key, value) in &self.env {
            request = request.args(["-e".to_string(), format!("{key}={value}")]);
        }
        for volume in &self.volumes {
            request = request.args(["-v", volume.as_str()]);
        }
        request = request.arg(self.image.as_str());
        if let Some(command) = &self.command {
            let command = command.to_request();
            request = request.arg(command.program).args(command.args);
        }
        request
    }

    /// Create and provision the container.
    ///
    /// A container whose copy or exec steps failed is removed again, so the
    /// next attempt starts from scratch instead of probing as converged.
    fn create(&self, ctx: &ApplyContext<'_>) -> Result<(), AdapterError> {
        ctx.exec_checked(&self.run_args())?;
        ctx.info(&format!("created container {} from {}", self.name, self.image));

        self.provision(ctx).inspect_err(|e| {
            ctx.info(&format!("provisioning {} failed: {e}", self.name));
            if let Err(cleanup) = self.remove(ctx) {
                log::warn!(
                    "[{}] could not remove half-provisioned container {}: {}",
                    ctx.resource_id(),
                    self.name,
                    ctx.redact(&cleanup.to_string())
                );
            }
        })
    }

    fn provision(&self, ctx: &ApplyContext<'_>) -> Result<(), AdapterError> {
        for step in &self.copy {
            let target = format!("{}:{}", self.name, step.dest);
            ctx.exec_checked(
                &self
                    .runtime()
                    .args(["cp".to_string(), step.src.display().to_string(), target]),
            )?;
            ctx.debug(&format!("copied {} to {}", step.src.display(), step.dest));
        }

        match self.state {
            ContainerState::Stopped => self.stop(ctx),
            _ => self.exec_steps(ctx),
        }
    }

    fn remove(&self, ctx: &ApplyContext<'_>) -> Result<(), AdapterError> {
        ctx.exec_checked(&self.runtime().args(["rm", "-f", self.name.as_str()]))?;
        ctx.info(&format!("removed container {}", self.name));
        Ok(())
    }

    fn start(&self, ctx: &ApplyContext<'_>) -> Result<(), AdapterError> {
        ctx.exec_checked(&self.runtime().args(["start", self.name.as_str()]))?;
        ctx.info(&format!("started container {}", self.name));
        self.exec_steps(ctx)
    }

    fn stop(&self, ctx: &ApplyContext<'_>) -> Result<(), AdapterError> {
        ctx.exec_checked(&self.runtime().args(["stop", self.name.as_str()]))?;
        ctx.info(&format!("stopped container {}", self.name));
        Ok(())
    }

    fn exec_steps(&self, ctx: &ApplyContext<'_>) -> Result<(), AdapterError> {
        for step in &self.exec {
            let inner = step.to_request();
            let request = self
                .runtime()
                .args(["exec", self.name.as_str()])
                .arg(inner.program)
                .args(inner.args);
            ctx.exec_checked(&request)?;
        }
        Ok(())
    }
}

impl Resource for ContainerResource {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn dependencies(&self) -> &[String] {
        &self.common.depends_on
    }

    fn resource_type(&self) -> &'static str {
        "container_service"
    }

    fn describe(&self) -> String {
        match self.state {
            ContainerState::Absent => format!("remove container {}", self.name),
            _ => format!("container {} ({})", self.name, self.image),
        }
    }

    fn desired(&self) -> Attributes {
        let mut attrs = Attributes::new();
        if self.state == ContainerState::Absent {
            attrs.insert("exists".into(), json!(false));
        } else {
            attrs.insert("exists".into(), json!(true));
            attrs.insert("image".into(), json!(self.image));
            attrs.insert(
                "running".into(),
                json!(self.state == ContainerState::Running),
            );
        }
        attrs
    }

    fn probe(&self, ctx: &ApplyContext<'_>) -> Result<Attributes, AdapterError> {
        let mut attrs = Attributes::new();
        match self.inspect(ctx)? {
            Some(found) => {
                attrs.insert("exists".into(), json!(true));
                attrs.insert("image".into(), json!(found.image));
                attrs.insert("running".into(), json!(found.running));
            }
            None => {
                attrs.insert("exists".into(), json!(false));
                attrs.insert("running".into(), json!(false));
            }
        }
        Ok(attrs)
    }

    fn apply(&self, ctx: &ApplyContext<'_>, _diff: &ResourceDiff) -> Result<(), AdapterError> {
        let current = self.inspect(ctx)?;

        match (self.state, current) {
            (ContainerState::Absent, None) => Ok(()),
            (ContainerState::Absent, Some(_)) => self.remove(ctx),
            (_, None) => self.create(ctx),
            (_, Some(found)) if found.image != self.image => {
                ctx.info(&format!(
                    "image changed from {} to {}, recreating",
                    found.image, self.image
                ));
                self.remove(ctx)?;
                self.create(ctx)
            }
            (ContainerState::Running, Some(found)) if !found.running => self.start(ctx),
            (ContainerState::Stopped, Some(found)) if found.running => self.stop(ctx),
            _ => Ok(()),
        }
    }

    fn readiness(&self) -> Option<&ReadinessSpec> {
        self.common.ready.as_ref()
    }
}
