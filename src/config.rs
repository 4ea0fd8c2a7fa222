//! Configuration loading
//!
//! A config file declares run options, secret sources and resources. TOML is
//! the default format; `.yaml`/`.yml` and `.json` files are read by extension.

use anyhow::{Context, Result, bail};
use declarative::{CommandLine, ResourceSpec, RetryConfig, RunOptions, SecretBroker};
use rand::distributions::{Alphanumeric, DistString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

// ============================================================================
// Format
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Pick a format from the file extension, defaulting to TOML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::Yaml,
            Some("json") => Self::Json,
            _ => Self::Toml,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Toml => "TOML",
            Self::Yaml => "YAML",
            Self::Json => "JSON",
        }
    }

    fn parse<T: DeserializeOwned>(&self, content: &str) -> Result<T> {
        Ok(match self {
            Self::Toml => toml::from_str(content)?,
            Self::Yaml => serde_yaml::from_str(content)?,
            Self::Json => serde_json::from_str(content)?,
        })
    }
}

// ============================================================================
// Document
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagehandConfig {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretSource>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// `[run]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    pub fail_fast: bool,
    pub parallelism: Option<usize>,
    pub default_timeout_secs: u64,
    /// Container runtime CLI (`docker` or `podman`)
    pub container_runtime: String,
    pub retry: RetrySettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            fail_fast: true,
            parallelism: None,
            default_timeout_secs: 60,
            container_runtime: "docker".to_string(),
            retry: RetrySettings::default(),
        }
    }
}

impl RunSettings {
    pub fn to_options(&self) -> RunOptions {
        RunOptions {
            fail_fast: self.fail_fast,
            parallelism: self.parallelism,
            retry: self.retry.to_retry_config(),
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            ..RunOptions::default()
        }
    }
}

/// `[run.retry]` section, delays in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

// ============================================================================
// Secrets
// ============================================================================

/// Where a secret's value comes from. Exactly one field must be set.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretSource {
    pub value: Option<String>,
    /// Environment variable name
    pub env: Option<String>,
    /// File holding the value; `~` is expanded and whitespace trimmed
    pub file: Option<String>,
    /// External credential tool whose trimmed stdout is the value
    pub command: Option<CommandLine>,
    /// Length of a random alphanumeric value
    pub generate: Option<usize>,
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl SecretSource {
    /// Where the value comes from, never the value itself
    pub fn describe(&self) -> String {
        match self {
            Self { env: Some(var), .. } => format!("env {var}"),
            Self { file: Some(path), .. } => format!("file {path}"),
            Self {
                command: Some(command),
                ..
            } => format!("command {}", command.to_request().program),
            Self {
                generate: Some(len),
                ..
            } => format!("generated ({len} chars)"),
            Self { value: Some(_), .. } => "inline value".to_string(),
            _ => "unset".to_string(),
        }
    }

    fn source_count(&self) -> usize {
        [
            self.value.is_some(),
            self.env.is_some(),
            self.file.is_some(),
            self.command.is_some(),
            self.generate.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// Fetch the value
    pub fn load(&self, name: &str) -> Result<String> {
        if self.source_count() != 1 {
            bail!(
                "secret '{name}' must set exactly one of value, env, file, command, generate"
            );
        }

        let value = match self {
            Self { value: Some(value), .. } => value.clone(),
            Self { env: Some(var), .. } => std::env::var(var).with_context(|| {
                format!("secret '{name}': environment variable {var} is not set")
            })?,
            Self { file: Some(path), .. } => {
                let path = PathBuf::from(shellexpand::tilde(path).as_ref());
                fs::read_to_string(&path)
                    .with_context(|| format!("secret '{name}': could not read {}", path.display()))?
                    .trim()
                    .to_string()
            }
            Self {
                command: Some(command),
                ..
            } => run_credential_tool(name, command)?,
            Self {
                generate: Some(len),
                ..
            } => {
                if *len == 0 {
                    bail!("secret '{name}': generate length must be positive");
                }
                Alphanumeric.sample_string(&mut rand::thread_rng(), *len)
            }
            _ => bail!("secret '{name}' has no source"),
        };

        if value.is_empty() {
            bail!("secret '{name}' is empty ({})", self.describe());
        }
        Ok(value)
    }
}

fn run_credential_tool(name: &str, command: &CommandLine) -> Result<String> {
    if command.is_empty() {
        bail!("secret '{name}': command is empty");
    }
    let request = command.to_request();
    let output = Command::new(&request.program)
        .args(&request.args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("secret '{name}': failed to execute {}", request.program))?;

    if !output.status.success() {
        // stderr is not shown; credential tools sometimes echo what they were given
        bail!(
            "secret '{name}': {} exited with {}",
            request.program,
            output.status
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// ============================================================================
// Loading
// ============================================================================

impl StagehandConfig {
    /// Load and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content, ConfigFormat::from_path(path))
            .with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let config: Self = format
            .parse(content)
            .with_context(|| format!("Invalid {}", format.name()))?;
        if config.run.container_runtime.trim().is_empty() {
            bail!("run.container_runtime must not be empty");
        }
        Ok(config)
    }

    /// Fetch every declared secret into a broker
    pub fn secret_broker(&self) -> Result<SecretBroker> {
        let mut broker = SecretBroker::new();
        for (name, source) in &self.secrets {
            log::debug!("loading secret '{name}' from {}", source.describe());
            broker.insert(name.clone(), source.load(name)?);
        }
        Ok(broker)
    }
}

/// Directory relative `source` paths are resolved against
pub fn base_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

// ============================================================================
// Tests
// ============================================================================
