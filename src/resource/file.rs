//! File resource - whole content, copied sources, or YAML key edits

use super::yaml_path::{self, KeyPath};
use super::{Common, RuntimeSettings, decode, invalid, io_error, lock};
use chrono::Utc;
use declarative::{
    AdapterError, ApplyContext, Attributes, ReadinessSpec, Resource, ResourceDiff, ResourceSpec,
    ValidationError,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FileState {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    path: String,
    content: Option<String>,
    source: Option<String>,
    mode: Option<String>,
    #[serde(default)]
    state: FileState,
    #[serde(default)]
    backup: bool,
    #[serde(default)]
    set: BTreeMap<String, Value>,
}

/// What the file's bytes should be
#[derive(Debug)]
enum Body {
    /// Only existence and mode are managed
    Unmanaged,
    /// Inline content; secret placeholders are resolved at write time
    Content(String),
    /// Copied verbatim from a host file
    Source(PathBuf),
    /// Key paths set inside an existing YAML document
    Edits(Vec<(KeyPath, Value)>),
}

/// A file on the local host
#[derive(Debug)]
pub struct FileResource {
    common: Common,
    path: PathBuf,
    state: FileState,
    body: Body,
    mode: Option<u32>,
    backup: bool,
    /// Desired projection with placeholders resolved, refreshed by every probe
    resolved: Mutex<Option<Attributes>>,
}

impl FileResource {
    pub fn from_spec(
        spec: &ResourceSpec,
        settings: &RuntimeSettings,
    ) -> Result<Self, ValidationError> {
        let common = Common::from_spec(spec)?;
        let s: FileSettings = decode(spec)?;

        let bodies = usize::from(s.content.is_some())
            + usize::from(s.source.is_some())
            + usize::from(!s.set.is_empty());
        if bodies > 1 {
            return Err(invalid(
                &spec.id,
                "content",
                "content, source and set are mutually exclusive",
            ));
        }
        if s.state == FileState::Absent && (bodies > 0 || s.mode.is_some()) {
            return Err(invalid(
                &spec.id,
                "state",
                "an absent file takes no content, source, set or mode",
            ));
        }

        let mode = s
            .mode
            .as_deref()
            .map(|m| {
                parse_mode(m)
                    .ok_or_else(|| invalid(&spec.id, "mode", format!("'{m}' is not an octal mode")))
            })
            .transpose()?;

        let body = if let Some(content) = s.content {
            Body::Content(content)
        } else if let Some(source) = s.source {
            Body::Source(settings.host_path(&source))
        } else if !s.set.is_empty() {
            let edits = s
                .set
                .into_iter()
                .map(|(raw, value)| {
                    raw.parse::<KeyPath>()
                        .map(|path| (path, value))
                        .map_err(|e| invalid(&spec.id, "set", format!("'{raw}': {e}")))
                })
                .collect::<Result<_, _>>()?;
            Body::Edits(edits)
        } else {
            Body::Unmanaged
        };

        Ok(Self {
            common,
            path: settings.host_path(&s.path),
            state: s.state,
            body,
            mode,
            backup: s.backup,
            resolved: Mutex::new(None),
        })
    }

    /// Desired projection; placeholders are resolved when a context is given
    fn project(&self, ctx: Option<&ApplyContext<'_>>) -> Result<Attributes, AdapterError> {
        let mut attrs = Attributes::new();
        if self.state == FileState::Absent {
            attrs.insert("exists".into(), json!(false));
            return Ok(attrs);
        }

        attrs.insert("exists".into(), json!(true));
        if let Some(mode) = self.mode {
            attrs.insert("mode".into(), json!(format_mode(mode)));
        }

        match &self.body {
            Body::Unmanaged => {}
            Body::Content(_) | Body::Source(_) => {
                attrs.insert("content_hash".into(), json!(hash(&self.render(ctx)?)));
            }
            Body::Edits(edits) => {
                for (path, value) in edits {
                    let value = match ctx {
                        Some(ctx) => resolve_value(ctx, value)?,
                        None => value.clone(),
                    };
                    attrs.insert(edit_key(path), value);
                }
            }
        }
        Ok(attrs)
    }

    /// Bytes for content and source bodies
    fn render(&self, ctx: Option<&ApplyContext<'_>>) -> Result<Vec<u8>, AdapterError> {
        match &self.body {
            Body::Content(template) => Ok(match ctx {
                Some(ctx) => ctx.resolve(template)?.into_bytes(),
                None => template.clone().into_bytes(),
            }),
            Body::Source(source) => fs::read(source).map_err(|e| io_error("read", source, &e)),
            Body::Unmanaged | Body::Edits(_) => Ok(Vec::new()),
        }
    }

    fn observe(&self) -> Result<Attributes, AdapterError> {
        let mut attrs = Attributes::new();
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                attrs.insert("exists".into(), json!(false));
                return Ok(attrs);
            }
            Err(e) => return Err(io_error("stat", &self.path, &e)),
        };
        if meta.is_dir() {
            return Err(AdapterError::permanent(format!(
                "{} is a directory",
                self.path.display()
            )));
        }

        attrs.insert("exists".into(), json!(true));
        if let Some(mode) = file_mode(&meta) {
            attrs.insert("mode".into(), json!(format_mode(mode)));
        }

        match &self.body {
            Body::Unmanaged => {}
            Body::Content(_) | Body::Source(_) => {
                let bytes = fs::read(&self.path).map_err(|e| io_error("read", &self.path, &e))?;
                attrs.insert("content_hash".into(), json!(hash(&bytes)));
            }
            Body::Edits(edits) => {
                let doc = read_yaml(&self.path)?;
                for (path, _) in edits {
                    if let Some(current) = yaml_path::get(&doc, path) {
                        let current = serde_json::to_value(current).map_err(|e| {
                            AdapterError::permanent(format!("{} at '{path}': {e}", self.path.display()))
                        })?;
                        attrs.insert(edit_key(path), current);
                    }
                }
            }
        }
        Ok(attrs)
    }

    /// Apply every edit to the current document and serialize it
    fn edited(
        &self,
        ctx: &ApplyContext<'_>,
        edits: &[(KeyPath, Value)],
    ) -> Result<Vec<u8>, AdapterError> {
        let mut doc = if self.path.exists() {
            read_yaml(&self.path)?
        } else {
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
        };

        for (path, value) in edits {
            let value = serde_yaml::to_value(resolve_value(ctx, value)?)
                .map_err(|e| AdapterError::permanent(format!("'{path}': {e}")))?;
            yaml_path::set(&mut doc, path, value)
                .map_err(|e| AdapterError::permanent(format!("{}: {e}", self.path.display())))?;
        }

        serde_yaml::to_string(&doc)
            .map(String::into_bytes)
            .map_err(|e| AdapterError::permanent(format!("{}: {e}", self.path.display())))
    }

    fn backup_existing(&self, ctx: &ApplyContext<'_>) -> Result<(), AdapterError> {
        if !self.backup {
            return Ok(());
        }
        let stamp = Utc::now().format("%Y-%m-%d@%H:%M:%S").to_string();
        let backup = backup_path(&self.path, &stamp);
        fs::copy(&self.path, &backup).map_err(|e| io_error("back up", &self.path, &e))?;
        ctx.info(&format!("backed up to {}", backup.display()));
        Ok(())
    }
}

/// First unused `<path>.<stamp>~`, numbered when a backup from the same
/// second already exists
fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let first = PathBuf::from(format!("{}.{stamp}~", path.display()));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| PathBuf::from(format!("{}.{stamp}.{n}~", path.display())))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

impl Resource for FileResource {
    fn id(&self) -> &str {
        &self.common.id
    }

    fn dependencies(&self) -> &[String] {
        &self.common.depends_on
    }

    fn resource_type(&self) -> &'static str {
        "file"
    }

    fn describe(&self) -> String {
        match (&self.state, &self.body) {
            (FileState::Absent, _) => format!("remove {}", self.path.display()),
            (_, Body::Edits(edits)) => {
                format!("edit {} ({} key(s))", self.path.display(), edits.len())
            }
            (_, Body::Source(source)) => {
                format!("copy {} to {}", source.display(), self.path.display())
            }
            _ => format!("file {}", self.path.display()),
        }
    }

    fn desired(&self) -> Attributes {
        lock(&self.resolved)
            .clone()
            .unwrap_or_else(|| self.project(None).unwrap_or_default())
    }

    fn probe(&self, ctx: &ApplyContext<'_>) -> Result<Attributes, AdapterError> {
        let desired = self.project(Some(ctx))?;
        *lock(&self.resolved) = Some(desired);
        self.observe()
    }

    fn apply(&self, ctx: &ApplyContext<'_>, diff: &ResourceDiff) -> Result<(), AdapterError> {
        let exists = self.path.exists();

        if self.state == FileState::Absent {
            if exists {
                self.backup_existing(ctx)?;
                fs::remove_file(&self.path).map_err(|e| io_error("remove", &self.path, &e))?;
                ctx.info(&format!("removed {}", self.path.display()));
            }
            return Ok(());
        }

        let contents = match &self.body {
            Body::Unmanaged => (!exists).then(Vec::new),
            Body::Content(_) | Body::Source(_) => (!exists || diff.changes_key("content_hash"))
                .then(|| self.render(Some(ctx)))
                .transpose()?,
            Body::Edits(edits) => {
                let changed = edits.iter().any(|(path, _)| diff.changes_key(&edit_key(path)));
                (!exists || changed)
                    .then(|| self.edited(ctx, edits))
                    .transpose()?
            }
        };

        if let Some(bytes) = contents {
            if exists {
                self.backup_existing(ctx)?;
            }
            write_atomic(&self.path, &bytes, self.mode)?;
            ctx.info(&format!("wrote {} ({} bytes)", self.path.display(), bytes.len()));
        } else if let Some(mode) = self.mode {
            set_mode(&self.path, mode)?;
            ctx.info(&format!("set mode {} on {}", format_mode(mode), self.path.display()));
        }
        Ok(())
    }

    fn readiness(&self) -> Option<&ReadinessSpec> {
        self.common.ready.as_ref()
    }
}

fn edit_key(path: &KeyPath) -> String {
    format!("set.{path}")
}

fn resolve_value(ctx: &ApplyContext<'_>, value: &Value) -> Result<Value, AdapterError> {
    ctx.secrets()
        .resolve_value(value)
        .map_err(|e| AdapterError::permanent(e.to_string()))
}

fn hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn parse_mode(mode: &str) -> Option<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 8).ok().filter(|m| *m <= 0o7777)
}

fn format_mode(mode: u32) -> String {
    format!("{mode:04o}")
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value, AdapterError> {
    let content = fs::read_to_string(path).map_err(|e| io_error("read", path, &e))?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|e| {
        AdapterError::permanent(format!("failed to parse YAML {}: {e}", path.display()))
    })?;
    Ok(match doc {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        doc => doc,
    })
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write through a temporary file in the same directory, then rename over
fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> Result<(), AdapterError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_error("create directory", parent, &e))?;

    let name = path
        .file_name()
        .ok_or_else(|| AdapterError::permanent(format!("{} has no file name", path.display())))?
        .to_string_lossy();
    let temp = parent.join(format!(
        ".{name}.stagehand-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = fs::write(&temp, bytes)
        .map_err(|e| io_error("write", &temp, &e))
        .and_then(|()| match mode {
            Some(mode) => set_mode(&temp, mode),
            None => keep_permissions(path, &temp),
        })
        .and_then(|()| fs::rename(&temp, path).map_err(|e| io_error("replace", path, &e)));

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn keep_permissions(original: &Path, temp: &Path) -> Result<(), AdapterError> {
    match fs::metadata(original) {
        Ok(meta) => fs::set_permissions(temp, meta.permissions())
            .map_err(|e| io_error("set permissions on", temp, &e)),
        Err(_) => Ok(()),
    }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), AdapterError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| io_error("set mode on", path, &e))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, _mode: u32) -> Result<(), AdapterError> {
    log::debug!("file modes are not supported here; leaving {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::{Harness, NoCommands};
    use declarative::{Outcome, ResourceKind, SecretBroker};

    fn file_spec(path: &Path) -> ResourceSpec {
        ResourceSpec::new("conf", ResourceKind::File).with("path", path.display().to_string())
    }

    fn build(spec: &ResourceSpec) -> FileResource {
        FileResource::from_spec(spec, &RuntimeSettings::default()).unwrap()
    }

    #[test]
    fn test_writes_content_with_secrets_then_settles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app/env");
        let resource = build(
            &file_spec(&path).with("content", "DB_PASSWORD={{ secret.db_password }}\n"),
        );
        let secrets = SecretBroker::from_values([("db_password", "hunter2")]);
        let harness = Harness::new(&NoCommands, &secrets);

        let first = harness.execute(&resource);
        assert_eq!(first.outcome, Outcome::Applied);
        assert_eq!(fs::read_to_string(&path).unwrap(), "DB_PASSWORD=hunter2\n");
        assert!(!serde_json::to_string(&first).unwrap().contains("hunter2"));

        let second = harness.execute(&resource);
        assert_eq!(second.outcome, Outcome::AlreadySatisfied);
    }

    #[test]
    fn test_changed_content_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fluent-bit.conf");
        fs::write(&path, "old").unwrap();
        let resource = build(&file_spec(&path).with("content", "new").with("backup", true));
        let secrets = SecretBroker::new();

        let report = Harness::new(&NoCommands, &secrets).execute(&resource);
        assert_eq!(report.outcome, Outcome::Applied);
        assert_eq!(report.changes.len(), 1);
        assert!(report.changes[0].starts_with("content_hash:"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with('~'))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(backups[0].path()).unwrap(), "old");
    }

    #[test]
    fn test_backups_in_the_same_second_are_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        let stamp = "2026-10-16@09:30:00";

        let first = backup_path(&path, stamp);
        assert_eq!(first, dir.path().join("app.conf.2026-10-16@09:30:00~"));
        fs::write(&first, "v1").unwrap();

        let second = backup_path(&path, stamp);
        assert_eq!(second, dir.path().join("app.conf.2026-10-16@09:30:00.1~"));
        fs::write(&second, "v2").unwrap();

        assert_eq!(
            backup_path(&path, stamp),
            dir.path().join("app.conf.2026-10-16@09:30:00.2~")
        );
    }

    #[test]
    fn test_source_is_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("nginx.conf"), "server {}").unwrap();
        let target = dir.path().join("out/nginx.conf");
        let spec = file_spec(&target).with("source", "nginx.conf");
        let settings = RuntimeSettings {
            base_dir: dir.path().to_path_buf(),
            ..RuntimeSettings::default()
        };
        let resource = FileResource::from_spec(&spec, &settings).unwrap();
        let secrets = SecretBroker::new();

        let report = Harness::new(&NoCommands, &secrets).execute(&resource);
        assert_eq!(report.outcome, Outcome::Applied);
        assert_eq!(fs::read_to_string(&target).unwrap(), "server {}");
    }

    #[test]
    fn test_yaml_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.yaml");
        fs::write(
            &path,
            "serve:\n  vllm:\n    vllm_args:\n      - --tensor-parallel-size\n      - '1'\n  replicas: 1\n",
        )
        .unwrap();
        let resource = build(&file_spec(&path).with(
            "set",
            json!({
                "serve.vllm.vllm_args[1]": "5",
                "serve.vllm.vllm_args[3]": "{{ secret.api_key }}",
            }),
        ));
        let secrets = SecretBroker::from_values([("api_key", "sk-live-42")]);
        let harness = Harness::new(&NoCommands, &secrets);

        let report = harness.execute(&resource);
        assert_eq!(report.outcome, Outcome::Applied);
        assert!(!report.changes.join("\n").contains("sk-live-42"));

        let doc: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let args = doc["serve"]["vllm"]["vllm_args"].as_sequence().unwrap();
        assert_eq!(args.len(), 4);
        assert_eq!(args[1], serde_yaml::Value::from("5"));
        assert!(args[2].is_null());
        assert_eq!(args[3], serde_yaml::Value::from("sk-live-42"));
        assert_eq!(doc["serve"]["replicas"], serde_yaml::Value::from(1));

        assert_eq!(harness.execute(&resource).outcome, Outcome::AlreadySatisfied);
    }

    #[test]
    fn test_yaml_edit_type_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.yaml");
        fs::write(&path, "serve: enabled\n").unwrap();
        let resource = build(&file_spec(&path).with("set", json!({"serve.port": 8000})));
        let secrets = SecretBroker::new();

        let report = Harness::new(&NoCommands, &secrets).execute(&resource);
        assert!(report.outcome.is_failure());
        assert_eq!(fs::read_to_string(&path).unwrap(), "serve: enabled\n");
    }

    #[test]
    fn test_absent_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.pid");
        fs::write(&path, "123").unwrap();
        let resource = build(&file_spec(&path).with("state", "absent"));
        let secrets = SecretBroker::new();
        let harness = Harness::new(&NoCommands, &secrets);

        assert_eq!(harness.execute(&resource).outcome, Outcome::Applied);
        assert!(!path.exists());
        assert_eq!(harness.execute(&resource).outcome, Outcome::AlreadySatisfied);
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_is_enforced() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let resource = build(&file_spec(&path).with("content", "x").with("mode", "0600"));
        let secrets = SecretBroker::new();

        let report = Harness::new(&NoCommands, &secrets).execute(&resource);
        assert_eq!(report.outcome, Outcome::Applied);
        assert_eq!(report.changes, vec!["mode: 0644 -> 0600"]);
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_invalid_settings() {
        let path = Path::new("/tmp/x");
        let both = file_spec(path).with("content", "a").with("source", "b");
        assert!(FileResource::from_spec(&both, &RuntimeSettings::default()).is_err());

        let bad_mode = file_spec(path).with("mode", "0999");
        assert!(FileResource::from_spec(&bad_mode, &RuntimeSettings::default()).is_err());

        let bad_path = file_spec(path).with("set", json!({"a[0": 1}));
        assert!(FileResource::from_spec(&bad_path, &RuntimeSettings::default()).is_err());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0644"), Some(0o644));
        assert_eq!(parse_mode("0o755"), Some(0o755));
        assert_eq!(parse_mode("600"), Some(0o600));
        assert_eq!(parse_mode("rw"), None);
        assert_eq!(parse_mode(""), None);
    }
}
