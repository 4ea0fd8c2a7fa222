//! Execution engine for stagehand
//!
//! The engine orchestrates:
//! 1. Loading - config, typed resources and secret references
//! 2. Planning - dependency order, optionally narrowed with `--only`
//! 3. Executing - the coordinator converges the plan and reports back

pub mod differ;
pub mod executor;

pub use executor::{RunArgs, run};

use anyhow::{Context, Result, bail};
use declarative::{ExecutionPlan, ResourceSpec, referenced_names};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::{StagehandConfig, base_dir};
use crate::resource::{ManagedResource, RuntimeSettings};
use crate::ui;

/// A config file with its resources built
pub struct Loaded {
    pub path: PathBuf,
    pub config: StagehandConfig,
    pub resources: Vec<ManagedResource>,
}

/// Load a config and build every resource it declares
pub fn load(path: &Path) -> Result<Loaded> {
    let config = StagehandConfig::load(path)?;
    let settings = RuntimeSettings {
        container_runtime: config.run.container_runtime.clone(),
        base_dir: base_dir(path),
    };

    let resources = ManagedResource::from_specs(&config.resources, &settings)
        .with_context(|| format!("Invalid resources in {}", path.display()))?;

    let unknown = unknown_references(&config);
    if !unknown.is_empty() {
        let listed: Vec<String> = unknown
            .iter()
            .map(|(id, name)| format!("{name} (in {id})"))
            .collect();
        bail!(
            "Undeclared secrets referenced in {}: {}",
            path.display(),
            listed.join(", ")
        );
    }

    log::info!(
        "loaded {} resource(s) and {} secret source(s) from {}",
        resources.len(),
        config.secrets.len(),
        path.display()
    );

    Ok(Loaded {
        path: path.to_path_buf(),
        config,
        resources,
    })
}

/// Build the plan for a loaded config, narrowed to `only` when given
pub fn plan(loaded: &Loaded, only: &[String]) -> Result<ExecutionPlan> {
    let plan = ExecutionPlan::build(&loaded.config.resources)
        .with_context(|| format!("Invalid dependencies in {}", loaded.path.display()))?;
    if only.is_empty() {
        return Ok(plan);
    }
    plan.restrict_to(only).context("Invalid --only target")
}

/// Secret name captured by a resource's `capture` block
fn captured_name(spec: &ResourceSpec) -> Option<&str> {
    spec.desired.get("capture")?.get("secret")?.as_str()
}

/// Placeholders naming a secret that is neither declared nor captured
fn unknown_references(config: &StagehandConfig) -> Vec<(String, String)> {
    let known: BTreeSet<&str> = config
        .secrets
        .keys()
        .map(String::as_str)
        .chain(config.resources.iter().filter_map(captured_name))
        .collect();

    config
        .resources
        .iter()
        .flat_map(|spec| {
            let desired = serde_json::Value::Object(
                spec.desired
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
            referenced_names(&desired)
                .into_iter()
                .filter(|name| !known.contains(name.as_str()))
                .map(|name| (spec.id.clone(), name))
                .collect::<Vec<_>>()
        })
        .collect()
}

// ============================================================================
// Commands
// ============================================================================

/// `stagehand validate`
pub fn validate(path: &Path) -> Result<u8> {
    let loaded = load(path)?;
    let plan = plan(&loaded, &[])?;

    ui::header(&format!("{}", path.display()));
    ui::kv("resources", &loaded.resources.len().to_string());
    ui::kv("secrets", &loaded.config.secrets.len().to_string());
    ui::kv("widest frontier", &plan.frontier_width().to_string());
    println!();
    ui::success("Configuration is valid");
    Ok(0)
}

/// `stagehand plan`
pub fn show_plan(path: &Path, only: &[String]) -> Result<u8> {
    let loaded = load(path)?;
    let plan = plan(&loaded, only)?;
    differ::display_plan(&plan, &loaded.resources);
    Ok(0)
}
