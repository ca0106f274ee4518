//! Pipeline orchestration.
//!
//! Ties the stages together: load + flatten the pipeline file, build the
//! variable context, plan against the current catalog, execute. The CLI
//! verbs (`validate`, `compile`, `run`) are thin wrappers over these
//! functions.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::Profile;
use crate::engine::SqlEngine;
use crate::errors::Result;
use crate::exec::{Executor, RunSummary};
use crate::parser::loader::load_pipeline;
use crate::parser::Step;
use crate::planner::{build_plan, Plan};
use crate::state::WatermarkStore;
use crate::vars::{Substitutor, VarContext};

/// Pipeline name: the file stem, used as the watermark key prefix.
pub fn pipeline_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn build_vars(profile: &Profile, overrides: &IndexMap<String, String>) -> VarContext {
    VarContext::new(overrides.clone(), profile.variables.clone(), true)
}

/// Parses and plans without executing; all diagnostics come back in bulk.
pub fn validate(
    path: &str,
    profile: &Profile,
    overrides: &IndexMap<String, String>,
) -> Result<Vec<Step>> {
    let steps = load_pipeline(path)?;
    let subs = Substitutor::new(profile.on_missing_var);
    let vars = build_vars(profile, overrides);
    build_plan(
        &pipeline_name(path),
        &steps,
        &subs,
        vars,
        profile,
        &Default::default(),
    )?;
    Ok(steps)
}

/// Builds the execution plan for inspection.
pub fn compile(
    path: &str,
    profile: &Profile,
    overrides: &IndexMap<String, String>,
) -> Result<Plan> {
    let steps = load_pipeline(path)?;
    let subs = Substitutor::new(profile.on_missing_var);
    let vars = build_vars(profile, overrides);
    build_plan(
        &pipeline_name(path),
        &steps,
        &subs,
        vars,
        profile,
        &Default::default(),
    )
}

/// Runs a pipeline end to end.
#[instrument(name = "run_pipeline", err, skip_all)]
pub async fn run(
    path: &str,
    profile: Profile,
    overrides: &IndexMap<String, String>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let started = Instant::now();
    let name = pipeline_name(path);
    info!("═══════════════════════════════════════════════════════════");
    info!("🚀 Running pipeline '{name}'");
    info!("═══════════════════════════════════════════════════════════");

    let steps = load_pipeline(path)?;
    info!("📂 Parsed {} step(s)", steps.len());

    let engine = Arc::new(SqlEngine::new());
    let store = Arc::new(WatermarkStore::open(&profile.state_dir)?);

    let subs = Substitutor::new(profile.on_missing_var);
    let vars = build_vars(&profile, overrides);
    let preexisting = engine.table_names().into_iter().collect();
    let plan = build_plan(&name, &steps, &subs, vars, &profile, &preexisting)?;
    info!(
        "🗺️  Planned {} operation(s), {} edge(s)",
        plan.operations.len(),
        plan.edges.len()
    );

    let executor = Executor::new(&name, engine, store, profile, cancel);
    let summary = executor.execute(&plan).await;

    if summary.is_success() {
        info!("═══════════════════════════════════════════════════════════");
        info!("🎉 Pipeline '{name}' completed successfully");
        info!("⏱️  Total Execution Time: {}ms", started.elapsed().as_millis());
        info!("═══════════════════════════════════════════════════════════");
    } else {
        info!(
            "❌ Pipeline '{name}' finished with failures: {:?}",
            summary.failed_operations()
        );
    }
    Ok(summary)
}
