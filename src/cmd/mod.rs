//! Command-line interface module.
//!
//! Exposes the core verbs to the CLI adapter: validate, compile, run,
//! list-operations, list-watermarks, reset-watermarks. Exit codes:
//! 0 success, 1 pipeline failure, 2 validation failure, 3 configuration
//! failure.

use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{load_profile_from_path, Profile};
use crate::errors::{Result, SqlFlowError};
use crate::planner::{OpPayload, Plan};
use crate::state::WatermarkStore;

/// Command-line interface structure for the SQLFlow ELT tool.
#[derive(Parser, Debug)]
#[command(
    name = "sqlflow",
    version,
    about = "SQL-centric ELT: declare pipelines, plan them as a DAG, run them over DataFusion.",
    long_about = "SQL-centric ELT: declare pipelines, plan them as a DAG, run them over DataFusion.\n\n\
Resources:\n  • Pipelines: SOURCE / LOAD / CREATE TABLE AS / EXPORT statements with ${var} substitution\n  • Profile: YAML with engine knobs, connector defaults and resilience overrides\n  • Execution: plan → DAG → connectors ↔ DataFusion ↔ stage-and-swap destinations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the profile YAML file.
    #[arg(long = "profile", short = 'p', value_name = "FILE", global = true)]
    pub profile: Option<String>,

    /// Variable overrides, highest priority layer (repeatable).
    #[arg(long = "var", value_name = "NAME=VALUE", global = true)]
    pub vars: Vec<String>,

    /// Emit logs in JSON format.
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,

    /// Set log level (overrides env vars like RUST_LOG).
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse and plan a pipeline, reporting every diagnostic.
    Validate { pipeline: String },
    /// Build and print the execution plan.
    Compile {
        pipeline: String,
        /// Emit the plan as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Execute a pipeline.
    Run { pipeline: String },
    /// List the operations of a compiled plan.
    ListOperations { pipeline: String },
    /// List stored watermarks.
    ListWatermarks,
    /// Reset watermarks, optionally only for one pipeline.
    ResetWatermarks { pipeline: Option<String> },
}

fn parse_var_overrides(raw: &[String]) -> Result<IndexMap<String, String>> {
    let mut map = IndexMap::new();
    for entry in raw {
        let (name, value) = entry.split_once('=').ok_or_else(|| {
            SqlFlowError::Config(format!("--var expects NAME=VALUE, got '{entry}'"))
        })?;
        map.insert(name.trim().to_string(), value.to_string());
    }
    Ok(map)
}

fn load_profile(path: Option<&str>) -> Result<Profile> {
    match path {
        Some(p) => load_profile_from_path(p),
        None => Ok(Profile::default()),
    }
}

fn render_plan(plan: &Plan, json: bool) -> Result<String> {
    if json {
        let ops: Vec<serde_json::Value> = plan
            .operations
            .iter()
            .map(|op| {
                serde_json::json!({
                    "id": op.id,
                    "kind": kind_of(&op.payload),
                    "outputs": op.outputs,
                    "depends_on": op.depends_on,
                })
            })
            .collect();
        Ok(serde_json::to_string_pretty(&serde_json::json!({
            "pipeline": plan.pipeline,
            "operations": ops,
        }))?)
    } else {
        let mut out = String::new();
        out.push_str(&format!("plan for '{}':\n", plan.pipeline));
        for op in &plan.operations {
            let deps = if op.depends_on.is_empty() {
                "-".to_string()
            } else {
                op.depends_on.join(", ")
            };
            out.push_str(&format!(
                "  {:<40} {:<10} outputs: {:<20} after: {deps}\n",
                op.id,
                kind_of(&op.payload),
                op.outputs.join(", ")
            ));
        }
        Ok(out)
    }
}

fn kind_of(payload: &OpPayload) -> &'static str {
    match payload {
        OpPayload::SourceRead { .. } => "load",
        OpPayload::Transform { .. } => "transform",
        OpPayload::Export { .. } => "export",
        OpPayload::SetWatermark { .. } => "watermark",
    }
}

/// Entry point used by the binary; returns the process exit code.
pub async fn dispatch(cli: Cli) -> i32 {
    dotenvy::dotenv().ok();
    crate::log::init(cli.log_level.as_deref(), cli.log_json);

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            match e.span() {
                Some(span) => error!(code = e.code(), "{e} (at {span})"),
                None => error!(code = e.code(), "{e}"),
            }
            if let Some(hint) = e.suggestion() {
                warn!("hint: {hint}");
            }
            e.exit_code()
        }
    }
}

async fn execute(cli: Cli) -> Result<i32> {
    let profile = load_profile(cli.profile.as_deref())?;
    let overrides = parse_var_overrides(&cli.vars)?;

    match cli.command {
        Command::Validate { pipeline } => {
            let steps = crate::pipeline::validate(&pipeline, &profile, &overrides)?;
            info!("✅ '{pipeline}' is valid ({} step(s))", steps.len());
            Ok(0)
        }
        Command::Compile { pipeline, json } => {
            let plan = crate::pipeline::compile(&pipeline, &profile, &overrides)?;
            println!("{}", render_plan(&plan, json)?);
            Ok(0)
        }
        Command::ListOperations { pipeline } => {
            let plan = crate::pipeline::compile(&pipeline, &profile, &overrides)?;
            println!("{}", render_plan(&plan, false)?);
            Ok(0)
        }
        Command::Run { pipeline } => {
            let cancel = CancellationToken::new();
            let cancel_on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("🛑 Shutdown signal received; cancelling in-flight operations");
                    cancel_on_signal.cancel();
                }
            });

            let summary = crate::pipeline::run(&pipeline, profile, &overrides, cancel).await?;
            Ok(if summary.is_success() { 0 } else { 1 })
        }
        Command::ListWatermarks => {
            let store = WatermarkStore::open(&profile.state_dir)?;
            let records = store.list();
            if records.is_empty() {
                println!("no watermarks stored");
            }
            for record in records {
                println!(
                    "{:<50} {:<12} {} (updated {})",
                    record.key.to_string(),
                    record.value.kind(),
                    record.value,
                    record.updated_at.to_rfc3339()
                );
            }
            Ok(0)
        }
        Command::ResetWatermarks { pipeline } => {
            let store = WatermarkStore::open(&profile.state_dir)?;
            let removed = match pipeline {
                Some(name) => store.reset(&name)?,
                None => store.reset_all()?,
            };
            info!("🧹 Removed {removed} watermark(s)");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_overrides() {
        let vars = parse_var_overrides(&["a=1".into(), "b=x=y".into()]).unwrap();
        assert_eq!(vars.get("a").unwrap(), "1");
        assert_eq!(vars.get("b").unwrap(), "x=y");
        assert!(parse_var_overrides(&["broken".into()]).is_err());
    }
}
