//! Plan executor.
//!
//! Walks the operation DAG in its topological order, dispatching each
//! operation to the transform, load or export executor. Edges are strict
//! happens-before: a consumer never runs before its producer committed.
//! Failures either abort the run (fail-fast) or skip the failed
//! operation's dependents while independent branches proceed.
//!
//! Cancellation propagates through a token; an operation interrupted
//! before its commit leaves the catalog and watermarks untouched and is
//! marked Abandoned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Profile;
use crate::connectors::{Connector, ConnectorRegistry};
use crate::engine::SqlEngine;
use crate::errors::{Result, SqlFlowError};
use crate::planner::{OpPayload, Operation, Plan};
use crate::resilience::{Policy, ResilienceRegistry};
use crate::state::{TypedValue, WatermarkStore};

pub mod export;
pub mod load;
pub mod transform;

/// Terminal state of one operation after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    Committed { rows: usize },
    Failed { error: String },
    /// Not attempted because a dependency failed.
    Skipped,
    /// Interrupted by cancellation or a timeout before its commit.
    Abandoned,
}

/// Per-run report, one entry per planned operation.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub pipeline: String,
    pub statuses: IndexMap<String, OpStatus>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.statuses
            .values()
            .all(|s| matches!(s, OpStatus::Committed { .. }))
    }

    pub fn failed_operations(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| !matches!(s, OpStatus::Committed { .. }))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Everything an operation needs at run time.
pub struct ExecutionContext {
    pub pipeline: String,
    pub engine: Arc<SqlEngine>,
    pub store: Arc<WatermarkStore>,
    pub profile: Profile,
    pub resilience: &'static ResilienceRegistry,
    pub connectors: &'static ConnectorRegistry,
    pub cancel: CancellationToken,
    /// Max cursor value observed per producing operation; consumed by the
    /// SetWatermark operations downstream of it.
    pub observed_cursors: DashMap<String, TypedValue>,
}

impl ExecutionContext {
    /// Connector params: profile defaults for the type, overridden by the
    /// declaration's own params.
    pub fn merged_params(
        &self,
        connector_type: &str,
        params: &IndexMap<String, String>,
    ) -> IndexMap<String, String> {
        let mut merged = self
            .profile
            .connectors
            .get(connector_type)
            .map(|d| d.params.clone())
            .unwrap_or_default();
        for (k, v) in params {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Resolved resilience policy: connector smart defaults, then profile
    /// overrides.
    pub fn policy_for(&self, connector: &dyn Connector) -> Policy {
        let base = connector.resilience_defaults();
        match self.profile.resilience_for(connector.type_name()) {
            Some(overrides) => base.with_overrides(overrides),
            None => base,
        }
    }

    pub fn resilience_key(&self, connector: &dyn Connector) -> String {
        format!("{}/{}", connector.type_name(), connector.host_key())
    }
}

pub struct Executor {
    ctx: ExecutionContext,
}

impl Executor {
    pub fn new(
        pipeline: &str,
        engine: Arc<SqlEngine>,
        store: Arc<WatermarkStore>,
        profile: Profile,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx: ExecutionContext {
                pipeline: pipeline.to_string(),
                engine,
                store,
                profile,
                resilience: ResilienceRegistry::global(),
                connectors: ConnectorRegistry::global(),
                cancel,
                observed_cursors: DashMap::new(),
            },
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Executes the plan to completion, honoring fail-fast, timeouts and
    /// cancellation. Every planned operation gets a terminal status.
    pub async fn execute(&self, plan: &Plan) -> RunSummary {
        let started = Instant::now();
        let mut statuses: IndexMap<String, OpStatus> = IndexMap::new();
        let mut skipped: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut aborted = false;

        for op in &plan.operations {
            if aborted || self.ctx.cancel.is_cancelled() {
                statuses.insert(
                    op.id.clone(),
                    if self.ctx.cancel.is_cancelled() {
                        OpStatus::Abandoned
                    } else {
                        OpStatus::Skipped
                    },
                );
                continue;
            }
            if skipped.contains(&op.id) {
                debug!(op = %op.id, "skipped: upstream failed");
                statuses.insert(op.id.clone(), OpStatus::Skipped);
                continue;
            }

            let op_started = Instant::now();
            match self.run_operation(op).await {
                Ok(rows) => {
                    info!(
                        "✅ Completed: {} | {rows} row(s) | {}ms",
                        op.id,
                        op_started.elapsed().as_millis()
                    );
                    statuses.insert(op.id.clone(), OpStatus::Committed { rows });
                }
                Err(e @ (SqlFlowError::Cancelled { .. } | SqlFlowError::Timeout { .. })) => {
                    warn!(op = %op.id, error = %e, "operation abandoned");
                    statuses.insert(op.id.clone(), OpStatus::Abandoned);
                    if self.ctx.profile.engine.fail_fast {
                        aborted = true;
                    } else {
                        skipped.extend(plan.dependents_of(&op.id));
                    }
                }
                Err(e) => {
                    warn!(
                        op = %op.id,
                        code = e.code(),
                        error = %e,
                        suggestion = e.suggestion().unwrap_or(""),
                        "operation failed"
                    );
                    statuses.insert(
                        op.id.clone(),
                        OpStatus::Failed {
                            error: e.to_string(),
                        },
                    );
                    if self.ctx.profile.engine.fail_fast {
                        aborted = true;
                    } else {
                        skipped.extend(plan.dependents_of(&op.id));
                    }
                }
            }
        }

        let summary = RunSummary {
            pipeline: plan.pipeline.clone(),
            statuses,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            pipeline = %summary.pipeline,
            operations = summary.statuses.len(),
            failed = summary.failed_operations().len(),
            duration_ms = summary.duration_ms,
            "run finished"
        );
        summary
    }

    async fn run_operation(&self, op: &Operation) -> Result<usize> {
        let fut = self.dispatch(op);
        let budget = self.ctx.profile.engine.operation_timeout_ms;

        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(SqlFlowError::Cancelled {
                operation: op.id.clone(),
            }),
            result = async {
                match budget {
                    Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
                        .await
                        .unwrap_or_else(|_| {
                            Err(SqlFlowError::Timeout {
                                operation: op.id.clone(),
                                budget_ms: ms,
                            })
                        }),
                    None => fut.await,
                }
            } => result,
        }
    }

    async fn dispatch(&self, op: &Operation) -> Result<usize> {
        debug!(op = %op.id, "starting operation");
        match &op.payload {
            OpPayload::Transform {
                table, sql, mode, ..
            } => transform::run(&self.ctx, op, table, sql, mode).await,
            OpPayload::SourceRead {
                source,
                target_table,
                columns,
                mode,
            } => load::run(&self.ctx, op, source, target_table, columns.as_ref(), mode).await,
            OpPayload::Export {
                sql,
                destination_uri,
                connector_type,
                options,
                mode,
            } => {
                export::run(
                    &self.ctx,
                    op,
                    sql,
                    destination_uri,
                    connector_type,
                    options,
                    mode,
                )
                .await
            }
            OpPayload::SetWatermark { key, producer } => {
                match self.ctx.observed_cursors.get(producer) {
                    Some(value) => {
                        self.ctx.store.update(key, value.clone())?;
                        info!(key = %key, value = %value.clone(), "watermark advanced");
                        Ok(0)
                    }
                    None => {
                        debug!(key = %key, "no cursor observed; watermark unchanged");
                        Ok(0)
                    }
                }
            }
        }
    }
}
