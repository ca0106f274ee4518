//! Load executor: source connector into the engine.
//!
//! Pulls the source's lazy batch stream through the resilience wrapper,
//! stages every batch in memory, and commits into the target table with
//! the same primitives as transforms (REPLACE / APPEND / MERGE). In
//! incremental sync mode the watermark gates the read and the observed
//! cursor maximum is recorded for the downstream watermark operation.

use futures::StreamExt;
use tracing::{info, warn};

use super::transform::{commit_append, commit_upsert};
use super::ExecutionContext;
use crate::connectors::{Connector, ReadOptions};
use crate::errors::{Result, SqlFlowError};
use crate::parser::LoadMode;
use crate::planner::{Operation, SourceSpec};
use crate::schema::check_keys_present;
use crate::state::WatermarkKey;
use crate::utils::arrow_ext;

pub async fn run(
    ctx: &ExecutionContext,
    op: &Operation,
    source: &SourceSpec,
    target_table: &str,
    columns: Option<&Vec<String>>,
    mode: &LoadMode,
) -> Result<usize> {
    let params = ctx.merged_params(&source.connector_type, &source.params);
    let connector = ctx
        .connectors
        .create(&source.connector_type, &params, op.span)?;
    let policy = ctx.policy_for(connector.as_ref());
    let key = ctx.resilience_key(connector.as_ref());
    let options = ReadOptions::with_batch_size(ctx.profile.engine.batch_size);

    let object = source.object().to_string();
    let incremental = source.sync_mode_incremental();
    let cursor_field = source.cursor_field().map(str::to_string);

    let stream = match (&incremental, &cursor_field) {
        (true, Some(cursor)) => {
            if connector.capabilities().incrementally_readable {
                let wm_key = WatermarkKey {
                    pipeline: ctx.pipeline.clone(),
                    source: source.name.clone(),
                    target: target_table.to_string(),
                    column: cursor.clone(),
                };
                let last = ctx.store.get(&wm_key);
                info!(
                    source = %source.name,
                    cursor,
                    watermark = last.as_ref().map(|v| v.display()).unwrap_or_else(|| "none".into()),
                    "incremental read"
                );
                let conn = connector.clone();
                let last_ref = last.clone();
                ctx.resilience
                    .call(
                        &key,
                        connector.type_name(),
                        "read_incremental",
                        &policy,
                        || {
                            conn.read_incremental(
                                &object,
                                cursor,
                                last_ref.as_ref(),
                                &options,
                            )
                        },
                        || connector.refresh_credentials(),
                    )
                    .await?
            } else {
                // Documented downgrade, not an error: the source cannot
                // filter by cursor, so this run reads everything.
                warn!(
                    source = %source.name,
                    "source does not support incremental reads; downgrading to full read"
                );
                let conn = connector.clone();
                ctx.resilience
                    .call(
                        &key,
                        connector.type_name(),
                        "read",
                        &policy,
                        || conn.read(&object, &options),
                        || connector.refresh_credentials(),
                    )
                    .await?
            }
        }
        (true, None) => {
            return Err(SqlFlowError::Config(format!(
                "source '{}' declares incremental sync but no cursor_field",
                source.name
            )))
        }
        _ => {
            let conn = connector.clone();
            ctx.resilience
                .call(
                    &key,
                    connector.type_name(),
                    "read",
                    &policy,
                    || conn.read(&object, &options),
                    || connector.refresh_credentials(),
                )
                .await?
        }
    };

    // Batches are pulled synchronously: the next pull starts only after
    // the previous batch has been staged.
    let mut stream = stream;
    let mut staged = Vec::new();
    while let Some(batch) = stream.next().await {
        if ctx.cancel.is_cancelled() {
            return Err(SqlFlowError::Cancelled {
                operation: op.id.clone(),
            });
        }
        staged.push(batch?);
    }

    if let Some(cols) = columns {
        staged = project_columns(staged, cols)?;
    }
    let staged_schema = match staged.first() {
        Some(b) => b.schema(),
        None => {
            info!(op = %op.id, target = target_table, "source emitted no rows");
            return Ok(0);
        }
    };

    let rows = match mode {
        LoadMode::Replace => {
            let rows = arrow_ext::row_count(&staged);
            ctx.engine
                .register(target_table, staged_schema.clone(), staged.clone())?;
            rows
        }
        LoadMode::Append => {
            commit_append(
                &ctx.engine,
                target_table,
                staged_schema.clone(),
                staged.clone(),
                ctx.profile.engine.bulk_threshold,
            )
            .await?
        }
        LoadMode::Merge { keys } => {
            // A source without the declared keys is an error; silently
            // falling back to APPEND would duplicate rows.
            check_keys_present(target_table, &staged_schema, keys)?;
            commit_upsert(
                &ctx.engine,
                target_table,
                keys,
                staged_schema.clone(),
                staged.clone(),
                ctx.profile.engine.bulk_threshold,
            )
            .await?
        }
    };

    if incremental {
        if let Some(cursor) = &cursor_field {
            if let Some(max) = arrow_ext::max_cursor_value(&staged, cursor)? {
                ctx.observed_cursors.insert(op.id.clone(), max);
            }
        }
    }

    info!(op = %op.id, target = target_table, rows, "load committed");
    Ok(rows)
}

fn project_columns(
    batches: Vec<datafusion::arrow::record_batch::RecordBatch>,
    columns: &[String],
) -> Result<Vec<datafusion::arrow::record_batch::RecordBatch>> {
    batches
        .into_iter()
        .map(|batch| {
            let schema = batch.schema();
            let indices: Result<Vec<usize>> = columns
                .iter()
                .map(|c| {
                    schema
                        .fields()
                        .iter()
                        .position(|f| f.name().eq_ignore_ascii_case(c))
                        .ok_or_else(|| {
                            SqlFlowError::Config(format!(
                                "LOAD column '{c}' is not present in the source data"
                            ))
                        })
                })
                .collect();
            Ok(batch.project(&indices?)?)
        })
        .collect()
}
