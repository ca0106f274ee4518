//! Transform mode executor.
//!
//! Realizes `CREATE TABLE <t> [MODE ...] AS <query>` against the engine.
//! Every mode computes the complete new table contents first and commits
//! by swapping the catalog registration, so a failure anywhere before the
//! swap leaves the live table untouched and never updates a watermark.
//!
//! State machine per transform:
//! Planned -> Preparing -> Staging -> Swapping -> Committed | Failed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::ScalarValue;
use tracing::{debug, info, warn};

use super::ExecutionContext;
use crate::engine::{rewrite_time_macros, uses_time_macros, SqlEngine};
use crate::errors::Result;
use crate::parser::TransformMode;
use crate::planner::Operation;
use crate::schema::{check_keys_non_null, check_keys_present, evolve};
use crate::state::{TypedValue, WatermarkKey};
use crate::utils::arrow_ext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransformState {
    Planned,
    Preparing,
    Staging,
    Swapping,
    Committed,
    Failed,
}

struct StateTracker<'a> {
    op_id: &'a str,
    state: TransformState,
}

impl<'a> StateTracker<'a> {
    fn new(op_id: &'a str) -> Self {
        Self {
            op_id,
            state: TransformState::Planned,
        }
    }

    fn advance(&mut self, next: TransformState) {
        debug!(op = self.op_id, from = ?self.state, to = ?next, "transform state");
        self.state = next;
    }
}

/// Runs one transform operation. Returns the number of rows in the new
/// table contents.
pub async fn run(
    ctx: &ExecutionContext,
    op: &Operation,
    table: &str,
    sql: &str,
    mode: &TransformMode,
) -> Result<usize> {
    let mut tracker = StateTracker::new(&op.id);
    let result = run_inner(ctx, op, table, sql, mode, &mut tracker).await;
    match &result {
        Ok(rows) => {
            tracker.advance(TransformState::Committed);
            info!(op = %op.id, table, rows, "transform committed");
        }
        Err(e) => {
            tracker.advance(TransformState::Failed);
            warn!(op = %op.id, table, error = %e, "transform failed; table untouched");
        }
    }
    result
}

async fn run_inner(
    ctx: &ExecutionContext,
    op: &Operation,
    table: &str,
    sql: &str,
    mode: &TransformMode,
    tracker: &mut StateTracker<'_>,
) -> Result<usize> {
    tracker.advance(TransformState::Preparing);
    let sql = ctx.engine.expand_table_udfs(sql).await?;

    match mode {
        TransformMode::Replace => {
            tracker.advance(TransformState::Staging);
            let (schema, batches) = ctx.engine.query(&sql).await?;
            let rows = arrow_ext::row_count(&batches);
            tracker.advance(TransformState::Swapping);
            ctx.engine.register(table, schema, batches)?;
            Ok(rows)
        }
        TransformMode::Append => {
            tracker.advance(TransformState::Staging);
            let (schema, batches) = ctx.engine.query(&sql).await?;
            tracker.advance(TransformState::Swapping);
            commit_append(
                &ctx.engine,
                table,
                schema,
                batches,
                ctx.profile.engine.bulk_threshold,
            )
            .await
        }
        TransformMode::Upsert { keys } => {
            tracker.advance(TransformState::Staging);
            let (schema, batches) = ctx.engine.query(&sql).await?;
            tracker.advance(TransformState::Swapping);
            commit_upsert(
                &ctx.engine,
                table,
                keys,
                schema,
                batches,
                ctx.profile.engine.bulk_threshold,
            )
            .await
        }
        TransformMode::Incremental {
            time_column,
            lookback,
        } => {
            run_incremental(ctx, op, table, &sql, time_column, *lookback, tracker).await
        }
    }
}

// ---------------------------------------------------------------------------
// shared commit primitives (also used by the load executor)
// ---------------------------------------------------------------------------

/// Coalesces many small batches into the bulk columnar path above the
/// threshold; below it the batches are kept as-is.
fn maybe_bulk(
    schema: &SchemaRef,
    batches: Vec<RecordBatch>,
    bulk_threshold: usize,
) -> Result<Vec<RecordBatch>> {
    if arrow_ext::row_count(&batches) > bulk_threshold && batches.len() > 1 {
        Ok(vec![arrow_ext::concat_all(schema, &batches)?])
    } else {
        Ok(batches)
    }
}

/// APPEND commit: schema-evolve the target, align both sides, swap in the
/// combined contents.
pub async fn commit_append(
    engine: &SqlEngine,
    table: &str,
    staging_schema: SchemaRef,
    staging: Vec<RecordBatch>,
    bulk_threshold: usize,
) -> Result<usize> {
    if !engine.table_exists(table)? {
        let rows = arrow_ext::row_count(&staging);
        engine.register(table, staging_schema, staging)?;
        return Ok(rows);
    }

    let (target_schema, target_batches) = engine.table_batches(table).await?;
    let staging = arrow_ext::adopt_target_names(staging, &target_schema)?;
    let staging_schema = staging
        .first()
        .map(|b| b.schema())
        .unwrap_or(staging_schema);

    let evolution = evolve(table, &target_schema, &staging_schema)?;
    if !evolution.is_noop() {
        debug!(
            table,
            added = ?evolution.added,
            widened = ?evolution.widened,
            "schema evolved"
        );
    }

    let mut combined = Vec::with_capacity(target_batches.len() + staging.len());
    for batch in &target_batches {
        combined.push(arrow_ext::align_to_schema(batch, &evolution.schema)?);
    }
    for batch in &staging {
        combined.push(arrow_ext::align_to_schema(batch, &evolution.schema)?);
    }

    let rows = arrow_ext::row_count(&combined);
    let combined = maybe_bulk(&evolution.schema, combined, bulk_threshold)?;
    engine.register(table, evolution.schema.clone(), combined)?;
    Ok(rows)
}

/// UPSERT commit: rows whose key tuple exists in the target are replaced
/// by the staged rows, others are appended. Realized as keep-survivors
/// plus staged rows, swapped in one registration.
pub async fn commit_upsert(
    engine: &SqlEngine,
    table: &str,
    keys: &[String],
    staging_schema: SchemaRef,
    staging: Vec<RecordBatch>,
    bulk_threshold: usize,
) -> Result<usize> {
    if !engine.table_exists(table)? {
        check_keys_present(table, &staging_schema, keys)?;
        let rows = arrow_ext::row_count(&staging);
        engine.register(table, staging_schema, staging)?;
        return Ok(rows);
    }

    let (target_schema, _) = engine.table_batches(table).await?;
    let staging = arrow_ext::adopt_target_names(staging, &target_schema)?;
    let staging_schema = staging
        .first()
        .map(|b| b.schema())
        .unwrap_or(staging_schema);

    check_keys_present(table, &target_schema, keys)?;
    check_keys_present(table, &staging_schema, keys)?;
    check_keys_non_null(table, &staging, keys)?;

    let evolution = evolve(table, &target_schema, &staging_schema)?;

    // Survivors: target rows whose key tuple is absent from staging.
    let stage_name = format!("__stage_{table}");
    engine.register(&stage_name, staging_schema.clone(), staging.clone())?;
    let predicate = keys
        .iter()
        .map(|k| format!("s.\"{0}\" = t.\"{0}\"", k.to_ascii_lowercase()))
        .collect::<Vec<_>>()
        .join(" AND ");
    let survivors_sql = format!(
        "SELECT t.* FROM \"{table}\" t WHERE NOT EXISTS (SELECT 1 FROM \"{stage_name}\" s WHERE {predicate})"
    );
    let survivors = engine.query(&survivors_sql).await;
    engine.drop_table(&stage_name)?;
    let (_, survivor_batches) = survivors?;

    let mut combined = Vec::with_capacity(survivor_batches.len() + staging.len());
    for batch in &survivor_batches {
        combined.push(arrow_ext::align_to_schema(batch, &evolution.schema)?);
    }
    for batch in &staging {
        combined.push(arrow_ext::align_to_schema(batch, &evolution.schema)?);
    }

    let rows = arrow_ext::row_count(&combined);
    let combined = maybe_bulk(&evolution.schema, combined, bulk_threshold)?;
    engine.register(table, evolution.schema.clone(), combined)?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// INCREMENTAL
// ---------------------------------------------------------------------------

fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(0, 0).expect("epoch")
}

fn format_dt(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn format_date(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

/// Range parameters bound into the query and the delete-range statement.
struct TimeRange {
    start: ScalarValue,
    end: ScalarValue,
    start_date: ScalarValue,
    end_date: ScalarValue,
}

impl TimeRange {
    fn params(&self) -> Vec<(String, ScalarValue)> {
        vec![
            ("start_dt".to_string(), self.start.clone()),
            ("end_dt".to_string(), self.end.clone()),
            ("start_date".to_string(), self.start_date.clone()),
            ("end_date".to_string(), self.end_date.clone()),
        ]
    }
}

fn resolve_range(
    watermark: Option<&TypedValue>,
    lookback: Option<ChronoDuration>,
) -> TimeRange {
    match watermark {
        Some(TypedValue::Integer { value_int }) => {
            if lookback.is_some() {
                warn!("LOOKBACK ignored for integer cursor columns");
            }
            TimeRange {
                start: ScalarValue::Int64(Some(*value_int)),
                end: ScalarValue::Int64(Some(i64::MAX)),
                start_date: ScalarValue::Int64(Some(*value_int)),
                end_date: ScalarValue::Int64(Some(i64::MAX)),
            }
        }
        Some(TypedValue::Text { value_str }) => TimeRange {
            start: ScalarValue::Utf8(Some(value_str.clone())),
            end: ScalarValue::Utf8(Some(format_dt(&Utc::now()))),
            start_date: ScalarValue::Utf8(Some(value_str.clone())),
            end_date: ScalarValue::Utf8(Some(format_date(&Utc::now()))),
        },
        Some(TypedValue::Timestamp { value_ts }) => {
            let start = *value_ts - lookback.unwrap_or_else(ChronoDuration::zero);
            let end = Utc::now();
            TimeRange {
                start: ScalarValue::Utf8(Some(format_dt(&start))),
                end: ScalarValue::Utf8(Some(format_dt(&end))),
                start_date: ScalarValue::Utf8(Some(format_date(&start))),
                end_date: ScalarValue::Utf8(Some(format_date(&end))),
            }
        }
        None => {
            let end = Utc::now();
            TimeRange {
                start: ScalarValue::Utf8(Some(format_dt(&epoch()))),
                end: ScalarValue::Utf8(Some(format_dt(&end))),
                start_date: ScalarValue::Utf8(Some(format_date(&epoch()))),
                end_date: ScalarValue::Utf8(Some(format_date(&end))),
            }
        }
    }
}

async fn run_incremental(
    ctx: &ExecutionContext,
    op: &Operation,
    table: &str,
    sql: &str,
    time_column: &str,
    lookback: Option<ChronoDuration>,
    tracker: &mut StateTracker<'_>,
) -> Result<usize> {
    let key = WatermarkKey {
        pipeline: ctx.pipeline.clone(),
        source: table.to_string(),
        target: table.to_string(),
        column: time_column.to_string(),
    };
    let watermark = ctx.store.get(&key);
    let range = resolve_range(watermark.as_ref(), lookback);

    if !uses_time_macros(sql) {
        debug!(table, "incremental query uses no time macros; range filters only the delete window");
    }
    let parameterized = rewrite_time_macros(sql);

    tracker.advance(TransformState::Staging);
    let (schema, inserted) = ctx
        .engine
        .query_with_params(&parameterized, range.params())
        .await?;
    let observed = arrow_ext::max_cursor_value(&inserted, time_column)?;

    tracker.advance(TransformState::Swapping);
    let col = time_column.to_ascii_lowercase();
    let rows = if ctx.engine.table_exists(table)? {
        // Delete-range emulation: keep rows outside (start, end], then
        // append the fresh rows, one swap.
        let kept_sql = format!(
            "SELECT * FROM \"{table}\" WHERE \"{col}\" <= $start_dt OR \"{col}\" > $end_dt OR \"{col}\" IS NULL"
        );
        let (target_schema, kept) = ctx
            .engine
            .query_with_params(&kept_sql, range.params())
            .await?;

        let mut combined = Vec::with_capacity(kept.len() + inserted.len());
        combined.extend(kept);
        for batch in &inserted {
            combined.push(arrow_ext::align_to_schema(batch, &target_schema)?);
        }
        let rows = arrow_ext::row_count(&combined);
        let combined = maybe_bulk(&target_schema, combined, ctx.profile.engine.bulk_threshold)?;
        ctx.engine.register(table, target_schema, combined)?;
        rows
    } else {
        let rows = arrow_ext::row_count(&inserted);
        ctx.engine.register(table, schema, inserted)?;
        rows
    };

    // The watermark op downstream persists this after the commit above.
    if let Some(max) = observed {
        ctx.observed_cursors.insert(op.id.clone(), max);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_without_watermark_starts_at_epoch() {
        let r = resolve_range(None, None);
        match r.start {
            ScalarValue::Utf8(Some(s)) => assert!(s.starts_with("1970-01-01")),
            other => panic!("unexpected scalar {other:?}"),
        }
    }

    #[test]
    fn test_range_applies_lookback() {
        let ts = DateTime::parse_from_rfc3339("2024-01-03T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let r = resolve_range(
            Some(&TypedValue::Timestamp { value_ts: ts }),
            Some(ChronoDuration::days(1)),
        );
        match r.start {
            ScalarValue::Utf8(Some(s)) => assert!(s.starts_with("2024-01-02")),
            other => panic!("unexpected scalar {other:?}"),
        }
    }

    #[test]
    fn test_integer_cursor_range() {
        let r = resolve_range(Some(&TypedValue::Integer { value_int: 42 }), None);
        assert_eq!(r.start, ScalarValue::Int64(Some(42)));
        assert_eq!(r.end, ScalarValue::Int64(Some(i64::MAX)));
    }
}
