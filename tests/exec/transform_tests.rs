//! End-to-end transform mode scenarios driven through the planner and
//! executor against a shared engine.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use datafusion::arrow::array::{Int64Array, StringArray};
use indexmap::IndexMap;
use sqlflow::config::{MissingVarPolicy, Profile};
use sqlflow::engine::SqlEngine;
use sqlflow::exec::{Executor, RunSummary};
use sqlflow::parser::parse_pipeline;
use sqlflow::planner::build_plan;
use sqlflow::state::{TypedValue, WatermarkKey, WatermarkStore};
use sqlflow::vars::{Substitutor, VarContext};
use tokio_util::sync::CancellationToken;

async fn run_text(
    text: &str,
    engine: &Arc<SqlEngine>,
    store: &Arc<WatermarkStore>,
    state_dir: &Path,
    vars: &[(&str, &str)],
) -> RunSummary {
    let steps = parse_pipeline(text).expect("parse");
    let mut cli = IndexMap::new();
    for (k, v) in vars {
        cli.insert(k.to_string(), v.to_string());
    }
    let profile = Profile {
        state_dir: state_dir.to_path_buf(),
        ..Profile::default()
    };
    let subs = Substitutor::new(MissingVarPolicy::Warn);
    let ctx = VarContext::new(cli, IndexMap::new(), false);
    let preexisting: HashSet<String> = engine.table_names().into_iter().collect();
    let plan = build_plan("test", &steps, &subs, ctx, &profile, &preexisting).expect("plan");

    let executor = Executor::new(
        "test",
        engine.clone(),
        store.clone(),
        profile,
        CancellationToken::new(),
    );
    executor.execute(&plan).await
}

async fn count_rows(engine: &SqlEngine, table: &str) -> usize {
    let (_, batches) = engine
        .query(&format!("SELECT * FROM {table}"))
        .await
        .unwrap();
    batches.iter().map(|b| b.num_rows()).sum()
}

fn setup(dir: &tempfile::TempDir) -> (Arc<SqlEngine>, Arc<WatermarkStore>) {
    (
        Arc::new(SqlEngine::new()),
        Arc::new(WatermarkStore::open(dir.path()).unwrap()),
    )
}

#[tokio::test]
async fn replace_transform_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = setup(&dir);
    let text = "CREATE OR REPLACE TABLE t AS SELECT 1 AS a, '${date}' AS d;";

    let s1 = run_text(text, &engine, &store, dir.path(), &[("date", "2024-01-01")]).await;
    assert!(s1.is_success(), "{:?}", s1.statuses);
    assert_eq!(count_rows(&engine, "t").await, 1);

    let (_, batches) = engine.query("SELECT d FROM t").await.unwrap();
    let d = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap()
        .value(0)
        .to_string();
    assert_eq!(d, "2024-01-01");

    // Second run reproduces the same single row.
    let s2 = run_text(text, &engine, &store, dir.path(), &[("date", "2024-01-01")]).await;
    assert!(s2.is_success());
    assert_eq!(count_rows(&engine, "t").await, 1);
}

#[tokio::test]
async fn incremental_transform_with_lookback() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = setup(&dir);

    let seed = "CREATE OR REPLACE TABLE orders AS \
        SELECT TIMESTAMP '2024-01-01 00:00:00' AS ts, 10 AS amount \
        UNION ALL SELECT TIMESTAMP '2024-01-02 00:00:00', 20 \
        UNION ALL SELECT TIMESTAMP '2024-01-03 00:00:00', 30;";
    assert!(run_text(seed, &engine, &store, dir.path(), &[]).await.is_success());

    let daily = "CREATE TABLE daily MODE INCREMENTAL BY ts LOOKBACK '1 day' AS \
        SELECT ts, amount FROM orders WHERE ts > @start_dt AND ts <= @end_dt;";

    // First run, no watermark: all three rows.
    let s1 = run_text(daily, &engine, &store, dir.path(), &[]).await;
    assert!(s1.is_success(), "{:?}", s1.statuses);
    assert_eq!(count_rows(&engine, "daily").await, 3);

    let key = WatermarkKey {
        pipeline: "test".into(),
        source: "daily".into(),
        target: "daily".into(),
        column: "ts".into(),
    };
    match store.get(&key).expect("watermark set") {
        TypedValue::Timestamp { value_ts } => {
            assert!(value_ts.to_rfc3339().starts_with("2024-01-03"))
        }
        other => panic!("unexpected watermark {other:?}"),
    }

    // Same-day correction (amount 30 -> 31) plus a new day.
    let correct = "CREATE OR REPLACE TABLE orders AS \
        SELECT TIMESTAMP '2024-01-01 00:00:00' AS ts, 10 AS amount \
        UNION ALL SELECT TIMESTAMP '2024-01-02 00:00:00', 20 \
        UNION ALL SELECT TIMESTAMP '2024-01-03 00:00:00', 31 \
        UNION ALL SELECT TIMESTAMP '2024-01-04 00:00:00', 40;";
    assert!(run_text(correct, &engine, &store, dir.path(), &[]).await.is_success());

    // Second run: lookback re-processes 01-03, picks up 01-04.
    let s2 = run_text(daily, &engine, &store, dir.path(), &[]).await;
    assert!(s2.is_success(), "{:?}", s2.statuses);
    assert_eq!(count_rows(&engine, "daily").await, 4);

    let (_, batches) = engine
        .query("SELECT amount FROM daily ORDER BY ts")
        .await
        .unwrap();
    let amounts: Vec<i64> = batches
        .iter()
        .flat_map(|b| {
            b.column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .values()
                .to_vec()
        })
        .collect();
    assert_eq!(amounts, vec![10, 20, 31, 40]);

    match store.get(&key).expect("watermark advanced") {
        TypedValue::Timestamp { value_ts } => {
            assert!(value_ts.to_rfc3339().starts_with("2024-01-04"))
        }
        other => panic!("unexpected watermark {other:?}"),
    }
}

#[tokio::test]
async fn upsert_with_composite_key() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = setup(&dir);

    let seed = "CREATE OR REPLACE TABLE t AS SELECT 1 AS id, 'us' AS region, 10 AS v;";
    assert!(run_text(seed, &engine, &store, dir.path(), &[]).await.is_success());

    let upsert =
        "CREATE TABLE t MODE UPSERT KEY (id, region) AS VALUES (1, 'us', 11), (2, 'eu', 20);";
    let s = run_text(upsert, &engine, &store, dir.path(), &[]).await;
    assert!(s.is_success(), "{:?}", s.statuses);

    let (_, batches) = engine
        .query("SELECT id, region, v FROM t ORDER BY id")
        .await
        .unwrap();
    let ids: Vec<i64> = batches
        .iter()
        .flat_map(|b| {
            b.column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .values()
                .to_vec()
        })
        .collect();
    let vs: Vec<i64> = batches
        .iter()
        .flat_map(|b| {
            b.column(2)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .values()
                .to_vec()
        })
        .collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(vs, vec![11, 20]);
}

#[tokio::test]
async fn append_with_column_addition() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = setup(&dir);

    let seed = "CREATE OR REPLACE TABLE t AS SELECT 1 AS a UNION ALL SELECT 2;";
    assert!(run_text(seed, &engine, &store, dir.path(), &[]).await.is_success());

    let append = "CREATE TABLE t MODE APPEND AS SELECT 3 AS a, 'x' AS b;";
    let s = run_text(append, &engine, &store, dir.path(), &[]).await;
    assert!(s.is_success(), "{:?}", s.statuses);

    let (schema, batches) = engine
        .query("SELECT a, b FROM t ORDER BY a")
        .await
        .unwrap();
    assert_eq!(schema.fields().len(), 2);
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 3);

    // The pre-existing rows carry NULL in the added column.
    let (_, nulls) = engine
        .query("SELECT a FROM t WHERE b IS NULL ORDER BY a")
        .await
        .unwrap();
    assert_eq!(nulls.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
    let (_, filled) = engine
        .query("SELECT a FROM t WHERE b = 'x'")
        .await
        .unwrap();
    assert_eq!(filled.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
}

#[tokio::test]
async fn failed_transform_leaves_table_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = setup(&dir);

    let seed = "CREATE OR REPLACE TABLE t AS SELECT 1 AS a;";
    assert!(run_text(seed, &engine, &store, dir.path(), &[]).await.is_success());

    // Incompatible APPEND: column a changes type class.
    let bad = "CREATE TABLE t MODE APPEND AS SELECT true AS a;";
    let s = run_text(bad, &engine, &store, dir.path(), &[]).await;
    assert!(!s.is_success());
    assert_eq!(count_rows(&engine, "t").await, 1);
}

#[tokio::test]
async fn table_udf_executes_through_external_processing() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = setup(&dir);
    engine
        .udfs()
        .register_table_fn("mod.identity", |batches, _| Ok(batches));

    let seed = "CREATE OR REPLACE TABLE raw AS SELECT 1 AS a UNION ALL SELECT 2;";
    assert!(run_text(seed, &engine, &store, dir.path(), &[]).await.is_success());

    let transform = r#"CREATE TABLE processed AS SELECT * FROM UDF_CALL("mod.identity", raw);"#;
    let s = run_text(transform, &engine, &store, dir.path(), &[]).await;
    assert!(s.is_success(), "{:?}", s.statuses);
    assert_eq!(count_rows(&engine, "processed").await, 2);
}
