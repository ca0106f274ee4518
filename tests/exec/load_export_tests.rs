//! End-to-end LOAD and EXPORT over the file connector: source file into
//! the engine, transform, stage-and-swap out.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

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
) -> RunSummary {
    let steps = parse_pipeline(text).expect("parse");
    let profile = Profile {
        state_dir: state_dir.to_path_buf(),
        ..Profile::default()
    };
    let subs = Substitutor::new(MissingVarPolicy::Warn);
    let ctx = VarContext::new(IndexMap::new(), IndexMap::new(), false);
    let preexisting: HashSet<String> = engine.table_names().into_iter().collect();
    let plan = build_plan("etl", &steps, &subs, ctx, &profile, &preexisting).expect("plan");

    let executor = Executor::new(
        "etl",
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

#[tokio::test]
async fn load_transform_export_roundtrip() {
    let data = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(
        data.path().join("orders.csv"),
        "id,amount\n1,10\n2,20\n3,30\n",
    )
    .unwrap();

    let engine = Arc::new(SqlEngine::new());
    let store = Arc::new(WatermarkStore::open(state.path()).unwrap());

    let text = format!(
        r#"SOURCE src TYPE file PARAMS {{ "path": "{dir}", "object": "orders.csv" }};
LOAD raw FROM src;
CREATE TABLE big AS SELECT id, amount FROM raw WHERE amount >= 20;
EXPORT SELECT * FROM big TO "{dir}/out/big.csv" TYPE file MODE REPLACE;"#,
        dir = data.path().display()
    );

    let summary = run_text(&text, &engine, &store, state.path()).await;
    assert!(summary.is_success(), "{:?}", summary.statuses);
    assert_eq!(count_rows(&engine, "raw").await, 3);
    assert_eq!(count_rows(&engine, "big").await, 2);

    let exported = std::fs::read_to_string(data.path().join("out/big.csv")).unwrap();
    assert!(exported.starts_with("id,amount"));
    assert_eq!(exported.lines().count(), 3); // header + 2 rows
}

#[tokio::test]
async fn incremental_load_advances_watermark() {
    let data = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(data.path().join("events.csv"), "id,v\n1,a\n2,b\n").unwrap();

    let engine = Arc::new(SqlEngine::new());
    let store = Arc::new(WatermarkStore::open(state.path()).unwrap());

    let text = format!(
        r#"SOURCE ev TYPE file PARAMS {{ "path": "{dir}", "object": "events.csv", "sync_mode": "incremental", "cursor_field": "id" }};
LOAD events FROM ev MODE APPEND;"#,
        dir = data.path().display()
    );

    let s1 = run_text(&text, &engine, &store, state.path()).await;
    assert!(s1.is_success(), "{:?}", s1.statuses);
    assert_eq!(count_rows(&engine, "events").await, 2);

    let key = WatermarkKey {
        pipeline: "etl".into(),
        source: "ev".into(),
        target: "events".into(),
        column: "id".into(),
    };
    assert_eq!(
        store.get(&key).expect("watermark"),
        TypedValue::Integer { value_int: 2 }
    );

    // New rows arrive; the second run only ingests past the watermark.
    std::fs::write(data.path().join("events.csv"), "id,v\n1,a\n2,b\n3,c\n").unwrap();
    let s2 = run_text(&text, &engine, &store, state.path()).await;
    assert!(s2.is_success(), "{:?}", s2.statuses);
    assert_eq!(count_rows(&engine, "events").await, 3);
    assert_eq!(
        store.get(&key).expect("watermark"),
        TypedValue::Integer { value_int: 3 }
    );
}

#[tokio::test]
async fn merge_load_deduplicates_by_key() {
    let data = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(data.path().join("users.csv"), "id,name\n1,ann\n2,bob\n").unwrap();

    let engine = Arc::new(SqlEngine::new());
    let store = Arc::new(WatermarkStore::open(state.path()).unwrap());

    let text = format!(
        r#"SOURCE u TYPE file PARAMS {{ "path": "{dir}", "object": "users.csv" }};
LOAD users FROM u MODE MERGE KEY (id);"#,
        dir = data.path().display()
    );
    assert!(run_text(&text, &engine, &store, state.path()).await.is_success());

    // Re-run with an updated row and a new one; keys dedupe.
    std::fs::write(
        data.path().join("users.csv"),
        "id,name\n1,ann2\n3,cyd\n",
    )
    .unwrap();
    let s = run_text(&text, &engine, &store, state.path()).await;
    assert!(s.is_success(), "{:?}", s.statuses);
    assert_eq!(count_rows(&engine, "users").await, 3);

    let (_, updated) = engine
        .query("SELECT name FROM users WHERE id = 1")
        .await
        .unwrap();
    let name = updated[0]
        .column(0)
        .as_any()
        .downcast_ref::<datafusion::arrow::array::StringArray>()
        .unwrap()
        .value(0)
        .to_string();
    assert_eq!(name, "ann2");
}

#[tokio::test]
async fn export_append_writes_unique_files() {
    let data = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();

    let engine = Arc::new(SqlEngine::new());
    let store = Arc::new(WatermarkStore::open(state.path()).unwrap());

    let text = format!(
        r#"CREATE OR REPLACE TABLE t AS SELECT 1 AS a;
EXPORT SELECT * FROM t TO "{dir}/out/t.csv" TYPE file MODE APPEND;"#,
        dir = data.path().display()
    );
    assert!(run_text(&text, &engine, &store, state.path()).await.is_success());
    assert!(run_text(&text, &engine, &store, state.path()).await.is_success());

    let files: Vec<_> = std::fs::read_dir(data.path().join("out"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(files.len(), 2);
}

#[tokio::test]
async fn failed_branch_skips_dependents_without_fail_fast() {
    let data = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let engine = Arc::new(SqlEngine::new());
    let store = Arc::new(WatermarkStore::open(state.path()).unwrap());

    let text = format!(
        r#"SOURCE missing TYPE file PARAMS {{ "path": "{dir}", "object": "nope.csv" }};
LOAD broken FROM missing;
CREATE TABLE downstream AS SELECT * FROM broken;
CREATE TABLE independent AS SELECT 1 AS x;"#,
        dir = data.path().display()
    );

    let steps = parse_pipeline(&text).unwrap();
    let mut profile = Profile {
        state_dir: state.path().to_path_buf(),
        ..Profile::default()
    };
    profile.engine.fail_fast = false;

    let subs = Substitutor::new(MissingVarPolicy::Warn);
    let ctx = VarContext::new(IndexMap::new(), IndexMap::new(), false);
    let plan = build_plan("etl", &steps, &subs, ctx, &profile, &HashSet::new()).unwrap();

    let executor = Executor::new(
        "etl",
        engine.clone(),
        store.clone(),
        profile,
        CancellationToken::new(),
    );
    let summary = executor.execute(&plan).await;
    assert!(!summary.is_success());

    // The independent branch still committed.
    assert_eq!(count_rows(&engine, "independent").await, 1);
    let statuses: Vec<_> = summary
        .statuses
        .iter()
        .map(|(id, s)| (id.clone(), format!("{s:?}")))
        .collect();
    assert!(
        statuses
            .iter()
            .any(|(id, s)| id.contains("downstream") && s.contains("Skipped")),
        "{statuses:?}"
    );
}
