use std::collections::HashSet;

use indexmap::IndexMap;
use sqlflow::config::{MissingVarPolicy, Profile};
use sqlflow::parser::parse_pipeline;
use sqlflow::planner::{build_plan, OpPayload, Plan};
use sqlflow::vars::{Substitutor, VarContext};
use sqlflow::SqlFlowError;

fn plan_text(text: &str) -> Result<Plan, SqlFlowError> {
    plan_text_with(text, &[], &[])
}

fn plan_text_with(
    text: &str,
    vars: &[(&str, &str)],
    preexisting: &[&str],
) -> Result<Plan, SqlFlowError> {
    let steps = parse_pipeline(text)?;
    let mut cli = IndexMap::new();
    for (k, v) in vars {
        cli.insert(k.to_string(), v.to_string());
    }
    let subs = Substitutor::new(MissingVarPolicy::Ignore);
    let ctx = VarContext::new(cli, IndexMap::new(), false);
    let profile = Profile::default();
    let pre: HashSet<String> = preexisting.iter().map(|s| s.to_string()).collect();
    build_plan("test", &steps, &subs, ctx, &profile, &pre)
}

#[test]
fn cyclic_dependency_reports_all_nodes() {
    let err = plan_text(
        "CREATE TABLE a AS SELECT * FROM b;\n\
         CREATE TABLE b AS SELECT * FROM a;",
    )
    .unwrap_err();
    match err {
        SqlFlowError::CyclicDependency { nodes } => {
            assert_eq!(nodes.len(), 2);
            assert!(nodes.iter().any(|n| n.contains("-a")));
            assert!(nodes.iter().any(|n| n.contains("-b")));
        }
        other => panic!("expected CyclicDependency, got {other}"),
    }
}

#[test]
fn table_udf_call_produces_edge() {
    let plan = plan_text(
        r#"SOURCE src TYPE file PARAMS { "path": "/tmp" };
LOAD raw FROM src;
CREATE TABLE processed AS SELECT * FROM UDF_CALL("mod.fn", raw);"#,
    )
    .unwrap();

    let load_id = plan
        .operations
        .iter()
        .find(|op| matches!(op.payload, OpPayload::SourceRead { .. }))
        .map(|op| op.id.clone())
        .expect("load op");
    let transform = plan
        .operations
        .iter()
        .find(|op| matches!(op.payload, OpPayload::Transform { .. }))
        .expect("transform op");

    assert!(transform.depends_on.contains(&load_id));
    let load_pos = plan.operations.iter().position(|o| o.id == load_id).unwrap();
    let t_pos = plan
        .operations
        .iter()
        .position(|o| o.id == transform.id)
        .unwrap();
    assert!(load_pos < t_pos);
}

#[test]
fn plans_are_deterministic() {
    let text = r#"SOURCE s TYPE file PARAMS { "path": "/tmp" };
LOAD a FROM s;
CREATE TABLE b AS SELECT * FROM a;
CREATE TABLE c AS SELECT * FROM a JOIN b ON a.x = b.x;
EXPORT SELECT * FROM c TO "out.csv" TYPE file;"#;

    let p1 = plan_text(text).unwrap();
    let p2 = plan_text(text).unwrap();
    let ids1: Vec<_> = p1.operations.iter().map(|o| o.id.clone()).collect();
    let ids2: Vec<_> = p2.operations.iter().map(|o| o.id.clone()).collect();
    assert_eq!(ids1, ids2);
    assert_eq!(p1.edges, p2.edges);
}

#[test]
fn topological_order_respects_every_edge() {
    let text = r#"CREATE TABLE a AS SELECT 1 AS x;
CREATE TABLE b AS SELECT * FROM a;
CREATE TABLE c AS SELECT * FROM a;
CREATE TABLE d AS SELECT * FROM b JOIN c ON b.x = c.x;"#;
    let plan = plan_text(text).unwrap();

    let position: IndexMap<&str, usize> = plan
        .operations
        .iter()
        .enumerate()
        .map(|(i, op)| (op.id.as_str(), i))
        .collect();
    for (from, to) in &plan.edges {
        assert!(
            position[from.as_str()] < position[to.as_str()],
            "edge {from} -> {to} violated"
        );
    }
}

#[test]
fn duplicate_table_without_replace_fails() {
    let err = plan_text(
        "CREATE TABLE t MODE APPEND AS SELECT 1 AS a;\n\
         CREATE TABLE t MODE APPEND AS SELECT 2 AS a;",
    )
    .unwrap_err();
    assert!(matches!(err, SqlFlowError::DuplicateTable { .. }));
}

#[test]
fn duplicate_table_with_replace_keeps_both_ordered() {
    let plan = plan_text(
        "CREATE TABLE t AS SELECT 1 AS a;\n\
         CREATE OR REPLACE TABLE t AS SELECT 2 AS a;\n\
         CREATE TABLE u AS SELECT * FROM t;",
    )
    .unwrap();
    assert_eq!(plan.operations.len(), 3);

    let producers: Vec<_> = plan
        .operations
        .iter()
        .filter(|o| o.outputs == ["t"])
        .collect();
    assert_eq!(producers.len(), 2, "both producers retained");
    let winner = producers.last().unwrap();
    // The redefinition runs after the original; the consumer reads the
    // winning producer.
    assert!(winner.depends_on.contains(&producers[0].id));
    let consumer = plan.operations.iter().find(|o| o.outputs == ["u"]).unwrap();
    assert!(consumer.depends_on.contains(&winner.id));
}

#[test]
fn unknown_table_is_an_error_with_span() {
    let err = plan_text("CREATE TABLE t AS SELECT * FROM ghost;").unwrap_err();
    match err {
        SqlFlowError::UnknownTable { name, span } => {
            assert_eq!(name, "ghost");
            assert_eq!(span.line, 1);
        }
        other => panic!("expected UnknownTable, got {other}"),
    }
}

#[test]
fn preexisting_catalog_tables_are_known() {
    let plan = plan_text_with("CREATE TABLE t AS SELECT * FROM warehouse;", &[], &["warehouse"]);
    assert!(plan.is_ok());
}

#[test]
fn unknown_source_is_an_error() {
    let err = plan_text("LOAD t FROM ghost;").unwrap_err();
    assert!(matches!(err, SqlFlowError::UnknownSource { .. }));
}

#[test]
fn unknown_connector_type_is_a_planning_error() {
    let err = plan_text(r#"SOURCE s TYPE teleport PARAMS { "x": "y" };"#).unwrap_err();
    assert!(matches!(err, SqlFlowError::UnknownConnector { .. }));
}

#[test]
fn untaken_branch_produces_nothing() {
    // The producer of `a` sits behind an untaken IF branch, so the
    // reference fails at planning time.
    let text = r#"SET env = "dev";
IF ${env} == 'prod' THEN
  CREATE TABLE a AS SELECT 1 AS x;
END IF;
CREATE TABLE b AS SELECT * FROM a;"#;
    let err = plan_text(text).unwrap_err();
    assert!(matches!(err, SqlFlowError::UnknownTable { .. }));
}

#[test]
fn taken_branch_contributes_operations() {
    let text = r#"SET env = "prod";
IF ${env} == 'prod' THEN
  CREATE TABLE a AS SELECT 1 AS x;
ELSE
  CREATE TABLE a AS SELECT 2 AS x;
END IF;
CREATE TABLE b AS SELECT * FROM a;"#;
    let plan = plan_text(text).unwrap();
    assert_eq!(plan.operations.len(), 2);
    match &plan.operations[0].payload {
        OpPayload::Transform { sql, .. } => assert!(sql.contains("SELECT 1")),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn cli_overrides_beat_set() {
    let text = r#"SET env = "dev";
IF ${env} == 'prod' THEN
  CREATE TABLE a AS SELECT 1 AS x;
ELSE
  CREATE TABLE a AS SELECT 2 AS x;
END IF;"#;
    let plan = plan_text_with(text, &[("env", "prod")], &[]).unwrap();
    match &plan.operations[0].payload {
        OpPayload::Transform { sql, .. } => assert!(sql.contains("SELECT 1")),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn incremental_transform_plans_watermark_op() {
    let plan = plan_text(
        "CREATE TABLE o AS SELECT 1 AS ts;\n\
         CREATE TABLE daily MODE INCREMENTAL BY ts AS SELECT ts FROM o;",
    )
    .unwrap();
    let wm = plan
        .operations
        .iter()
        .find(|op| matches!(op.payload, OpPayload::SetWatermark { .. }))
        .expect("watermark op");
    let producer = plan.operations.iter().find(|o| o.outputs == ["daily"]).unwrap();
    assert!(wm.depends_on.contains(&producer.id));
}

#[test]
fn bulk_error_collection() {
    let err = plan_text(
        "CREATE TABLE a AS SELECT * FROM ghost1;\n\
         CREATE TABLE b AS SELECT * FROM ghost2;",
    )
    .unwrap_err();
    match err {
        SqlFlowError::Multiple { errors } => assert_eq!(errors.len(), 2),
        other => panic!("expected Multiple, got {other}"),
    }
}
