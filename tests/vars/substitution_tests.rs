//! Cross-formatter substitution invariants: all four contexts parse the
//! same expression spans and differ only in value rendering.

use indexmap::IndexMap;
use sqlflow::config::MissingVarPolicy;
use sqlflow::errors::Span;
use sqlflow::vars::{parse_template, Substitutor, VarContext};

fn ctx(pairs: &[(&str, &str)]) -> VarContext {
    let mut profile = IndexMap::new();
    for (k, v) in pairs {
        profile.insert(k.to_string(), v.to_string());
    }
    VarContext::new(IndexMap::new(), profile, false)
}

#[test]
fn formatters_share_one_parse() {
    let template = "x=${a} y=${b|'fallback'} z=${missing} w=${a_${b}}";
    let parsed = parse_template(template);
    let spans: Vec<(usize, usize)> = parsed.expressions().map(|e| (e.start, e.end)).collect();

    // Four expressions; the nested one is a single reference.
    assert_eq!(spans.len(), 4);
    assert_eq!(
        &template[spans[3].0..spans[3].1],
        "${a_${b}}",
        "nested expression is one span"
    );

    // Rendering differs per context, parsing does not: every formatter
    // resolves exactly these spans, so defined values land in identical
    // positions relative to the surrounding literals.
    let sub = Substitutor::new(MissingVarPolicy::Ignore);
    let vars = ctx(&[("a", "1")]);
    let span = Span::default();

    let plain = sub.substitute_plain(template, &vars, span).unwrap();
    let sql = sub.substitute_sql(template, &vars, span).unwrap();
    let ast = sub.substitute_ast(template, &vars, span).unwrap();
    let json = sub.substitute_json(template, &vars, span).unwrap();

    assert_eq!(plain, "x=1 y=fallback z=${missing} w=${a_${b}}");
    assert_eq!(sql, "x=1 y='fallback' z=NULL w=NULL");
    assert_eq!(ast, "x=1 y='fallback' z=null w=null");
    assert_eq!(json, "x=1 y=\"fallback\" z=null w=null");
}

#[test]
fn nested_is_always_one_unresolved_reference() {
    let sub = Substitutor::new(MissingVarPolicy::Ignore);
    // Even when both inner names are defined, nesting is not resolved.
    let vars = ctx(&[("a_", "nope"), ("b", "nope"), ("a_b", "nope")]);
    let out = sub
        .substitute_plain("${a_${b}}", &vars, Span::default())
        .unwrap();
    assert_eq!(out, "${a_${b}}");
}

#[test]
fn fail_strategy_is_uniform_across_contexts() {
    let sub = Substitutor::new(MissingVarPolicy::Fail);
    let vars = ctx(&[]);
    let span = Span::new(5, 2);

    for result in [
        sub.substitute_plain("${gone}", &vars, span),
        sub.substitute_sql("${gone}", &vars, span),
        sub.substitute_ast("${gone}", &vars, span),
        sub.substitute_json("${gone}", &vars, span),
    ] {
        let err = result.unwrap_err();
        assert_eq!(err.span(), Some(span));
        assert_eq!(err.code(), "SF0301");
    }
}

#[test]
fn defaults_apply_before_strategy() {
    let sub = Substitutor::new(MissingVarPolicy::Fail);
    let vars = ctx(&[]);
    let out = sub
        .substitute_sql("${region|\"eu\"}", &vars, Span::default())
        .unwrap();
    assert_eq!(out, "'eu'");
}

#[test]
fn sql_context_escapes_quotes() {
    let sub = Substitutor::new(MissingVarPolicy::Ignore);
    let vars = ctx(&[("name", "O'Brien")]);
    let out = sub
        .substitute_sql("SELECT ${x|unused}, ${name}", &vars, Span::default())
        .unwrap();
    assert_eq!(out, "SELECT 'unused', 'O''Brien'");
}

#[test]
fn parse_cache_returns_same_result() {
    let sub = Substitutor::new(MissingVarPolicy::Ignore);
    let t = "a ${x} b";
    let p1 = sub.parse(t);
    let p2 = sub.parse(t);
    // Cached by input-string identity.
    assert!(std::sync::Arc::ptr_eq(&p1, &p2));
}
