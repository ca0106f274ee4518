//! Variable substitution engine.
//!
//! Single source of truth for resolving `${name}` and `${name|default}` in
//! any string context. One parser produces the expression spans; four
//! formatters (plain, SQL, AST literal, JSON) share it and differ only in
//! how a resolved value is rendered and what a missing variable becomes.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::MissingVarPolicy;
use crate::errors::{Result, Span, SqlFlowError};

/// One `${...}` expression found in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarExpr {
    pub name: String,
    /// Default with outer quotes stripped exactly once.
    pub default: Option<String>,
    /// Byte range of the whole `${...}` in the template.
    pub start: usize,
    pub end: usize,
    /// A `${` occurred inside the name. The whole expression is kept as one
    /// unresolvable reference; nested substitution is not supported.
    pub nested: bool,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal { start: usize, end: usize },
    Expr(VarExpr),
}

/// Parse result for one template, cached by template identity.
#[derive(Debug, Clone)]
pub struct ParsedTemplate {
    segments: Vec<Segment>,
}

impl ParsedTemplate {
    /// Expression spans in template order. Identical across all formatters.
    pub fn expressions(&self) -> impl Iterator<Item = &VarExpr> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr(e) => Some(e),
            Segment::Literal { .. } => None,
        })
    }
}

/// Strips one pair of matching outer quotes, once.
fn strip_default_quotes(raw: &str) -> String {
    let b = raw.as_bytes();
    if b.len() >= 2 {
        let (first, last) = (b[0], b[b.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    raw.to_string()
}

/// Canonical grammar: `${` + name + optional `|default` + `}`. `name`
/// contains no `}` or `|`; `default` contains no `}`. Unbalanced braces
/// fall through as literal text.
pub fn parse_template(input: &str) -> ParsedTemplate {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut lit_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let expr_start = i;
            let mut j = i + 2;
            let mut name_end = None;
            let mut pipe_at = None;
            let mut nested = false;

            while j < bytes.len() {
                match bytes[j] {
                    b'}' => {
                        name_end = Some(j);
                        break;
                    }
                    b'|' if pipe_at.is_none() => pipe_at = Some(j),
                    b'$' if pipe_at.is_none()
                        && j + 1 < bytes.len()
                        && bytes[j + 1] == b'{' =>
                    {
                        nested = true;
                    }
                    _ => {}
                }
                j += 1;
            }

            let Some(mut close) = name_end else {
                // No closing brace: literal fallthrough.
                i += 1;
                continue;
            };

            // A nested `${` swallows one more closing brace so the whole
            // `${a_${b}}` is one (unresolvable) reference.
            if nested {
                let mut k = close + 1;
                let mut second = None;
                while k < bytes.len() {
                    if bytes[k] == b'}' {
                        second = Some(k);
                        break;
                    }
                    k += 1;
                }
                match second {
                    Some(s) => close = s,
                    None => {
                        i += 1;
                        continue;
                    }
                }
            }

            if lit_start < expr_start {
                segments.push(Segment::Literal {
                    start: lit_start,
                    end: expr_start,
                });
            }

            let (name, default) = if nested {
                (input[expr_start + 2..close].to_string(), None)
            } else {
                match pipe_at {
                    Some(p) if p < close => (
                        input[expr_start + 2..p].to_string(),
                        Some(strip_default_quotes(&input[p + 1..close])),
                    ),
                    _ => (input[expr_start + 2..close].to_string(), None),
                }
            };

            segments.push(Segment::Expr(VarExpr {
                name,
                default,
                start: expr_start,
                end: close + 1,
                nested,
            }));

            i = close + 1;
            lit_start = i;
        } else {
            i += 1;
        }
    }

    if lit_start < bytes.len() {
        segments.push(Segment::Literal {
            start: lit_start,
            end: bytes.len(),
        });
    }

    ParsedTemplate { segments }
}

/// Ordered, layered variable map. Lookup returns the first hit:
/// CLI overrides, then pipeline `SET`, then profile defaults, then the
/// process environment. `SET` may redefine mid-pipeline; the new value is
/// visible to subsequent steps.
#[derive(Debug, Clone, Default)]
pub struct VarContext {
    cli: IndexMap<String, String>,
    set: IndexMap<String, String>,
    profile: IndexMap<String, String>,
    use_env: bool,
}

impl VarContext {
    pub fn new(
        cli: IndexMap<String, String>,
        profile: IndexMap<String, String>,
        use_env: bool,
    ) -> Self {
        Self {
            cli,
            set: IndexMap::new(),
            profile,
            use_env,
        }
    }

    /// Applies a pipeline `SET`.
    pub fn set(&mut self, name: &str, value: &str) {
        self.set.insert(name.to_string(), value.to_string());
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(v) = self.cli.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.set.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.profile.get(name) {
            return Some(v.clone());
        }
        if self.use_env {
            return std::env::var(name).ok();
        }
        None
    }
}

/// The value a variable resolves to, typed by sniffing the string form.
/// Variables arrive as strings (CLI, SET, profile, env); SQL/AST/JSON
/// rendering distinguishes numerics and booleans from text.
#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

fn sniff(value: &str) -> Scalar {
    match value {
        "null" | "NULL" => Scalar::Null,
        "true" => Scalar::Bool(true),
        "false" => Scalar::Bool(false),
        _ => {
            if let Ok(i) = value.parse::<i64>() {
                Scalar::Int(i)
            } else if let Ok(f) = value.parse::<f64>() {
                Scalar::Float(f)
            } else {
                Scalar::Str(value.to_string())
            }
        }
    }
}

/// Rendering context; the only axis on which the formatters differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderContext {
    Plain,
    Sql,
    Ast,
    Json,
}

fn sql_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn render_value(value: &str, ctx: RenderContext) -> String {
    match ctx {
        RenderContext::Plain => value.to_string(),
        RenderContext::Sql | RenderContext::Ast => match sniff(value) {
            Scalar::Null => "NULL".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Str(s) => sql_quote(&s),
        },
        RenderContext::Json => match sniff(value) {
            Scalar::Null => "null".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Str(s) => serde_json::Value::String(s).to_string(),
        },
    }
}

/// Fallback rendering when the variable is missing and has no default.
fn render_missing(expr: &VarExpr, template: &str, ctx: RenderContext) -> String {
    match ctx {
        // Keep the original placeholder.
        RenderContext::Plain => template[expr.start..expr.end].to_string(),
        RenderContext::Sql => "NULL".to_string(),
        RenderContext::Ast => "null".to_string(),
        RenderContext::Json => "null".to_string(),
    }
}

/// The substitution engine. Holds the missing-variable strategy and a
/// parse-result cache keyed by input-string identity.
pub struct Substitutor {
    strategy: MissingVarPolicy,
    cache: Mutex<HashMap<String, Arc<ParsedTemplate>>>,
}

impl Substitutor {
    pub fn new(strategy: MissingVarPolicy) -> Self {
        Self {
            strategy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> MissingVarPolicy {
        self.strategy
    }

    /// Parses a template, consulting the cache first.
    pub fn parse(&self, template: &str) -> Arc<ParsedTemplate> {
        let mut cache = self.cache.lock();
        if let Some(parsed) = cache.get(template) {
            return parsed.clone();
        }
        let parsed = Arc::new(parse_template(template));
        cache.insert(template.to_string(), parsed.clone());
        parsed
    }

    fn substitute(
        &self,
        template: &str,
        vars: &VarContext,
        ctx: RenderContext,
        span: Span,
    ) -> Result<String> {
        let parsed = self.parse(template);
        let mut out = String::with_capacity(template.len());

        for segment in &parsed.segments {
            match segment {
                Segment::Literal { start, end } => out.push_str(&template[*start..*end]),
                Segment::Expr(expr) => {
                    let resolved = if expr.nested {
                        None
                    } else {
                        vars.lookup(&expr.name)
                    };
                    match resolved {
                        Some(value) => out.push_str(&render_value(&value, ctx)),
                        None => match &expr.default {
                            Some(default) if !expr.nested => {
                                out.push_str(&render_value(default, ctx))
                            }
                            _ => {
                                let message = if expr.nested {
                                    format!(
                                        "nested variable expression '{}' is not supported",
                                        &template[expr.start..expr.end]
                                    )
                                } else {
                                    format!("variable '{}' is not defined", expr.name)
                                };
                                match self.strategy {
                                    MissingVarPolicy::Fail => {
                                        return Err(SqlFlowError::Substitution { message, span });
                                    }
                                    MissingVarPolicy::Warn => {
                                        warn!("{message}; using {ctx:?} fallback");
                                        out.push_str(&render_missing(expr, template, ctx));
                                    }
                                    MissingVarPolicy::Ignore => {
                                        out.push_str(&render_missing(expr, template, ctx));
                                    }
                                }
                            }
                        },
                    }
                }
            }
        }

        Ok(out)
    }

    /// Plain text context: values verbatim, missing keeps the placeholder.
    pub fn substitute_plain(&self, template: &str, vars: &VarContext, span: Span) -> Result<String> {
        self.substitute(template, vars, RenderContext::Plain, span)
    }

    /// SQL value context: strings quoted with `''` escaping, numerics and
    /// booleans bare, missing becomes `NULL`.
    pub fn substitute_sql(&self, template: &str, vars: &VarContext, span: Span) -> Result<String> {
        self.substitute(template, vars, RenderContext::Sql, span)
    }

    /// Condition-AST context: quoted scalars in the condition grammar,
    /// missing becomes `null`.
    pub fn substitute_ast(&self, template: &str, vars: &VarContext, span: Span) -> Result<String> {
        self.substitute(template, vars, RenderContext::Ast, span)
    }

    /// JSON context: JSON-encoded scalars, missing becomes `null`.
    pub fn substitute_json(&self, template: &str, vars: &VarContext, span: Span) -> Result<String> {
        self.substitute(template, vars, RenderContext::Json, span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> VarContext {
        let mut profile = IndexMap::new();
        for (k, v) in pairs {
            profile.insert(k.to_string(), v.to_string());
        }
        VarContext::new(IndexMap::new(), profile, false)
    }

    #[test]
    fn test_parse_spans() {
        let t = "a ${x} b ${y|'z'} c";
        let parsed = parse_template(t);
        let exprs: Vec<_> = parsed.expressions().collect();
        assert_eq!(exprs.len(), 2);
        assert_eq!(&t[exprs[0].start..exprs[0].end], "${x}");
        assert_eq!(exprs[1].name, "y");
        assert_eq!(exprs[1].default.as_deref(), Some("z"));
    }

    #[test]
    fn test_unbalanced_is_literal() {
        let parsed = parse_template("hello ${oops");
        assert_eq!(parsed.expressions().count(), 0);
    }

    #[test]
    fn test_nested_is_one_reference() {
        let parsed = parse_template("${a_${b}}");
        let exprs: Vec<_> = parsed.expressions().collect();
        assert_eq!(exprs.len(), 1);
        assert!(exprs[0].nested);
        assert_eq!(exprs[0].end, "${a_${b}}".len());
    }

    #[test]
    fn test_default_quote_stripped_once() {
        let parsed = parse_template(r#"${v|"''"}"#);
        let exprs: Vec<_> = parsed.expressions().collect();
        assert_eq!(exprs[0].default.as_deref(), Some("''"));
    }

    #[test]
    fn test_layer_precedence() {
        let mut cli = IndexMap::new();
        cli.insert("x".to_string(), "from_cli".to_string());
        let mut profile = IndexMap::new();
        profile.insert("x".to_string(), "from_profile".to_string());
        let mut vars = VarContext::new(cli, profile, false);
        assert_eq!(vars.lookup("x").unwrap(), "from_cli");
        vars.set("y", "from_set");
        assert_eq!(vars.lookup("y").unwrap(), "from_set");
    }

    #[test]
    fn test_sql_quoting() {
        let sub = Substitutor::new(MissingVarPolicy::Ignore);
        let vars = ctx(&[("name", "O'Brien"), ("n", "42"), ("ok", "true")]);
        let out = sub
            .substitute_sql("${name} ${n} ${ok} ${gone}", &vars, Span::default())
            .unwrap();
        assert_eq!(out, "'O''Brien' 42 true NULL");
    }

    #[test]
    fn test_plain_keeps_placeholder() {
        let sub = Substitutor::new(MissingVarPolicy::Ignore);
        let out = sub
            .substitute_plain("v=${gone}", &ctx(&[]), Span::default())
            .unwrap();
        assert_eq!(out, "v=${gone}");
    }

    #[test]
    fn test_fail_strategy() {
        let sub = Substitutor::new(MissingVarPolicy::Fail);
        let err = sub
            .substitute_plain("${gone}", &ctx(&[]), Span::new(3, 1))
            .unwrap_err();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_json_rendering() {
        let sub = Substitutor::new(MissingVarPolicy::Ignore);
        let vars = ctx(&[("s", "x\"y"), ("i", "7")]);
        let out = sub
            .substitute_json(r#"{"a": ${s}, "b": ${i}, "c": ${gone}}"#, &vars, Span::default())
            .unwrap();
        assert_eq!(out, r#"{"a": "x\"y", "b": 7, "c": null}"#);
    }
}
