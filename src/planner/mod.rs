//! Execution planner.
//!
//! Lowers the parsed pipeline into a DAG of operations with resolved
//! table and source references, then returns the operations in a
//! deterministic topological order. Conditions are evaluated here, SET
//! statements update the variable context mid-walk, and every diagnostic
//! is collected before the plan fails.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::condition;
use crate::config::Profile;
use crate::connectors::ConnectorRegistry;
use crate::errors::{Result, Span, SqlFlowError};
use crate::parser::{ExportMode, LoadMode, Step, TransformMode};
use crate::state::WatermarkKey;
use crate::vars::{Substitutor, VarContext};

/// Connector binding for a SOURCE declaration, params post-substitution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSpec {
    pub name: String,
    pub connector_type: String,
    pub params: IndexMap<String, String>,
}

impl SourceSpec {
    /// The remote object to read; defaults to the source name.
    pub fn object(&self) -> &str {
        self.params.get("object").map(|s| s.as_str()).unwrap_or(&self.name)
    }

    pub fn sync_mode_incremental(&self) -> bool {
        self.params
            .get("sync_mode")
            .map(|m| m.eq_ignore_ascii_case("incremental"))
            .unwrap_or(false)
    }

    pub fn cursor_field(&self) -> Option<&str> {
        self.params.get("cursor_field").map(|s| s.as_str())
    }
}

/// Typed payload of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpPayload {
    /// Pull batches from a connector and commit them into the target table.
    SourceRead {
        source: SourceSpec,
        target_table: String,
        columns: Option<Vec<String>>,
        mode: LoadMode,
    },
    /// Execute a SQL statement with a write mode against the engine.
    Transform {
        table: String,
        sql: String,
        mode: TransformMode,
        is_replace: bool,
    },
    /// Stage a query result out to a destination.
    Export {
        sql: String,
        destination_uri: String,
        connector_type: String,
        options: IndexMap<String, String>,
        mode: ExportMode,
    },
    /// Persist the cursor value observed by the producing operation.
    SetWatermark {
        key: WatermarkKey,
        producer: String,
    },
}

impl OpPayload {
    fn kind(&self) -> &'static str {
        match self {
            OpPayload::SourceRead { .. } => "load",
            OpPayload::Transform { .. } => "transform",
            OpPayload::Export { .. } => "export",
            OpPayload::SetWatermark { .. } => "watermark",
        }
    }
}

/// One node of the execution DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub outputs: Vec<String>,
    pub depends_on: Vec<String>,
    pub payload: OpPayload,
    pub span: Span,
}

/// A validated, topologically ordered plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub pipeline: String,
    /// Operations in execution order.
    pub operations: Vec<Operation>,
    /// Adjacency list (producer id, consumer id).
    pub edges: Vec<(String, String)>,
}

impl Plan {
    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Consumers downstream of `id`, transitively.
    pub fn dependents_of(&self, id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(cur) = frontier.pop() {
            for (from, to) in &self.edges {
                if *from == cur && out.insert(to.clone()) {
                    frontier.push(to.clone());
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// dependency extraction
// ---------------------------------------------------------------------------

/// Table references consumed by a SQL statement: `FROM <ident>`,
/// `JOIN <ident>`, and the first table argument of `UDF_CALL("m.f", <ident>)`.
/// Extraction is case-insensitive; names come back lowercased.
pub fn extract_table_refs(sql: &str) -> Vec<String> {
    let from_join = Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_\.]*)")
        .expect("static regex");
    let udf_call = Regex::new(r#"(?i)\bUDF_CALL\s*\(\s*["'][^"']*["']\s*,\s*([A-Za-z_][A-Za-z0-9_]*)"#)
        .expect("static regex");

    let mut seen = HashSet::new();
    let mut refs = Vec::new();

    for cap in from_join.captures_iter(sql) {
        let m = cap.get(1).expect("capture group");
        // A trailing '(' means a table function, not a table name.
        if sql[m.end()..].trim_start().starts_with('(') {
            continue;
        }
        let name = m.as_str().to_ascii_lowercase();
        if seen.insert(name.clone()) {
            refs.push(name);
        }
    }
    for cap in udf_call.captures_iter(sql) {
        let name = cap.get(1).expect("capture group").as_str().to_ascii_lowercase();
        if seen.insert(name.clone()) {
            refs.push(name);
        }
    }
    refs
}

// ---------------------------------------------------------------------------
// planning
// ---------------------------------------------------------------------------

struct PlanBuilder<'a> {
    pipeline: String,
    subs: &'a Substitutor,
    vars: VarContext,
    /// Tables present in the engine catalog before the run.
    preexisting: HashSet<String>,
    /// Declared sources in scope: name -> spec.
    sources: HashMap<String, SourceSpec>,
    /// Current producer of each (lowercased) table name.
    producers: HashMap<String, usize>,
    ops: Vec<Operation>,
    edge_set: BTreeSet<(usize, usize)>,
    errors: Vec<SqlFlowError>,
    seq: usize,
}

impl<'a> PlanBuilder<'a> {
    fn next_id(&mut self, kind: &str, name: &str) -> String {
        self.seq += 1;
        let sanitized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!("op-{:03}-{kind}-{sanitized}", self.seq)
    }

    fn push_op(&mut self, op: Operation) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        if from != to {
            self.edge_set.insert((from, to));
        }
    }

    fn link_consumed_tables(&mut self, sql: &str, consumer: usize, span: Span) {
        for table in extract_table_refs(sql) {
            if let Some(&producer) = self.producers.get(&table) {
                self.add_edge(producer, consumer);
            } else if !self.preexisting.contains(&table) {
                self.errors.push(SqlFlowError::UnknownTable { name: table, span });
            }
        }
    }

    fn walk(&mut self, steps: &[Step]) {
        for step in steps {
            match step {
                Step::Set(set) => {
                    match self.subs.substitute_plain(&set.value, &self.vars, set.span) {
                        Ok(value) => self.vars.set(&set.name, &value),
                        Err(e) => self.errors.push(e),
                    }
                }
                Step::Source(def) => {
                    if ConnectorRegistry::global()
                        .kind_of(&def.connector_type)
                        .is_none()
                    {
                        self.errors.push(SqlFlowError::UnknownConnector {
                            type_name: def.connector_type.clone(),
                            span: def.span,
                        });
                        continue;
                    }
                    let params = match self.resolve_params(&def.params_raw, def.span) {
                        Ok(p) => p,
                        Err(e) => {
                            self.errors.push(e);
                            continue;
                        }
                    };
                    self.sources.insert(
                        def.name.clone(),
                        SourceSpec {
                            name: def.name.clone(),
                            connector_type: def.connector_type.clone(),
                            params,
                        },
                    );
                }
                Step::Load(load) => self.plan_load(load),
                Step::Sql(sql) => self.plan_transform(sql),
                Step::Export(export) => self.plan_export(export),
                Step::If(branch) => {
                    match condition::evaluate(&branch.condition, self.subs, &self.vars, branch.span)
                    {
                        Ok(true) => self.walk(&branch.then_steps),
                        Ok(false) => self.walk(&branch.else_steps),
                        Err(e) => self.errors.push(e),
                    }
                }
                Step::Include(inc) => {
                    // Includes are flattened by the loader before planning.
                    self.errors.push(SqlFlowError::Pipeline(format!(
                        "unresolved INCLUDE '{}' reached the planner",
                        inc.path
                    )));
                }
            }
        }
    }

    fn resolve_params(&self, raw: &str, span: Span) -> Result<IndexMap<String, String>> {
        let substituted = self.subs.substitute_plain(raw, &self.vars, span)?;
        let parsed: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&substituted).map_err(|e| SqlFlowError::Parse {
                message: format!("invalid JSON block: {e}"),
                span,
            })?;
        let mut map = IndexMap::new();
        for (k, v) in parsed {
            let s = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            map.insert(k, s);
        }
        Ok(map)
    }

    fn plan_load(&mut self, load: &crate::parser::LoadStmt) {
        let Some(source) = self.sources.get(&load.source_name).cloned() else {
            self.errors.push(SqlFlowError::UnknownSource {
                name: load.source_name.clone(),
                span: load.span,
            });
            return;
        };

        let target = load.target_table.to_ascii_lowercase();
        let id = self.next_id("load", &target);
        let incremental = source.sync_mode_incremental();
        let cursor = source.cursor_field().map(str::to_string);
        let idx = self.push_op(Operation {
            id: id.clone(),
            outputs: vec![target.clone()],
            depends_on: Vec::new(),
            payload: OpPayload::SourceRead {
                source: source.clone(),
                target_table: target.clone(),
                columns: load.columns.clone(),
                mode: load.mode.clone(),
            },
            span: load.span,
        });
        self.producers.insert(target.clone(), idx);

        if incremental {
            if let Some(column) = cursor {
                let wid = self.next_id("watermark", &target);
                let widx = self.push_op(Operation {
                    id: wid,
                    outputs: Vec::new(),
                    depends_on: Vec::new(),
                    payload: OpPayload::SetWatermark {
                        key: WatermarkKey {
                            pipeline: self.pipeline.clone(),
                            source: source.name.clone(),
                            target: target.clone(),
                            column,
                        },
                        producer: id,
                    },
                    span: load.span,
                });
                self.add_edge(idx, widx);
            }
        }
    }

    fn plan_transform(&mut self, block: &crate::parser::SqlBlock) {
        let sql = match self.subs.substitute_plain(&block.query, &self.vars, block.span) {
            Ok(s) => s,
            Err(e) => {
                self.errors.push(e);
                return;
            }
        };

        let table = block.table_name.to_ascii_lowercase();
        if let Some(&previous) = self.producers.get(&table) {
            if !block.is_replace {
                self.errors.push(SqlFlowError::DuplicateTable {
                    name: table.clone(),
                    span: block.span,
                });
                return;
            }
            // Redefinition: both operations keep their edges; the later
            // one becomes the producer and must run after the earlier.
            let id = self.next_id("transform", &table);
            let idx = self.push_op(Operation {
                id,
                outputs: vec![table.clone()],
                depends_on: Vec::new(),
                payload: OpPayload::Transform {
                    table: table.clone(),
                    sql: sql.clone(),
                    mode: block.mode.clone(),
                    is_replace: true,
                },
                span: block.span,
            });
            self.add_edge(previous, idx);
            self.link_consumed_tables(&sql, idx, block.span);
            self.producers.insert(table, idx);
            return;
        }

        let id = self.next_id("transform", &table);
        let idx = self.push_op(Operation {
            id: id.clone(),
            outputs: vec![table.clone()],
            depends_on: Vec::new(),
            payload: OpPayload::Transform {
                table: table.clone(),
                sql: sql.clone(),
                mode: block.mode.clone(),
                is_replace: block.is_replace,
            },
            span: block.span,
        });
        self.link_consumed_tables(&sql, idx, block.span);
        self.producers.insert(table.clone(), idx);

        if let TransformMode::Incremental { time_column, .. } = &block.mode {
            let wid = self.next_id("watermark", &table);
            let widx = self.push_op(Operation {
                id: wid,
                outputs: Vec::new(),
                depends_on: Vec::new(),
                payload: OpPayload::SetWatermark {
                    key: WatermarkKey {
                        pipeline: self.pipeline.clone(),
                        source: table.clone(),
                        target: table.clone(),
                        column: time_column.clone(),
                    },
                    producer: id,
                },
                span: block.span,
            });
            self.add_edge(idx, widx);
        }
    }

    fn plan_export(&mut self, export: &crate::parser::ExportStmt) {
        if ConnectorRegistry::global()
            .kind_of(&export.connector_type)
            .is_none()
        {
            self.errors.push(SqlFlowError::UnknownConnector {
                type_name: export.connector_type.clone(),
                span: export.span,
            });
            return;
        }
        let sql = match self.subs.substitute_plain(&export.query, &self.vars, export.span) {
            Ok(s) => s,
            Err(e) => {
                self.errors.push(e);
                return;
            }
        };
        let options = match &export.options_raw {
            Some(raw) => match self.resolve_params(raw, export.span) {
                Ok(o) => o,
                Err(e) => {
                    self.errors.push(e);
                    return;
                }
            },
            None => IndexMap::new(),
        };
        let uri = match self.subs.substitute_plain(&export.destination_uri, &self.vars, export.span)
        {
            Ok(u) => u,
            Err(e) => {
                self.errors.push(e);
                return;
            }
        };

        let id = self.next_id("export", &export.connector_type);
        let idx = self.push_op(Operation {
            id,
            outputs: Vec::new(),
            depends_on: Vec::new(),
            payload: OpPayload::Export {
                sql: sql.clone(),
                destination_uri: uri,
                connector_type: export.connector_type.clone(),
                options,
                mode: export.mode.clone(),
            },
            span: export.span,
        });
        self.link_consumed_tables(&sql, idx, export.span);
    }

    /// Kahn's algorithm with deterministic tie-break by declaration order.
    /// On a cycle, every node of each offending strongly-connected
    /// component is reported.
    fn topo_order(&self) -> Result<Vec<usize>> {
        let n = self.ops.len();
        let mut indegree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(from, to) in &self.edge_set {
            adj[from].push(to);
            indegree[to] += 1;
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(next);
            for &to in &adj[next] {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.insert(to);
                }
            }
        }

        if order.len() == n {
            return Ok(order);
        }

        // Leftover nodes form at least one cycle; report full SCCs.
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let idx: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(i)).collect();
        for &(from, to) in &self.edge_set {
            graph.add_edge(idx[from], idx[to], ());
        }
        let mut nodes: Vec<String> = petgraph::algo::tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .flatten()
            .map(|ni| self.ops[graph[ni]].id.clone())
            .collect();
        nodes.sort();
        Err(SqlFlowError::CyclicDependency { nodes })
    }

    fn finish(mut self) -> Result<Plan> {
        let order = match self.topo_order() {
            Ok(order) => order,
            Err(e) => {
                self.errors.push(e);
                return Err(SqlFlowError::from_batch(self.errors));
            }
        };
        if !self.errors.is_empty() {
            return Err(SqlFlowError::from_batch(self.errors));
        }

        // Materialize depends_on from the edge set before reordering.
        for &(from, to) in &self.edge_set {
            let from_id = self.ops[from].id.clone();
            self.ops[to].depends_on.push(from_id);
        }
        let edges: Vec<(String, String)> = self
            .edge_set
            .iter()
            .map(|&(f, t)| (self.ops[f].id.clone(), self.ops[t].id.clone()))
            .collect();

        let mut by_order = Vec::with_capacity(order.len());
        for i in order {
            by_order.push(self.ops[i].clone());
        }

        debug!(
            operations = by_order.len(),
            edges = edges.len(),
            "plan built"
        );
        Ok(Plan {
            pipeline: self.pipeline,
            operations: by_order,
            edges,
        })
    }
}

/// Builds the execution plan for a flattened pipeline.
///
/// `preexisting` is the set of table names already present in the engine
/// catalog; a referenced table that is neither pre-existing nor produced by
/// a planned operation is an `UnknownTable` error. A producer behind an
/// untaken IF branch does not count.
pub fn build_plan(
    pipeline: &str,
    steps: &[Step],
    subs: &Substitutor,
    vars: VarContext,
    _profile: &Profile,
    preexisting: &HashSet<String>,
) -> Result<Plan> {
    let mut builder = PlanBuilder {
        pipeline: pipeline.to_string(),
        subs,
        vars,
        preexisting: preexisting.iter().map(|s| s.to_ascii_lowercase()).collect(),
        sources: HashMap::new(),
        producers: HashMap::new(),
        ops: Vec::new(),
        edge_set: BTreeSet::new(),
        errors: Vec::new(),
        seq: 0,
    };
    builder.walk(steps);
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_join_and_udf() {
        let refs = extract_table_refs(
            "SELECT * FROM Orders o JOIN customers c ON o.id = c.id, UDF_CALL(\"mod.fn\", raw, 'x')",
        );
        assert_eq!(refs, vec!["orders", "customers", "raw"]);
    }

    #[test]
    fn test_table_functions_are_skipped() {
        let refs = extract_table_refs("SELECT * FROM generate_series(1, 10)");
        assert!(refs.is_empty());
    }

    #[test]
    fn test_subquery_has_no_false_positive() {
        let refs = extract_table_refs("SELECT * FROM (SELECT 1) t");
        assert!(refs.is_empty());
    }
}
