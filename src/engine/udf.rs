//! User-defined function registry.
//!
//! Scalar UDFs register straight into DataFusion and expand inline.
//! Table-valued UDFs cannot be invoked inline by the engine, so call sites
//! of the form `UDF_CALL("module.fn", table, ...)` use the external
//! processing pattern: the consumed table's batches are fetched, the
//! registered handler transforms them, the result is re-registered as a
//! catalog table, and the call site is rewritten to reference it.

use std::sync::Arc;

use dashmap::DashMap;
use datafusion::arrow::record_batch::RecordBatch;
use tracing::debug;

use super::SqlEngine;
use crate::errors::{Result, SqlFlowError};

/// Handler for a table-valued UDF: input batches and extra (string)
/// arguments in, output batches out.
pub type TableUdfFn =
    Arc<dyn Fn(Vec<RecordBatch>, &[String]) -> Result<Vec<RecordBatch>> + Send + Sync>;

#[derive(Default)]
pub struct UdfRegistry {
    table_fns: DashMap<String, TableUdfFn>,
}

impl UdfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table-valued UDF under `module.fn`-style name.
    pub fn register_table_fn<F>(&self, name: &str, f: F)
    where
        F: Fn(Vec<RecordBatch>, &[String]) -> Result<Vec<RecordBatch>> + Send + Sync + 'static,
    {
        self.table_fns.insert(name.to_string(), Arc::new(f));
    }

    pub fn get_table_fn(&self, name: &str) -> Option<TableUdfFn> {
        self.table_fns.get(name).map(|f| f.clone())
    }
}

/// One parsed `UDF_CALL(...)` site.
struct CallSite {
    /// Byte range of the whole call in the SQL text.
    start: usize,
    end: usize,
    fn_name: String,
    table: String,
    extra_args: Vec<String>,
}

fn find_call_sites(sql: &str) -> Result<Vec<CallSite>> {
    let upper = sql.to_ascii_uppercase();
    let mut sites = Vec::new();
    let mut search = 0;

    while let Some(rel) = upper[search..].find("UDF_CALL") {
        let start = search + rel;
        let after = start + "UDF_CALL".len();
        let open = match sql[after..].find(|c: char| !c.is_whitespace()) {
            Some(off) if sql.as_bytes()[after + off] == b'(' => after + off,
            _ => {
                search = after;
                continue;
            }
        };

        // Balanced scan for the closing paren, respecting quotes.
        let bytes = sql.as_bytes();
        let mut depth = 0i32;
        let mut in_q: Option<u8> = None;
        let mut end = None;
        let mut i = open;
        while i < bytes.len() {
            let b = bytes[i];
            match in_q {
                Some(q) => {
                    if b == q {
                        in_q = None;
                    }
                }
                None => match b {
                    b'\'' | b'"' => in_q = Some(b),
                    b'(' => depth += 1,
                    b')' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(i + 1);
                            break;
                        }
                    }
                    _ => {}
                },
            }
            i += 1;
        }
        let end = end.ok_or_else(|| {
            SqlFlowError::Pipeline("unbalanced parentheses in UDF_CALL".into())
        })?;

        let args = split_args(&sql[open + 1..end - 1]);
        if args.len() < 2 {
            return Err(SqlFlowError::Pipeline(
                "UDF_CALL requires a function name and a table argument".into(),
            ));
        }
        let fn_name = args[0].trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        let table = args[1].trim().to_ascii_lowercase();
        let extra_args = args[2..]
            .iter()
            .map(|a| a.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .collect();

        sites.push(CallSite {
            start,
            end,
            fn_name,
            table,
            extra_args,
        });
        search = end;
    }

    Ok(sites)
}

fn split_args(inner: &str) -> Vec<String> {
    let bytes = inner.as_bytes();
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut in_q: Option<u8> = None;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        match in_q {
            Some(q) => {
                if b == q {
                    in_q = None;
                }
            }
            None => match b {
                b'\'' | b'"' => in_q = Some(b),
                b'(' => depth += 1,
                b')' => depth -= 1,
                b',' if depth == 0 => {
                    args.push(inner[start..i].to_string());
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    if start < inner.len() {
        args.push(inner[start..].to_string());
    }
    args
}

/// Expands every call site, innermost-last so byte offsets stay valid.
pub async fn expand_table_udfs(engine: &SqlEngine, sql: &str) -> Result<String> {
    let sites = find_call_sites(sql)?;
    if sites.is_empty() {
        return Ok(sql.to_string());
    }

    let mut rewritten = sql.to_string();
    for (n, site) in sites.iter().enumerate().rev() {
        let handler = engine.udfs().get_table_fn(&site.fn_name).ok_or_else(|| {
            SqlFlowError::Pipeline(format!(
                "no table UDF registered under '{}'",
                site.fn_name
            ))
        })?;

        let (schema, batches) = engine.table_batches(&site.table).await?;
        let out = handler(batches, &site.extra_args)?;
        let out_schema = out.first().map(|b| b.schema()).unwrap_or(schema);

        let result_table = format!("__udf_{}_{}", n + 1, site.table);
        engine.register(&result_table, out_schema, out)?;
        debug!(
            udf = %site.fn_name,
            input = %site.table,
            output = %result_table,
            "table UDF expanded"
        );

        rewritten.replace_range(site.start..site.end, &result_table);
    }
    Ok(rewritten)
}
