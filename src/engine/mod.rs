//! Embedded SQL engine adapter.
//!
//! Thin wrapper over a DataFusion `SessionContext`. Tables are in-memory
//! `MemTable`s in the session catalog; the executor is the only writer.
//! "Atomic" in-engine writes are realized by computing the full new table
//! contents first and then swapping the catalog registration in one step,
//! so readers either see the old table or the new one, never a partial
//! state.

use std::sync::Arc;

use datafusion::arrow::datatypes::{Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::ScalarValue;
use datafusion::datasource::MemTable;
use datafusion::logical_expr::ScalarUDF;
use datafusion::prelude::{SessionConfig, SessionContext};
use regex::Regex;

use crate::errors::Result;

pub mod udf;

pub use udf::UdfRegistry;

/// Time macros recognized in INCREMENTAL queries. They are rewritten to
/// named placeholders and bound as parameters, never interpolated.
const TIME_MACROS: [&str; 4] = ["start_dt", "end_dt", "start_date", "end_date"];

/// Rewrites `@start_dt` / `@end_dt` / `@start_date` / `@end_date` into
/// `$start_dt`-style named placeholders for parameterized execution.
pub fn rewrite_time_macros(sql: &str) -> String {
    let re = Regex::new(r"@(start_dt|end_dt|start_date|end_date)\b").expect("static regex");
    re.replace_all(sql, "$$$1").into_owned()
}

/// Returns true when the query uses any time macro.
pub fn uses_time_macros(sql: &str) -> bool {
    TIME_MACROS.iter().any(|m| sql.contains(&format!("@{m}")))
}

pub struct SqlEngine {
    ctx: SessionContext,
    udfs: UdfRegistry,
}

impl Default for SqlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlEngine {
    pub fn new() -> Self {
        let config = SessionConfig::new().with_information_schema(true);
        Self {
            ctx: SessionContext::new_with_config(config),
            udfs: UdfRegistry::new(),
        }
    }

    pub fn udfs(&self) -> &UdfRegistry {
        &self.udfs
    }

    /// Registers a scalar UDF directly with the engine; invocations expand
    /// inline inside queries.
    pub fn register_scalar_udf(&self, udf: ScalarUDF) {
        self.ctx.register_udf(udf);
    }

    /// Runs a query and collects its result.
    pub async fn query(&self, sql: &str) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let df = self.ctx.sql(sql).await?;
        let schema: SchemaRef = Arc::new(Schema::from(df.schema()));
        let batches = df.collect().await?;
        Ok((schema, batches))
    }

    /// Runs a query with named `$param` placeholders bound to values.
    pub async fn query_with_params(
        &self,
        sql: &str,
        params: Vec<(String, ScalarValue)>,
    ) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let df = self.ctx.sql(sql).await?;
        let bound: Vec<(&str, ScalarValue)> =
            params.iter().map(|(n, v)| (n.as_str(), v.clone())).collect();
        let df = df.with_param_values(bound)?;
        let schema: SchemaRef = Arc::new(Schema::from(df.schema()));
        let batches = df.collect().await?;
        Ok((schema, batches))
    }

    /// Registers (or swaps) a table under `name`. This is the commit point
    /// of every in-engine write.
    pub fn register(&self, name: &str, schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<()> {
        let name = normalize(name);
        let table = MemTable::try_new(schema, vec![batches])?;
        self.ctx.deregister_table(name.as_str())?;
        self.ctx.register_table(name.as_str(), Arc::new(table))?;
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.ctx.deregister_table(normalize(name).as_str())?;
        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.ctx.table_exist(normalize(name).as_str())?)
    }

    /// Current contents of a table.
    pub async fn table_batches(&self, name: &str) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let df = self.ctx.table(normalize(name).as_str()).await?;
        let schema: SchemaRef = Arc::new(Schema::from(df.schema()));
        let batches = df.collect().await?;
        Ok((schema, batches))
    }

    /// Schema snapshot of a catalog table.
    pub async fn schema_of(&self, name: &str) -> Result<SchemaRef> {
        let provider = self.ctx.table_provider(normalize(name).as_str()).await?;
        Ok(provider.schema())
    }

    /// All table names in the default catalog/schema.
    pub fn table_names(&self) -> Vec<String> {
        self.ctx
            .catalog("datafusion")
            .and_then(|c| c.schema("public"))
            .map(|s| s.table_names())
            .unwrap_or_default()
    }

    /// Expands table-valued UDF call sites in `sql` via the external
    /// processing pattern: fetch the consumed table, run the registered
    /// handler, re-register the result, rewrite the call site to the
    /// result's name.
    pub async fn expand_table_udfs(&self, sql: &str) -> Result<String> {
        udf::expand_table_udfs(self, sql).await
    }
}

/// Catalog identifiers are case-insensitive; we normalize to lowercase on
/// every boundary.
pub fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}
