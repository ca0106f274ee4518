//! PostgreSQL connector.
//!
//! Reads tables as Arrow batches through sqlx and writes with the
//! database realization of stage-and-swap: rows land in a uniquely named
//! stage table first, then a single transaction moves them into the
//! target (TRUNCATE+INSERT, INSERT, or DELETE+INSERT keyed merge). The
//! stage is dropped on success and left in place on failure for
//! inspection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use datafusion::arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int32Array, Int64Array,
    LargeStringArray, StringArray, TimestampMicrosecondArray,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;
use indexmap::IndexMap;
use nanoid::nanoid;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, warn};
use url::Url;

use super::{
    require_param, BatchStream, Capabilities, Connector, ConnectorKind, ReadOptions, WriteMode,
    WriteReport,
};
use crate::errors::{ConnectorErrorKind, Result, SqlFlowError};
use crate::state::TypedValue;
use crate::utils::arrow_ext;

const INSERT_CHUNK_ROWS: usize = 500;

pub struct PostgresConnector {
    pool: PgPool,
    host: String,
}

pub fn from_params(params: &IndexMap<String, String>) -> Result<Arc<dyn Connector>> {
    let dsn = require_param(params, "dsn", "postgres")?;
    let host = Url::parse(dsn)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_lazy(dsn)?;
    Ok(Arc::new(PostgresConnector { pool, host }))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column shapes we bridge between Postgres and Arrow. Numeric and exotic
/// types are cast to double precision / text in the generated SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColType {
    Int2,
    Int4,
    Int8,
    Float,
    Bool,
    Text,
    Timestamp,
    TimestampTz,
    Date,
}

impl ColType {
    fn from_pg(data_type: &str) -> (Self, bool) {
        // The bool marks columns needing an explicit cast in the SELECT.
        match data_type {
            "smallint" => (ColType::Int2, false),
            "integer" => (ColType::Int4, false),
            "bigint" => (ColType::Int8, false),
            "real" | "double precision" => (ColType::Float, false),
            "numeric" => (ColType::Float, true),
            "boolean" => (ColType::Bool, false),
            "text" | "character varying" | "character" => (ColType::Text, false),
            "timestamp without time zone" => (ColType::Timestamp, false),
            "timestamp with time zone" => (ColType::TimestampTz, false),
            "date" => (ColType::Date, false),
            _ => (ColType::Text, true),
        }
    }

    fn arrow_type(&self) -> DataType {
        match self {
            ColType::Int2 | ColType::Int4 => DataType::Int32,
            ColType::Int8 => DataType::Int64,
            ColType::Float => DataType::Float64,
            ColType::Bool => DataType::Boolean,
            ColType::Text => DataType::Utf8,
            ColType::Timestamp | ColType::TimestampTz => {
                DataType::Timestamp(TimeUnit::Microsecond, None)
            }
            ColType::Date => DataType::Date32,
        }
    }
}

/// Column buffers accumulated while draining rows.
enum ColBuf {
    Int32(Vec<Option<i32>>),
    Int64(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    Text(Vec<Option<String>>),
    TimestampMicros(Vec<Option<i64>>),
    Date32(Vec<Option<i32>>),
}

impl ColBuf {
    fn new(ty: ColType) -> Self {
        match ty {
            ColType::Int2 | ColType::Int4 => ColBuf::Int32(Vec::new()),
            ColType::Int8 => ColBuf::Int64(Vec::new()),
            ColType::Float => ColBuf::Float(Vec::new()),
            ColType::Bool => ColBuf::Bool(Vec::new()),
            ColType::Text => ColBuf::Text(Vec::new()),
            ColType::Timestamp | ColType::TimestampTz => ColBuf::TimestampMicros(Vec::new()),
            ColType::Date => ColBuf::Date32(Vec::new()),
        }
    }

    fn push(&mut self, row: &PgRow, idx: usize, ty: ColType) -> Result<()> {
        match self {
            ColBuf::Int32(buf) => {
                let v: Option<i32> = match ty {
                    ColType::Int2 => row.try_get::<Option<i16>, _>(idx)?.map(i32::from),
                    _ => row.try_get(idx)?,
                };
                buf.push(v);
            }
            ColBuf::Int64(buf) => buf.push(row.try_get(idx)?),
            ColBuf::Float(buf) => buf.push(row.try_get(idx)?),
            ColBuf::Bool(buf) => buf.push(row.try_get(idx)?),
            ColBuf::Text(buf) => buf.push(row.try_get(idx)?),
            ColBuf::TimestampMicros(buf) => {
                let v = match ty {
                    ColType::TimestampTz => row
                        .try_get::<Option<DateTime<Utc>>, _>(idx)?
                        .map(|t| t.timestamp_micros()),
                    _ => row
                        .try_get::<Option<NaiveDateTime>, _>(idx)?
                        .map(|t| t.and_utc().timestamp_micros()),
                };
                buf.push(v);
            }
            ColBuf::Date32(buf) => {
                let v = row.try_get::<Option<NaiveDate>, _>(idx)?.map(|d| {
                    (d - NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch")).num_days() as i32
                });
                buf.push(v);
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        match self {
            ColBuf::Int32(b) => b.len(),
            ColBuf::Int64(b) => b.len(),
            ColBuf::Float(b) => b.len(),
            ColBuf::Bool(b) => b.len(),
            ColBuf::Text(b) => b.len(),
            ColBuf::TimestampMicros(b) => b.len(),
            ColBuf::Date32(b) => b.len(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColBuf::Int32(b) => Arc::new(Int32Array::from(std::mem::take(b))),
            ColBuf::Int64(b) => Arc::new(Int64Array::from(std::mem::take(b))),
            ColBuf::Float(b) => Arc::new(Float64Array::from(std::mem::take(b))),
            ColBuf::Bool(b) => Arc::new(BooleanArray::from(std::mem::take(b))),
            ColBuf::Text(b) => Arc::new(StringArray::from(std::mem::take(b))),
            ColBuf::TimestampMicros(b) => {
                Arc::new(TimestampMicrosecondArray::from(std::mem::take(b)))
            }
            ColBuf::Date32(b) => Arc::new(Date32Array::from(std::mem::take(b))),
        }
    }
}

/// Arrow field to a Postgres column type for CREATE TABLE.
fn pg_type_for(dt: &DataType) -> &'static str {
    match dt {
        DataType::Int8 | DataType::Int16 | DataType::Int32 => "INTEGER",
        DataType::Int64 => "BIGINT",
        DataType::Float32 | DataType::Float64 => "DOUBLE PRECISION",
        DataType::Boolean => "BOOLEAN",
        DataType::Timestamp(_, _) => "TIMESTAMP",
        DataType::Date32 | DataType::Date64 => "DATE",
        _ => "TEXT",
    }
}

impl PostgresConnector {
    fn err(&self, kind: ConnectorErrorKind, message: String) -> SqlFlowError {
        SqlFlowError::Connector {
            connector: "postgres".into(),
            kind,
            message,
        }
    }

    async fn columns_of(&self, object: &str) -> Result<Vec<(String, ColType, bool)>> {
        let rows = sqlx::query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = $1 ORDER BY ordinal_position",
        )
        .bind(object)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(self.err(
                ConnectorErrorKind::Permanent,
                format!("table '{object}' does not exist"),
            ));
        }

        rows.into_iter()
            .map(|row| {
                let name: String = row.try_get(0)?;
                let pg_type: String = row.try_get(1)?;
                let (ty, needs_cast) = ColType::from_pg(&pg_type);
                Ok((name, ty, needs_cast))
            })
            .collect()
    }

    fn select_sql(
        &self,
        object: &str,
        columns: &[(String, ColType, bool)],
        where_clause: Option<&str>,
    ) -> String {
        let list = columns
            .iter()
            .map(|(name, ty, needs_cast)| {
                if *needs_cast {
                    let target = match ty {
                        ColType::Float => "double precision",
                        _ => "text",
                    };
                    format!("CAST({} AS {target}) AS {}", quote_ident(name), quote_ident(name))
                } else {
                    quote_ident(name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        match where_clause {
            Some(clause) => format!("SELECT {list} FROM {} WHERE {clause}", quote_ident(object)),
            None => format!("SELECT {list} FROM {}", quote_ident(object)),
        }
    }

    fn arrow_schema(&self, columns: &[(String, ColType, bool)]) -> SchemaRef {
        Arc::new(Schema::new(
            columns
                .iter()
                .map(|(name, ty, _)| Field::new(name, ty.arrow_type(), true))
                .collect::<Vec<_>>(),
        ))
    }

    fn rows_to_batches(
        &self,
        rows: Vec<PgRow>,
        columns: &[(String, ColType, bool)],
        batch_size: usize,
    ) -> Result<Vec<RecordBatch>> {
        let schema = self.arrow_schema(columns);
        let mut bufs: Vec<ColBuf> = columns.iter().map(|(_, ty, _)| ColBuf::new(*ty)).collect();
        let mut batches = Vec::new();
        let chunk = batch_size.max(1);

        for row in &rows {
            for (idx, (_, ty, _)) in columns.iter().enumerate() {
                bufs[idx].push(row, idx, *ty)?;
            }
            if bufs[0].len() >= chunk {
                let arrays: Vec<ArrayRef> = bufs.iter_mut().map(|b| b.finish()).collect();
                batches.push(RecordBatch::try_new(schema.clone(), arrays)?);
            }
        }
        if bufs.first().map(|b| b.len() > 0).unwrap_or(false) {
            let arrays: Vec<ArrayRef> = bufs.iter_mut().map(|b| b.finish()).collect();
            batches.push(RecordBatch::try_new(schema.clone(), arrays)?);
        }
        Ok(batches)
    }

    fn push_cell(
        builder: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
        batch: &RecordBatch,
        row: usize,
        col: usize,
    ) -> Result<()> {
        let array = batch.column(col);
        if array.is_null(row) {
            builder.push_bind(Option::<String>::None);
            return Ok(());
        }
        match array.data_type() {
            DataType::Int32 => {
                let a = array.as_any().downcast_ref::<Int32Array>().expect("int32");
                builder.push_bind(a.value(row));
            }
            DataType::Int64 => {
                let a = array.as_any().downcast_ref::<Int64Array>().expect("int64");
                builder.push_bind(a.value(row));
            }
            DataType::Float64 => {
                let a = array.as_any().downcast_ref::<Float64Array>().expect("f64");
                builder.push_bind(a.value(row));
            }
            DataType::Boolean => {
                let a = array.as_any().downcast_ref::<BooleanArray>().expect("bool");
                builder.push_bind(a.value(row));
            }
            DataType::Utf8 => {
                let a = array.as_any().downcast_ref::<StringArray>().expect("utf8");
                builder.push_bind(a.value(row).to_string());
            }
            DataType::LargeUtf8 => {
                let a = array
                    .as_any()
                    .downcast_ref::<LargeStringArray>()
                    .expect("large-utf8");
                builder.push_bind(a.value(row).to_string());
            }
            DataType::Timestamp(TimeUnit::Microsecond, _) => {
                let a = array
                    .as_any()
                    .downcast_ref::<TimestampMicrosecondArray>()
                    .expect("ts");
                let ts = DateTime::from_timestamp_micros(a.value(row)).ok_or_else(|| {
                    SqlFlowError::Watermark("timestamp out of range".into())
                })?;
                builder.push_bind(ts.naive_utc());
            }
            DataType::Date32 => {
                let a = array.as_any().downcast_ref::<Date32Array>().expect("date");
                let date = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch")
                    + chrono::Days::new(a.value(row).max(0) as u64);
                builder.push_bind(date);
            }
            other => {
                return Err(SqlFlowError::Connector {
                    connector: "postgres".into(),
                    kind: ConnectorErrorKind::Permanent,
                    message: format!("cannot bind arrow type {other} into postgres"),
                })
            }
        }
        Ok(())
    }

    async fn target_exists(&self, object: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT count(*) AS n FROM information_schema.tables WHERE table_name = $1",
        )
        .bind(object)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get(0)?;
        Ok(n > 0)
    }

    async fn create_table_like(&self, name: &str, schema: &SchemaRef) -> Result<()> {
        let cols = schema
            .fields()
            .iter()
            .map(|f| format!("{} {}", quote_ident(f.name()), pg_type_for(f.data_type())))
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("CREATE TABLE {} ({cols})", quote_ident(name)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn type_name(&self) -> &'static str {
        "postgres"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Database
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            readable: true,
            incrementally_readable: true,
            writable: true,
            discoverable: true,
        }
    }

    fn host_key(&self) -> String {
        self.host.clone()
    }

    async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| Ok(r.try_get::<String, _>(0)?))
            .collect()
    }

    async fn get_schema(&self, object: &str) -> Result<SchemaRef> {
        let columns = self.columns_of(object).await?;
        Ok(self.arrow_schema(&columns))
    }

    async fn read(&self, object: &str, options: &ReadOptions) -> Result<BatchStream> {
        let columns = self.columns_of(object).await?;
        let sql = self.select_sql(object, &columns, None);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let batches = self.rows_to_batches(rows, &columns, options.batch_size)?;
        Ok(Box::pin(futures::stream::iter(batches.into_iter().map(Ok))))
    }

    async fn read_incremental(
        &self,
        object: &str,
        cursor_field: &str,
        last_value: Option<&TypedValue>,
        options: &ReadOptions,
    ) -> Result<BatchStream> {
        let columns = self.columns_of(object).await?;
        let cursor = quote_ident(cursor_field);

        let rows = match last_value {
            None => {
                // NULL cursors are filtered at the source per contract.
                let clause = format!("{cursor} IS NOT NULL ORDER BY {cursor}");
                let sql = self.select_sql(object, &columns, Some(&clause));
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
            Some(value) => {
                let clause = format!("{cursor} > $1 AND {cursor} IS NOT NULL ORDER BY {cursor}");
                let sql = self.select_sql(object, &columns, Some(&clause));
                let query = sqlx::query(&sql);
                let query = match value {
                    TypedValue::Integer { value_int } => query.bind(*value_int),
                    TypedValue::Text { value_str } => query.bind(value_str.clone()),
                    TypedValue::Timestamp { value_ts } => query.bind(value_ts.naive_utc()),
                };
                query.fetch_all(&self.pool).await?
            }
        };
        let batches = self.rows_to_batches(rows, &columns, options.batch_size)?;
        Ok(Box::pin(futures::stream::iter(batches.into_iter().map(Ok))))
    }

    async fn write(
        &self,
        object: &str,
        batches: Vec<RecordBatch>,
        mode: &WriteMode,
    ) -> Result<WriteReport> {
        let rows = arrow_ext::row_count(&batches);
        let Some(schema) = batches.first().map(|b| b.schema()) else {
            return Ok(WriteReport {
                rows: 0,
                destination: object.to_string(),
            });
        };

        if !self.target_exists(object).await? {
            if matches!(mode, WriteMode::Upsert { .. }) {
                return Err(self.err(
                    ConnectorErrorKind::Permanent,
                    format!("UPSERT target '{object}' does not exist"),
                ));
            }
            self.create_table_like(object, &schema).await?;
        }

        // Stage: uniquely named staging table so pooled connections agree
        // on what they see.
        let stage = format!(
            "{object}__stage_{}",
            nanoid!(6, &"abcdefghijklmnopqrstuvwxyz0123456789".chars().collect::<Vec<_>>())
        );
        sqlx::query(&format!(
            "CREATE TABLE {} AS TABLE {} WITH NO DATA",
            quote_ident(&stage),
            quote_ident(object)
        ))
        .execute(&self.pool)
        .await?;

        let staged = self.stage_rows(&stage, &batches).await;
        let swapped = match staged {
            Ok(()) => self.swap(object, &stage, mode).await,
            Err(e) => Err(e),
        };

        match swapped {
            Ok(()) => {
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&stage)))
                    .execute(&self.pool)
                    .await
                    .ok();
                debug!(object, rows, "postgres write committed");
                Ok(WriteReport {
                    rows,
                    destination: object.to_string(),
                })
            }
            Err(e) => {
                // Stage left in place for inspection; the live table is
                // untouched.
                warn!(object, stage, error = %e, "postgres write failed before swap commit");
                Err(e)
            }
        }
    }
}

impl PostgresConnector {
    async fn stage_rows(&self, stage: &str, batches: &[RecordBatch]) -> Result<()> {
        for batch in batches {
            let schema = batch.schema();
            let columns = schema
                .fields()
                .iter()
                .map(|f| quote_ident(f.name()))
                .collect::<Vec<_>>()
                .join(", ");

            for chunk_start in (0..batch.num_rows()).step_by(INSERT_CHUNK_ROWS) {
                let chunk_end = (chunk_start + INSERT_CHUNK_ROWS).min(batch.num_rows());
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                    "INSERT INTO {} ({columns}) ",
                    quote_ident(stage)
                ));
                // The push_values closure cannot return Result; capture
                // the first bind failure and surface it before executing.
                let mut bind_err: Option<SqlFlowError> = None;
                builder.push_values(chunk_start..chunk_end, |mut b, row| {
                    for col in 0..batch.num_columns() {
                        if bind_err.is_some() {
                            return;
                        }
                        if let Err(e) = Self::push_cell(&mut b, batch, row, col) {
                            bind_err = Some(e);
                        }
                    }
                });
                if let Some(e) = bind_err {
                    return Err(e);
                }
                builder.build().execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    async fn swap(&self, object: &str, stage: &str, mode: &WriteMode) -> Result<()> {
        let target = quote_ident(object);
        let stage_q = quote_ident(stage);
        let mut tx = self.pool.begin().await?;

        match mode {
            WriteMode::Replace => {
                sqlx::query(&format!("TRUNCATE {target}"))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&format!("INSERT INTO {target} SELECT * FROM {stage_q}"))
                    .execute(&mut *tx)
                    .await?;
            }
            WriteMode::Append => {
                sqlx::query(&format!("INSERT INTO {target} SELECT * FROM {stage_q}"))
                    .execute(&mut *tx)
                    .await?;
            }
            WriteMode::Upsert { keys } => {
                let on = keys
                    .iter()
                    .map(|k| format!("{target}.{0} = {stage_q}.{0}", quote_ident(k)))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                sqlx::query(&format!("DELETE FROM {target} USING {stage_q} WHERE {on}"))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&format!("INSERT INTO {target} SELECT * FROM {stage_q}"))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await.map_err(|e| SqlFlowError::SwapFailed {
            target: object.to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_pg_type_mapping() {
        assert_eq!(pg_type_for(&DataType::Int64), "BIGINT");
        assert_eq!(pg_type_for(&DataType::Utf8), "TEXT");
        assert_eq!(
            pg_type_for(&DataType::Timestamp(TimeUnit::Microsecond, None)),
            "TIMESTAMP"
        );
    }

    #[test]
    fn test_coltype_from_pg() {
        assert_eq!(ColType::from_pg("bigint"), (ColType::Int8, false));
        assert_eq!(ColType::from_pg("numeric"), (ColType::Float, true));
        assert_eq!(ColType::from_pg("uuid"), (ColType::Text, true));
    }
}
