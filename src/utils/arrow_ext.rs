//! Arrow helpers shared by the executors and connectors: batch
//! concatenation, schema alignment, cursor-value extraction and CSV
//! (de)serialization for file-shaped destinations.

use std::io::Cursor;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use datafusion::arrow::array::{
    new_null_array, Array, ArrayRef, Date32Array, Int32Array, Int64Array, StringArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use datafusion::arrow::compute;
use datafusion::arrow::csv as arrow_csv;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::arrow::record_batch::RecordBatch;

use crate::errors::{Result, SqlFlowError};
use crate::state::TypedValue;

pub fn row_count(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|b| b.num_rows()).sum()
}

/// Concatenates batches into one; the bulk columnar path.
pub fn concat_all(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<RecordBatch> {
    Ok(compute::concat_batches(schema, batches)?)
}

fn column_index(schema: &SchemaRef, name: &str) -> Option<usize> {
    schema
        .fields()
        .iter()
        .position(|f| f.name().eq_ignore_ascii_case(name))
}

fn ts_to_datetime(secs: i64, nanos: u32) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| SqlFlowError::Watermark(format!("timestamp out of range: {secs}s")))
}

/// Maximum value of `column` across the batches, as a typed cursor value.
/// NULLs are skipped. Returns `None` when every row is NULL or there are
/// no rows. Non-monotonic-friendly types (floats) are rejected.
pub fn max_cursor_value(batches: &[RecordBatch], column: &str) -> Result<Option<TypedValue>> {
    let mut best: Option<TypedValue> = None;

    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let idx = column_index(&batch.schema(), column).ok_or_else(|| {
            SqlFlowError::Watermark(format!("cursor column '{column}' missing from result"))
        })?;
        let array = batch.column(idx);
        let candidate = max_of_array(array, column)?;
        if let Some(candidate) = candidate {
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    match candidate.partial_cmp_typed(&current) {
                        Some(std::cmp::Ordering::Greater) => Some(candidate),
                        _ => Some(current),
                    }
                }
            };
        }
    }
    Ok(best)
}

fn max_of_array(array: &ArrayRef, column: &str) -> Result<Option<TypedValue>> {
    let value = match array.data_type() {
        DataType::Int64 => {
            let a = array.as_any().downcast_ref::<Int64Array>().expect("int64");
            compute::max(a).map(|v| TypedValue::Integer { value_int: v })
        }
        DataType::Int32 => {
            let a = array.as_any().downcast_ref::<Int32Array>().expect("int32");
            compute::max(a).map(|v| TypedValue::Integer {
                value_int: v as i64,
            })
        }
        DataType::Utf8 => {
            let a = array.as_any().downcast_ref::<StringArray>().expect("utf8");
            compute::max_string(a).map(|v| TypedValue::Text {
                value_str: v.to_string(),
            })
        }
        DataType::Date32 => {
            let a = array.as_any().downcast_ref::<Date32Array>().expect("date32");
            match compute::max(a) {
                Some(days) => Some(TypedValue::Timestamp {
                    value_ts: ts_to_datetime(days as i64 * 86_400, 0)?,
                }),
                None => None,
            }
        }
        DataType::Timestamp(unit, _) => {
            let raw = match unit {
                TimeUnit::Second => compute::max(
                    array
                        .as_any()
                        .downcast_ref::<TimestampSecondArray>()
                        .expect("ts-s"),
                ),
                TimeUnit::Millisecond => compute::max(
                    array
                        .as_any()
                        .downcast_ref::<TimestampMillisecondArray>()
                        .expect("ts-ms"),
                ),
                TimeUnit::Microsecond => compute::max(
                    array
                        .as_any()
                        .downcast_ref::<TimestampMicrosecondArray>()
                        .expect("ts-us"),
                ),
                TimeUnit::Nanosecond => compute::max(
                    array
                        .as_any()
                        .downcast_ref::<TimestampNanosecondArray>()
                        .expect("ts-ns"),
                ),
            };
            match raw {
                Some(v) => {
                    let (secs, nanos) = match unit {
                        TimeUnit::Second => (v, 0u32),
                        TimeUnit::Millisecond => (
                            v.div_euclid(1_000),
                            (v.rem_euclid(1_000) * 1_000_000) as u32,
                        ),
                        TimeUnit::Microsecond => {
                            (v.div_euclid(1_000_000), (v.rem_euclid(1_000_000) * 1_000) as u32)
                        }
                        TimeUnit::Nanosecond => {
                            (v.div_euclid(1_000_000_000), v.rem_euclid(1_000_000_000) as u32)
                        }
                    };
                    Some(TypedValue::Timestamp {
                        value_ts: ts_to_datetime(secs, nanos)?,
                    })
                }
                None => None,
            }
        }
        other => {
            return Err(SqlFlowError::Watermark(format!(
                "cursor column '{column}' has non-monotonic-safe type {other}"
            )))
        }
    };
    Ok(value)
}

/// Conforms a batch to `target`: columns matched by name
/// (case-insensitive) are cast to the target type, absent columns become
/// all-NULL.
pub fn align_to_schema(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let rows = batch.num_rows();
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(target.fields().len());

    for field in target.fields() {
        match column_index(&batch.schema(), field.name()) {
            Some(idx) => {
                let source = batch.column(idx);
                if source.data_type() == field.data_type() {
                    arrays.push(source.clone());
                } else {
                    arrays.push(compute::cast(source, field.data_type())?);
                }
            }
            None => arrays.push(new_null_array(field.data_type(), rows)),
        }
    }
    Ok(RecordBatch::try_new(target.clone(), arrays)?)
}

/// `VALUES (...)` staging comes back with generated `column1..columnN`
/// names. When the arity matches the target, adopt the target's names
/// positionally so the usual by-name alignment applies.
pub fn adopt_target_names(batches: Vec<RecordBatch>, target: &SchemaRef) -> Result<Vec<RecordBatch>> {
    let Some(first) = batches.first() else {
        return Ok(batches);
    };
    let schema = first.schema();
    let generated = schema.fields().len() == target.fields().len()
        && schema.fields().iter().enumerate().all(|(i, f)| {
            let name = f.name().to_ascii_lowercase();
            name == format!("column{}", i + 1)
        });
    if !generated {
        return Ok(batches);
    }

    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .zip(target.fields())
        .map(|(src, dst)| {
            Field::new(dst.name(), src.data_type().clone(), src.is_nullable())
        })
        .collect();
    let renamed = Arc::new(Schema::new(fields));
    batches
        .into_iter()
        .map(|b| Ok(RecordBatch::try_new(renamed.clone(), b.columns().to_vec())?))
        .collect()
}

/// Keeps rows where `column > value`. Rows with a NULL cursor are dropped;
/// a NULL cannot order against the watermark and would stall progress.
pub fn filter_greater_than(
    batch: &RecordBatch,
    column: &str,
    value: &TypedValue,
) -> Result<RecordBatch> {
    let idx = column_index(&batch.schema(), column).ok_or_else(|| {
        SqlFlowError::Watermark(format!("cursor column '{column}' missing from batch"))
    })?;
    let col = batch.column(idx);

    let scalar_arr: ArrayRef = match value {
        TypedValue::Integer { value_int } => Arc::new(Int64Array::from(vec![*value_int])),
        TypedValue::Text { value_str } => Arc::new(StringArray::from(vec![value_str.clone()])),
        TypedValue::Timestamp { value_ts } => Arc::new(TimestampMicrosecondArray::from(vec![
            value_ts.timestamp_micros(),
        ])),
    };
    let scalar_arr = if scalar_arr.data_type() == col.data_type() {
        scalar_arr
    } else {
        compute::cast(&scalar_arr, col.data_type())?
    };
    let scalar = datafusion::arrow::array::Scalar::new(scalar_arr);

    let mask = compute::kernels::cmp::gt(col, &scalar)?;
    Ok(compute::filter_record_batch(batch, &mask)?)
}

/// Serializes batches to CSV with a header row.
pub fn batches_to_csv(batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = arrow_csv::WriterBuilder::new()
            .with_header(true)
            .build(&mut buf);
        for batch in batches {
            writer.write(batch)?;
        }
    }
    Ok(buf)
}

/// Parses CSV bytes (header row expected), inferring the schema.
pub fn csv_to_batches(bytes: &[u8], batch_size: usize) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let format = arrow_csv::reader::Format::default().with_header(true);
    let (schema, _) = format.infer_schema(Cursor::new(bytes), None)?;
    let schema = Arc::new(schema);

    let reader = arrow_csv::ReaderBuilder::new(schema.clone())
        .with_format(arrow_csv::reader::Format::default().with_header(true))
        .with_batch_size(batch_size)
        .build(Cursor::new(bytes))?;
    let batches: std::result::Result<Vec<_>, _> = reader.collect();
    Ok((schema, batches?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Int64Array, StringArray};

    fn batch(ints: &[i64], strs: &[&str]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("n", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ints.to_vec())),
                Arc::new(StringArray::from(strs.to_vec())),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_max_cursor_value_int() {
        let b = batch(&[3, 9, 1], &["a", "b", "c"]);
        let max = max_cursor_value(&[b], "n").unwrap().unwrap();
        assert_eq!(max, TypedValue::Integer { value_int: 9 });
    }

    #[test]
    fn test_max_cursor_value_case_insensitive() {
        let b = batch(&[1], &["z"]);
        let max = max_cursor_value(&[b], "S").unwrap().unwrap();
        assert_eq!(
            max,
            TypedValue::Text {
                value_str: "z".into()
            }
        );
    }

    #[test]
    fn test_align_adds_null_column() {
        let b = batch(&[1, 2], &["a", "b"]);
        let target = Arc::new(Schema::new(vec![
            Field::new("n", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
            Field::new("extra", DataType::Utf8, true),
        ]));
        let aligned = align_to_schema(&b, &target).unwrap();
        assert_eq!(aligned.num_columns(), 3);
        assert_eq!(aligned.column(2).null_count(), 2);
    }

    #[test]
    fn test_csv_roundtrip() {
        let b = batch(&[1, 2], &["x", "y"]);
        let bytes = batches_to_csv(&[b]).unwrap();
        let (schema, batches) = csv_to_batches(&bytes, 1024).unwrap();
        assert_eq!(schema.fields().len(), 2);
        assert_eq!(row_count(&batches), 2);
    }
}
