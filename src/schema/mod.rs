//! Schema evolution policy and load-quality gates.
//!
//! `evolve` is a pure function from (target schema, staging schema) to a
//! widened schema or an incompatibility error. It runs before the swap in
//! every APPEND / UPSERT / MERGE and decides whether the mode proceeds.
//!
//! Widening rules: integers widen to wider integers, Float32 widens to
//! Float64, new staging columns are added as nullable, and nullability
//! itself only widens. Narrowing or changing a column's type class is
//! rejected.

use std::sync::Arc;

use datafusion::arrow::array::Array;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;

use crate::errors::{Result, SqlFlowError};

/// Outcome of a compatible evolution.
#[derive(Debug, Clone)]
pub struct Evolution {
    /// Target columns (types possibly widened) followed by added columns.
    pub schema: SchemaRef,
    pub added: Vec<String>,
    pub widened: Vec<String>,
}

impl Evolution {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.widened.is_empty()
    }
}

fn int_rank(dt: &DataType) -> Option<u8> {
    match dt {
        DataType::Int8 => Some(1),
        DataType::Int16 => Some(2),
        DataType::Int32 => Some(3),
        DataType::Int64 => Some(4),
        _ => None,
    }
}

/// The widened type for a pair, or `None` when the change is incompatible.
fn widen(target: &DataType, staging: &DataType) -> Option<DataType> {
    if target == staging {
        return Some(target.clone());
    }
    if let (Some(t), Some(s)) = (int_rank(target), int_rank(staging)) {
        // Narrowing (staging wider than target) widens the target column;
        // staging narrower than target just casts up.
        return Some(if s > t { staging.clone() } else { target.clone() });
    }
    match (target, staging) {
        (DataType::Float32, DataType::Float64) => Some(DataType::Float64),
        (DataType::Float64, DataType::Float32) => Some(DataType::Float64),
        (DataType::Utf8, DataType::LargeUtf8) | (DataType::LargeUtf8, DataType::Utf8) => {
            Some(DataType::LargeUtf8)
        }
        _ => None,
    }
}

/// Decides compatibility of staging data against an existing target.
pub fn evolve(table: &str, target: &SchemaRef, staging: &SchemaRef) -> Result<Evolution> {
    let mut fields: Vec<Field> = Vec::with_capacity(target.fields().len());
    let mut added = Vec::new();
    let mut widened = Vec::new();

    for tf in target.fields() {
        let sf = staging
            .fields()
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(tf.name()));
        match sf {
            Some(sf) => {
                let Some(wide) = widen(tf.data_type(), sf.data_type()) else {
                    return Err(SqlFlowError::SchemaEvolution {
                        table: table.to_string(),
                        message: format!(
                            "column '{}' cannot change from {} to {}",
                            tf.name(),
                            tf.data_type(),
                            sf.data_type()
                        ),
                    });
                };
                if &wide != tf.data_type() {
                    widened.push(tf.name().clone());
                }
                let nullable = tf.is_nullable() || sf.is_nullable();
                fields.push(Field::new(tf.name(), wide, nullable));
            }
            None => {
                // Absent in staging: its rows become NULL, which a
                // required column cannot absorb.
                if !tf.is_nullable() {
                    return Err(SqlFlowError::SchemaEvolution {
                        table: table.to_string(),
                        message: format!(
                            "required column '{}' is missing from the staged data",
                            tf.name()
                        ),
                    });
                }
                fields.push(tf.as_ref().clone());
            }
        }
    }

    for sf in staging.fields() {
        let known = target
            .fields()
            .iter()
            .any(|f| f.name().eq_ignore_ascii_case(sf.name()));
        if !known {
            added.push(sf.name().clone());
            fields.push(Field::new(sf.name(), sf.data_type().clone(), true));
        }
    }

    Ok(Evolution {
        schema: Arc::new(Schema::new(fields)),
        added,
        widened,
    })
}

/// UPSERT/MERGE quality gate: every declared key must exist in the schema.
pub fn check_keys_present(table: &str, schema: &SchemaRef, keys: &[String]) -> Result<()> {
    for key in keys {
        let present = schema
            .fields()
            .iter()
            .any(|f| f.name().eq_ignore_ascii_case(key));
        if !present {
            return Err(SqlFlowError::SchemaEvolution {
                table: table.to_string(),
                message: format!("declared key column '{key}' does not exist"),
            });
        }
    }
    Ok(())
}

/// MERGE quality gate: key columns must not contain NULLs in the staged
/// rows; a NULL key cannot match anything and silently duplicates.
pub fn check_keys_non_null(table: &str, batches: &[RecordBatch], keys: &[String]) -> Result<()> {
    for batch in batches {
        for key in keys {
            let idx = batch
                .schema()
                .fields()
                .iter()
                .position(|f| f.name().eq_ignore_ascii_case(key));
            if let Some(idx) = idx {
                let nulls = batch.column(idx).null_count();
                if nulls > 0 {
                    return Err(SqlFlowError::SchemaEvolution {
                        table: table.to_string(),
                        message: format!("key column '{key}' contains {nulls} NULL value(s)"),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: &[(&str, DataType, bool)]) -> SchemaRef {
        Arc::new(Schema::new(
            fields
                .iter()
                .map(|(n, dt, null)| Field::new(*n, dt.clone(), *null))
                .collect::<Vec<_>>(),
        ))
    }

    #[test]
    fn test_identical_schema_is_noop() {
        let t = schema(&[("a", DataType::Int64, true)]);
        let e = evolve("t", &t, &t).unwrap();
        assert!(e.is_noop());
    }

    #[test]
    fn test_int_widening() {
        let target = schema(&[("a", DataType::Int32, true)]);
        let staging = schema(&[("a", DataType::Int64, true)]);
        let e = evolve("t", &target, &staging).unwrap();
        assert_eq!(e.widened, vec!["a"]);
        assert_eq!(e.schema.field(0).data_type(), &DataType::Int64);
    }

    #[test]
    fn test_new_column_added_nullable() {
        let target = schema(&[("a", DataType::Int64, true)]);
        let staging = schema(&[
            ("a", DataType::Int64, true),
            ("b", DataType::Utf8, false),
        ]);
        let e = evolve("t", &target, &staging).unwrap();
        assert_eq!(e.added, vec!["b"]);
        assert!(e.schema.field(1).is_nullable());
    }

    #[test]
    fn test_incompatible_change_rejected() {
        let target = schema(&[("a", DataType::Int64, true)]);
        let staging = schema(&[("a", DataType::Boolean, true)]);
        let err = evolve("t", &target, &staging).unwrap_err();
        assert!(matches!(err, SqlFlowError::SchemaEvolution { .. }));
    }

    #[test]
    fn test_missing_required_column_rejected() {
        let target = schema(&[("a", DataType::Int64, false)]);
        let staging = schema(&[("b", DataType::Int64, true)]);
        let err = evolve("t", &target, &staging).unwrap_err();
        assert!(err.to_string().contains("required column 'a'"));
    }

    #[test]
    fn test_keys_present_gate() {
        let s = schema(&[("id", DataType::Int64, false)]);
        assert!(check_keys_present("t", &s, &["id".to_string()]).is_ok());
        assert!(check_keys_present("t", &s, &["nope".to_string()]).is_err());
    }
}
