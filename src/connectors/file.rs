//! Local file connector.
//!
//! Reads CSV and newline-delimited JSON under a root directory and writes
//! with the stage-and-swap protocol: a sibling temp file receives the full
//! payload, then an atomic rename makes it live. APPEND never touches an
//! existing file in place; each run produces a uniquely named file, the
//! idempotent data-lake pattern.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use indexmap::IndexMap;
use nanoid::nanoid;
use serde_json::Value;
use tracing::debug;

use super::{
    require_param, BatchStream, Capabilities, Connector, ConnectorKind, ReadOptions, WriteMode,
    WriteReport,
};
use crate::errors::{ConnectorErrorKind, Result, SqlFlowError};
use crate::state::TypedValue;
use crate::utils::arrow_ext;

pub struct FileConnector {
    root: PathBuf,
    format: FileFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Csv,
    Ndjson,
}

pub fn from_params(params: &IndexMap<String, String>) -> Result<Arc<dyn Connector>> {
    let root = PathBuf::from(require_param(params, "path", "file")?);
    let format = match params.get("format").map(|s| s.as_str()).unwrap_or("csv") {
        "csv" => FileFormat::Csv,
        "ndjson" | "jsonl" => FileFormat::Ndjson,
        other => {
            return Err(SqlFlowError::Config(format!(
                "file connector: unknown format '{other}'"
            )))
        }
    };
    Ok(Arc::new(FileConnector { root, format }))
}

impl FileConnector {
    fn object_path(&self, object: &str) -> PathBuf {
        // `path` may name a single file directly; otherwise it is the
        // (possibly not-yet-created) directory holding the objects.
        if self.root.is_file() {
            self.root.clone()
        } else {
            self.root.join(object)
        }
    }

    fn err(&self, kind: ConnectorErrorKind, message: String) -> SqlFlowError {
        SqlFlowError::Connector {
            connector: "file".into(),
            kind,
            message,
        }
    }

    fn read_batches(
        &self,
        object: &str,
        batch_size: usize,
    ) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let path = self.object_path(object);
        let bytes = std::fs::read(&path).map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                ConnectorErrorKind::Permanent
            } else {
                ConnectorErrorKind::Transient
            };
            self.err(kind, format!("cannot read '{}': {e}", path.display()))
        })?;

        match self.format {
            FileFormat::Csv => arrow_ext::csv_to_batches(&bytes, batch_size.max(1)),
            FileFormat::Ndjson => {
                let values: Vec<Value> = String::from_utf8_lossy(&bytes)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(serde_json::from_str)
                    .collect::<std::result::Result<_, _>>()?;
                if values.is_empty() {
                    return Err(self.err(
                        ConnectorErrorKind::Permanent,
                        format!("'{}' contains no rows", path.display()),
                    ));
                }
                use datafusion::arrow::datatypes::FieldRef;
                use serde_arrow::schema::{SchemaLike, TracingOptions};
                let fields = Vec::<FieldRef>::from_samples(
                    &values,
                    TracingOptions::default()
                        .allow_null_fields(true)
                        .coerce_numbers(true),
                )?;
                let batch = serde_arrow::to_record_batch(&fields, &values)?;
                Ok((batch.schema(), vec![batch]))
            }
        }
    }
}

#[async_trait]
impl Connector for FileConnector {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::File
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
        "local".to_string()
    }

    async fn test_connection(&self) -> Result<()> {
        let probe = if self.root.is_dir() || self.root.is_file() {
            Ok(())
        } else {
            Err(self.err(
                ConnectorErrorKind::Permanent,
                format!("path '{}' does not exist", self.root.display()),
            ))
        };
        probe
    }

    async fn discover(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(vec![self
                .root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()]);
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get_schema(&self, object: &str) -> Result<SchemaRef> {
        let (schema, _) = self.read_batches(object, 1024)?;
        Ok(schema)
    }

    async fn read(&self, object: &str, options: &ReadOptions) -> Result<BatchStream> {
        let (_, batches) = self.read_batches(object, options.batch_size)?;
        Ok(Box::pin(futures::stream::iter(
            batches.into_iter().map(Ok),
        )))
    }

    async fn read_incremental(
        &self,
        object: &str,
        cursor_field: &str,
        last_value: Option<&TypedValue>,
        options: &ReadOptions,
    ) -> Result<BatchStream> {
        let (_, batches) = self.read_batches(object, options.batch_size)?;
        let filtered: Result<Vec<RecordBatch>> = batches
            .iter()
            .map(|b| match last_value {
                Some(v) => arrow_ext::filter_greater_than(b, cursor_field, v),
                None => Ok(b.clone()),
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(
            filtered?.into_iter().map(Ok),
        )))
    }

    async fn write(
        &self,
        object: &str,
        batches: Vec<RecordBatch>,
        mode: &WriteMode,
    ) -> Result<WriteReport> {
        let rows = arrow_ext::row_count(&batches);
        let bytes = arrow_ext::batches_to_csv(&batches)?;

        let final_path = match mode {
            WriteMode::Replace => self.object_path(object),
            WriteMode::Append => unique_sibling(&self.object_path(object)),
            WriteMode::Upsert { .. } => {
                return Err(self.err(
                    ConnectorErrorKind::Permanent,
                    "UPSERT is not supported for file destinations".into(),
                ))
            }
        };

        let dir = final_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        // Stage: sibling temp file. Swap: atomic rename. The temp file is
        // removed on every failure path by its Drop.
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), &bytes)?;
        tmp.persist(&final_path).map_err(|e| SqlFlowError::SwapFailed {
            target: final_path.display().to_string(),
            message: e.to_string(),
        })?;

        debug!(path = %final_path.display(), rows, "file write committed");
        Ok(WriteReport {
            rows,
            destination: final_path.display().to_string(),
        })
    }
}

/// `data.csv` becomes `data-<id>.csv` so every APPEND run lands in a fresh
/// object.
fn unique_sibling(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "part".into());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let id = nanoid!(8, &nanoid::alphabet::SAFE);
    path.with_file_name(format!("{stem}-{id}{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn connector(dir: &Path) -> FileConnector {
        FileConnector {
            root: dir.to_path_buf(),
            format: FileFormat::Csv,
        }
    }

    #[tokio::test]
    async fn test_csv_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rows.csv"), "a,b\n1,x\n2,y\n").unwrap();
        let c = connector(dir.path());

        let mut stream = c
            .read("rows.csv", &ReadOptions::with_batch_size(1024))
            .await
            .unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.num_rows(), 2);
    }

    #[tokio::test]
    async fn test_replace_write_is_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.csv"), "a\n999\n").unwrap();
        let c = connector(dir.path());

        let (_, batches) = {
            std::fs::write(dir.path().join("in.csv"), "a\n1\n2\n").unwrap();
            c.read_batches("in.csv", 1024).unwrap()
        };
        let report = c
            .write("out.csv", batches, &WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(report.rows, 2);

        let content = std::fs::read_to_string(dir.path().join("out.csv")).unwrap();
        assert!(content.contains('1'));
        assert!(!content.contains("999"));
    }

    #[tokio::test]
    async fn test_append_generates_unique_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.csv"), "a\n1\n").unwrap();
        let c = connector(dir.path());
        let (_, batches) = c.read_batches("in.csv", 1024).unwrap();

        let r1 = c
            .write("out.csv", batches.clone(), &WriteMode::Append)
            .await
            .unwrap();
        let r2 = c.write("out.csv", batches, &WriteMode::Append).await.unwrap();
        assert_ne!(r1.destination, r2.destination);
        assert!(Path::new(&r1.destination).exists());
        assert!(Path::new(&r2.destination).exists());
    }

    #[tokio::test]
    async fn test_incremental_filters_rows() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rows.csv"), "id,v\n1,a\n5,b\n9,c\n").unwrap();
        let c = connector(dir.path());

        let mut stream = c
            .read_incremental(
                "rows.csv",
                "id",
                Some(&TypedValue::Integer { value_int: 4 }),
                &ReadOptions::with_batch_size(1024),
            )
            .await
            .unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.num_rows(), 2);
    }
}
