//! Object store connector.
//!
//! Backed by the `object_store` crate: `file://` URLs map to a local
//! filesystem store and `memory://` to an in-memory store (used by tests).
//! Writes follow the object-store realization of stage-and-swap: the
//! payload lands under a unique temp key, then a server-side copy to the
//! final key and a delete of the temp makes it live. APPEND writes a
//! unique final key directly; the staged object is already the final one.
//! REPLACE is only atomic for a single object, so it is rejected on
//! prefix-shaped destinations.

use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use indexmap::IndexMap;
use nanoid::nanoid;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::debug;
use url::Url;

use super::{
    require_param, BatchStream, Capabilities, Connector, ConnectorKind, ReadOptions, WriteMode,
    WriteReport,
};
use crate::errors::{ConnectorErrorKind, Result, SqlFlowError};
use crate::state::TypedValue;
use crate::utils::arrow_ext;

pub struct ObjectStoreConnector {
    store: Arc<dyn ObjectStore>,
    host: String,
    prefix: Option<String>,
}

pub fn from_params(params: &IndexMap<String, String>) -> Result<Arc<dyn Connector>> {
    let raw = require_param(params, "url", "object_store")?;
    let url = Url::parse(raw)?;

    let (store, host): (Arc<dyn ObjectStore>, String) = match url.scheme() {
        "file" => {
            let root = url.path();
            std::fs::create_dir_all(root)?;
            (
                Arc::new(LocalFileSystem::new_with_prefix(root)?),
                "local".to_string(),
            )
        }
        "memory" => (Arc::new(InMemory::new()), "memory".to_string()),
        other => {
            return Err(SqlFlowError::Config(format!(
                "object_store: scheme '{other}' is not enabled in this build (use file:// or memory://)"
            )))
        }
    };

    Ok(Arc::new(ObjectStoreConnector {
        store,
        host,
        prefix: params.get("prefix").cloned(),
    }))
}

impl ObjectStoreConnector {
    fn key(&self, object: &str) -> ObjectPath {
        match &self.prefix {
            Some(prefix) => ObjectPath::from(format!("{}/{}", prefix.trim_end_matches('/'), object)),
            None => ObjectPath::from(object),
        }
    }

    fn err(&self, kind: ConnectorErrorKind, message: String) -> SqlFlowError {
        SqlFlowError::Connector {
            connector: "object_store".into(),
            kind,
            message,
        }
    }

    async fn fetch(&self, object: &str, batch_size: usize) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let key = self.key(object);
        let bytes = self.store.get(&key).await?.bytes().await?;
        arrow_ext::csv_to_batches(&bytes, batch_size.max(1))
    }
}

#[async_trait]
impl Connector for ObjectStoreConnector {
    fn type_name(&self) -> &'static str {
        "object_store"
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::ObjectStore
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            readable: true,
            incrementally_readable: false,
            writable: true,
            discoverable: true,
        }
    }

    fn host_key(&self) -> String {
        self.host.clone()
    }

    async fn test_connection(&self) -> Result<()> {
        let prefix = self.prefix.as_ref().map(|p| ObjectPath::from(p.as_str()));
        self.store.list_with_delimiter(prefix.as_ref()).await?;
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<String>> {
        let prefix = self.prefix.as_ref().map(|p| ObjectPath::from(p.as_str()));
        let mut names: Vec<String> = self
            .store
            .list(prefix.as_ref())
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_schema(&self, object: &str) -> Result<SchemaRef> {
        let (schema, _) = self.fetch(object, 1024).await?;
        Ok(schema)
    }

    async fn read(&self, object: &str, options: &ReadOptions) -> Result<BatchStream> {
        let (_, batches) = self.fetch(object, options.batch_size).await?;
        Ok(Box::pin(futures::stream::iter(batches.into_iter().map(Ok))))
    }

    async fn read_incremental(
        &self,
        object: &str,
        cursor_field: &str,
        last_value: Option<&TypedValue>,
        options: &ReadOptions,
    ) -> Result<BatchStream> {
        let (_, batches) = self.fetch(object, options.batch_size).await?;
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
        let payload = PutPayload::from(bytes);

        match mode {
            WriteMode::Replace => {
                if object.ends_with('/') {
                    return Err(self.err(
                        ConnectorErrorKind::Permanent,
                        "REPLACE is only atomic for a single object, not a prefix".into(),
                    ));
                }
                let final_key = self.key(object);
                let temp_key = self.key(&format!("{object}.stage-{}", nanoid!(8)));

                // Stage under the temp key, swap via server-side copy,
                // then drop the stage.
                self.store.put(&temp_key, payload).await?;
                let swap = self.store.copy(&temp_key, &final_key).await;
                let cleanup = self.store.delete(&temp_key).await;
                swap.map_err(|e| SqlFlowError::SwapFailed {
                    target: final_key.to_string(),
                    message: e.to_string(),
                })?;
                cleanup.ok();

                debug!(key = %final_key, rows, "object store replace committed");
                Ok(WriteReport {
                    rows,
                    destination: final_key.to_string(),
                })
            }
            WriteMode::Append => {
                // The staged unique key IS the final object.
                let unique = unique_object_name(object);
                let key = self.key(&unique);
                self.store.put(&key, payload).await?;
                debug!(key = %key, rows, "object store append committed");
                Ok(WriteReport {
                    rows,
                    destination: key.to_string(),
                })
            }
            WriteMode::Upsert { .. } => Err(self.err(
                ConnectorErrorKind::Permanent,
                "UPSERT is not supported for object store destinations".into(),
            )),
        }
    }
}

fn unique_object_name(object: &str) -> String {
    let id = nanoid!(8, &nanoid::alphabet::SAFE);
    match object.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{id}.{ext}"),
        None => format!("{object}-{id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn connector() -> ObjectStoreConnector {
        ObjectStoreConnector {
            store: Arc::new(InMemory::new()),
            host: "memory".into(),
            prefix: None,
        }
    }

    async fn seed(c: &ObjectStoreConnector, key: &str, csv: &str) {
        c.store
            .put(&ObjectPath::from(key), PutPayload::from(csv.as_bytes().to_vec()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_csv_object() {
        let c = connector();
        seed(&c, "rows.csv", "a,b\n1,x\n2,y\n").await;

        let mut stream = c
            .read("rows.csv", &ReadOptions::with_batch_size(1024))
            .await
            .unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.num_rows(), 2);
    }

    #[tokio::test]
    async fn test_replace_swaps_via_copy() {
        let c = connector();
        seed(&c, "in.csv", "a\n1\n2\n").await;
        seed(&c, "out.csv", "a\n999\n").await;

        let (_, batches) = c.fetch("in.csv", 1024).await.unwrap();
        c.write("out.csv", batches, &WriteMode::Replace).await.unwrap();

        let (_, out) = c.fetch("out.csv", 1024).await.unwrap();
        assert_eq!(arrow_ext::row_count(&out), 2);

        // No stage object left behind.
        let names = c.discover().await.unwrap();
        assert!(names.iter().all(|n| !n.contains(".stage-")));
    }

    #[tokio::test]
    async fn test_append_is_unique_key() {
        let c = connector();
        seed(&c, "in.csv", "a\n1\n").await;
        let (_, batches) = c.fetch("in.csv", 1024).await.unwrap();

        let r1 = c
            .write("out.csv", batches.clone(), &WriteMode::Append)
            .await
            .unwrap();
        let r2 = c.write("out.csv", batches, &WriteMode::Append).await.unwrap();
        assert_ne!(r1.destination, r2.destination);
    }

    #[tokio::test]
    async fn test_replace_on_prefix_rejected() {
        let c = connector();
        seed(&c, "in.csv", "a\n1\n").await;
        let (_, batches) = c.fetch("in.csv", 1024).await.unwrap();

        let err = c
            .write("daily/", batches, &WriteMode::Replace)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("prefix"));
    }
}
