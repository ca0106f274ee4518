//! Connector contract and registry.
//!
//! A connector bridges one external system kind into the engine: it can be
//! configured from params, tested, asked for schemas, read as a lazy
//! stream of Arrow batches, and (when writable) written to with the
//! stage-and-swap protocol. Connectors are registered in a process-wide
//! registry keyed by type name; factories run at LOAD/EXPORT time with the
//! post-substitution params.
//!
//! Batch streams are finite, pull-based and non-restartable: a new batch
//! is requested only after the previous one has been staged.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use futures::Stream;
use indexmap::IndexMap;

use crate::errors::{ConnectorErrorKind, Result, Span, SqlFlowError};
use crate::resilience::Policy;
use crate::state::TypedValue;

pub mod file;
pub mod http;
pub mod object_store;
pub mod postgres;

/// What kind of system a connector talks to; selects resilience defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Api,
    Database,
    File,
    ObjectStore,
}

impl ConnectorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectorKind::Api => "api",
            ConnectorKind::Database => "database",
            ConnectorKind::File => "file",
            ConnectorKind::ObjectStore => "object-store",
        }
    }
}

/// Explicit capability set; the executor consults this instead of probing.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub readable: bool,
    pub incrementally_readable: bool,
    pub writable: bool,
    pub discoverable: bool,
}

/// Destination write semantics for `Connector::write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    Append,
    Upsert { keys: Vec<String> },
}

/// Result of one destination write.
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub rows: usize,
    /// Where the data actually landed (APPEND destinations may generate
    /// a unique name per run).
    pub destination: String,
}

/// Lazy, finite stream of typed row batches.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<RecordBatch>> + Send>>;

/// Read-time options passed through from the profile and LOAD statement.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub batch_size: usize,
    pub columns: Option<Vec<String>>,
}

impl ReadOptions {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            columns: None,
        }
    }
}

fn unsupported(connector: &str, what: &str) -> SqlFlowError {
    SqlFlowError::Connector {
        connector: connector.to_string(),
        kind: ConnectorErrorKind::Permanent,
        message: format!("{what} is not supported by this connector"),
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn kind(&self) -> ConnectorKind;
    fn capabilities(&self) -> Capabilities;

    /// Host part of the resilience key; state is shared per
    /// `(connector_type, host)` across concurrent pipelines.
    fn host_key(&self) -> String;

    async fn test_connection(&self) -> Result<()>;

    /// Objects (tables, files, endpoints) this connector can read.
    async fn discover(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_schema(&self, object: &str) -> Result<SchemaRef>;

    async fn read(&self, object: &str, options: &ReadOptions) -> Result<BatchStream>;

    /// Cursor-filtered read: only rows with `cursor_field > last_value`.
    /// Connectors must drop NULL cursor rows before emitting.
    async fn read_incremental(
        &self,
        _object: &str,
        _cursor_field: &str,
        _last_value: Option<&TypedValue>,
        _options: &ReadOptions,
    ) -> Result<BatchStream> {
        Err(unsupported(self.type_name(), "incremental reading"))
    }

    /// Stage-and-swap write of a full result set.
    async fn write(
        &self,
        _object: &str,
        _batches: Vec<RecordBatch>,
        _mode: &WriteMode,
    ) -> Result<WriteReport> {
        Err(unsupported(self.type_name(), "writing"))
    }

    /// Recovery hook: rotate credentials after an auth failure. Returns
    /// true when a retry is warranted. Must be idempotent.
    async fn refresh_credentials(&self) -> Result<bool> {
        Ok(false)
    }

    /// Smart-default resilience policy for this connector.
    fn resilience_defaults(&self) -> Policy {
        Policy::for_kind(self.kind())
    }
}

/// Factory invoked with post-substitution params.
pub type ConnectorFactory =
    Arc<dyn Fn(&IndexMap<String, String>) -> Result<Arc<dyn Connector>> + Send + Sync>;

struct RegistryEntry {
    kind: ConnectorKind,
    factory: ConnectorFactory,
}

/// Process-wide connector registry, populated at init time.
pub struct ConnectorRegistry {
    entries: DashMap<String, RegistryEntry>,
}

static GLOBAL: std::sync::OnceLock<ConnectorRegistry> = std::sync::OnceLock::new();

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// The global registry with the built-in connectors registered.
    pub fn global() -> &'static ConnectorRegistry {
        GLOBAL.get_or_init(|| {
            let registry = ConnectorRegistry::new();
            registry.register_builtins();
            registry
        })
    }

    pub fn register_builtins(&self) {
        self.register("file", ConnectorKind::File, Arc::new(file::from_params));
        self.register("http", ConnectorKind::Api, Arc::new(http::from_params));
        self.register(
            "postgres",
            ConnectorKind::Database,
            Arc::new(postgres::from_params),
        );
        self.register(
            "object_store",
            ConnectorKind::ObjectStore,
            Arc::new(object_store::from_params),
        );
    }

    pub fn register(&self, type_name: &str, kind: ConnectorKind, factory: ConnectorFactory) {
        self.entries
            .insert(type_name.to_ascii_lowercase(), RegistryEntry { kind, factory });
    }

    pub fn kind_of(&self, type_name: &str) -> Option<ConnectorKind> {
        self.entries
            .get(&type_name.to_ascii_lowercase())
            .map(|e| e.kind)
    }

    /// Instantiates a connector for one operation's lifetime.
    pub fn create(
        &self,
        type_name: &str,
        params: &IndexMap<String, String>,
        span: Span,
    ) -> Result<Arc<dyn Connector>> {
        let entry = self
            .entries
            .get(&type_name.to_ascii_lowercase())
            .ok_or_else(|| SqlFlowError::UnknownConnector {
                type_name: type_name.to_string(),
                span,
            })?;
        (entry.factory)(params)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches a required param or fails with a configuration error.
pub(crate) fn require_param<'a>(
    params: &'a IndexMap<String, String>,
    key: &str,
    connector: &str,
) -> Result<&'a str> {
    params
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| {
            SqlFlowError::Config(format!(
                "connector '{connector}' requires the '{key}' parameter"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_builtins() {
        let registry = ConnectorRegistry::global();
        assert_eq!(registry.kind_of("file"), Some(ConnectorKind::File));
        assert_eq!(registry.kind_of("HTTP"), Some(ConnectorKind::Api));
        assert_eq!(registry.kind_of("postgres"), Some(ConnectorKind::Database));
        assert!(registry.kind_of("bogus").is_none());
    }

    #[test]
    fn test_unknown_connector_error() {
        let registry = ConnectorRegistry::global();
        let err = registry
            .create("bogus", &IndexMap::new(), Span::new(1, 1))
            .err()
            .unwrap();
        assert!(matches!(err, SqlFlowError::UnknownConnector { .. }));
    }
}
