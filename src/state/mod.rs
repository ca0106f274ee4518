//! Watermark & state manager.
//!
//! Durable, cached store of per-pipeline, per-source, per-target,
//! per-column cursor values; the substrate for all incremental operations.
//! Records live in a single JSON document under the profile's state
//! directory. Every update rewrites the document through a sibling temp
//! file and an atomic rename, the same stage-and-swap discipline used for
//! destination writes. Reads go through a bounded LRU cache.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{Result, SqlFlowError};

const CACHE_CAPACITY: usize = 1024;
const STORE_FILE: &str = "watermarks.json";

/// Primary key of a watermark record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatermarkKey {
    pub pipeline: String,
    pub source: String,
    pub target: String,
    pub column: String,
}

impl std::fmt::Display for WatermarkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.pipeline, self.source, self.target, self.column
        )
    }
}

/// A cursor value in the richest type available. Comparison is typed:
/// values of different kinds do not order against each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value_kind", rename_all = "lowercase")]
pub enum TypedValue {
    Timestamp { value_ts: DateTime<Utc> },
    Integer { value_int: i64 },
    Text { value_str: String },
}

impl TypedValue {
    pub fn kind(&self) -> &'static str {
        match self {
            TypedValue::Timestamp { .. } => "timestamp",
            TypedValue::Integer { .. } => "integer",
            TypedValue::Text { .. } => "text",
        }
    }

    /// Typed comparison; `None` when the kinds differ.
    pub fn partial_cmp_typed(&self, other: &TypedValue) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (TypedValue::Timestamp { value_ts: a }, TypedValue::Timestamp { value_ts: b }) => {
                Some(a.cmp(b))
            }
            (TypedValue::Integer { value_int: a }, TypedValue::Integer { value_int: b }) => {
                Some(a.cmp(b))
            }
            (TypedValue::Text { value_str: a }, TypedValue::Text { value_str: b }) => {
                Some(a.cmp(b))
            }
            _ => None,
        }
    }

    /// Rendering used for logs and the CLI listing.
    pub fn display(&self) -> String {
        match self {
            TypedValue::Timestamp { value_ts } => value_ts.to_rfc3339(),
            TypedValue::Integer { value_int } => value_int.to_string(),
            TypedValue::Text { value_str } => value_str.clone(),
        }
    }
}

impl std::fmt::Display for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

/// One persisted watermark row. Field names mirror the storage layout:
/// only the value column matching `value_kind` is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkRecord {
    #[serde(flatten)]
    pub key: WatermarkKey,
    #[serde(flatten)]
    pub value: TypedValue,
    pub updated_at: DateTime<Utc>,
}

/// The store. One instance per process; shared behind `Arc`.
pub struct WatermarkStore {
    path: PathBuf,
    records: RwLock<IndexMap<WatermarkKey, WatermarkRecord>>,
    cache: Mutex<LruCache<WatermarkKey, TypedValue>>,
}

impl WatermarkStore {
    /// Opens (and on first use creates) the store under `state_dir`.
    pub fn open(state_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = state_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);

        let mut records = IndexMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if !raw.trim().is_empty() {
                let rows: Vec<WatermarkRecord> = serde_json::from_str(&raw)
                    .map_err(|e| SqlFlowError::Watermark(format!("corrupt store file: {e}")))?;
                for row in rows {
                    records.insert(row.key.clone(), row);
                }
            }
        }

        debug!(path = %path.display(), records = records.len(), "watermark store opened");
        Ok(Self {
            path,
            records: RwLock::new(records),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        })
    }

    /// Cached read of one watermark.
    pub fn get(&self, key: &WatermarkKey) -> Option<TypedValue> {
        if let Some(v) = self.cache.lock().get(key) {
            return Some(v.clone());
        }
        let value = self.records.read().get(key).map(|r| r.value.clone())?;
        self.cache.lock().put(key.clone(), value.clone());
        Some(value)
    }

    /// Atomic upsert. Watermarks only move forward: an update below the
    /// stored value of the same kind is ignored. A kind change overwrites
    /// with a warning (a source changed its cursor column type).
    pub fn update(&self, key: &WatermarkKey, value: TypedValue) -> Result<()> {
        {
            let mut records = self.records.write();
            if let Some(existing) = records.get(key) {
                match value.partial_cmp_typed(&existing.value) {
                    Some(std::cmp::Ordering::Less) => {
                        debug!(%key, new = %value, old = %existing.value, "watermark not advanced");
                        return Ok(());
                    }
                    None => {
                        warn!(
                            %key,
                            old_kind = existing.value.kind(),
                            new_kind = value.kind(),
                            "watermark value kind changed; overwriting"
                        );
                    }
                    _ => {}
                }
            }
            records.insert(
                key.clone(),
                WatermarkRecord {
                    key: key.clone(),
                    value: value.clone(),
                    updated_at: Utc::now(),
                },
            );
            self.persist_locked(&records)?;
        }

        let mut cache = self.cache.lock();
        cache.pop(key);
        cache.put(key.clone(), value);
        Ok(())
    }

    /// All records, for the CLI listing.
    pub fn list(&self) -> Vec<WatermarkRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Drops every watermark of one pipeline.
    pub fn reset(&self, pipeline: &str) -> Result<usize> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|k, _| k.pipeline != pipeline);
        let removed = before - records.len();
        if removed > 0 {
            self.persist_locked(&records)?;
        }
        self.cache.lock().clear();
        Ok(removed)
    }

    /// Drops everything.
    pub fn reset_all(&self) -> Result<usize> {
        let mut records = self.records.write();
        let removed = records.len();
        records.clear();
        self.persist_locked(&records)?;
        self.cache.lock().clear();
        Ok(removed)
    }

    /// Rewrites the store file through a sibling temp file + rename.
    fn persist_locked(&self, records: &IndexMap<WatermarkKey, WatermarkRecord>) -> Result<()> {
        let rows: Vec<&WatermarkRecord> = records.values().collect();
        let json = serde_json::to_string_pretty(&rows)?;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| SqlFlowError::Watermark("store path has no parent".into()))?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), json)?;
        tmp.persist(&self.path)
            .map_err(|e| SqlFlowError::Watermark(format!("cannot swap store file: {e}")))?;
        Ok(())
    }
}
