//! Export executor: engine query result out to a destination.
//!
//! The query runs in the engine, then the destination connector commits
//! the result with its stage-and-swap realization. The destination URI is
//! split into connector params and an object name per connector family:
//! file paths split into directory + file name, object store URLs into
//! store root + key, database URIs name the target table directly.

use std::path::Path;

use indexmap::IndexMap;
use tracing::info;

use super::ExecutionContext;
use crate::connectors::WriteMode;
use crate::errors::{Result, SqlFlowError};
use crate::parser::ExportMode;
use crate::planner::Operation;
use crate::utils::arrow_ext;

pub async fn run(
    ctx: &ExecutionContext,
    op: &Operation,
    sql: &str,
    destination_uri: &str,
    connector_type: &str,
    options: &IndexMap<String, String>,
    mode: &ExportMode,
) -> Result<usize> {
    let sql = ctx.engine.expand_table_udfs(sql).await?;
    let (_, batches) = ctx.engine.query(&sql).await?;
    let rows = arrow_ext::row_count(&batches);

    // The URI names the destination explicitly; params derived from it
    // win over profile defaults and OPTIONS.
    let (extra_params, object) = destination_parts(connector_type, destination_uri)?;
    let mut params = ctx.merged_params(connector_type, options);
    for (k, v) in extra_params {
        params.insert(k, v);
    }

    let connector = ctx.connectors.create(connector_type, &params, op.span)?;
    let policy = ctx.policy_for(connector.as_ref());
    let key = ctx.resilience_key(connector.as_ref());

    let write_mode = match mode {
        ExportMode::Replace => WriteMode::Replace,
        ExportMode::Append => WriteMode::Append,
        ExportMode::Upsert { keys } => WriteMode::Upsert { keys: keys.clone() },
    };

    let conn = connector.clone();
    let object_for_call = object.clone();
    let batches_for_call = batches;
    let report = ctx
        .resilience
        .call(
            &key,
            connector.type_name(),
            "write",
            &policy,
            || conn.write(&object_for_call, batches_for_call.clone(), &write_mode),
            || connector.refresh_credentials(),
        )
        .await?;

    info!(
        op = %op.id,
        destination = %report.destination,
        rows = report.rows,
        "export committed"
    );
    Ok(rows)
}

/// Splits a destination URI into connector params and the object name.
fn destination_parts(
    connector_type: &str,
    uri: &str,
) -> Result<(IndexMap<String, String>, String)> {
    let mut params = IndexMap::new();
    match connector_type {
        "file" => {
            let path = Path::new(uri);
            let object = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    SqlFlowError::Config(format!("export uri '{uri}' has no file name"))
                })?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| ".".to_string());
            params.insert("path".to_string(), dir);
            Ok((params, object))
        }
        "object_store" => {
            let (root, object) = uri.rsplit_once('/').ok_or_else(|| {
                SqlFlowError::Config(format!("export uri '{uri}' has no object key"))
            })?;
            if object.is_empty() {
                return Err(SqlFlowError::Config(format!(
                    "export uri '{uri}' names a prefix, not an object"
                )));
            }
            params.insert("url".to_string(), format!("{root}/"));
            Ok((params, object.to_string()))
        }
        // Database destinations: the URI is the table name; connection
        // params come from OPTIONS / the profile.
        _ => Ok((params, uri.to_string())),
    }
}
