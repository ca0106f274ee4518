//! Pipeline file loading with INCLUDE resolution.
//!
//! `INCLUDE "path"` is textual inclusion: the included file's steps splice
//! in at the include site before planning. Cycles are detected by file
//! identity (canonicalized path), so `a -> b -> a` fails regardless of how
//! the paths are spelled.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::{parse_pipeline, Step};
use crate::errors::{Result, SqlFlowError};

/// Loads a pipeline file and flattens every INCLUDE, recursively.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<Vec<Step>> {
    let mut visiting = HashSet::new();
    load_file(path.as_ref(), &mut visiting)
}

fn identity(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn load_file(path: &Path, visiting: &mut HashSet<PathBuf>) -> Result<Vec<Step>> {
    let id = identity(path);
    if !visiting.insert(id.clone()) {
        return Err(SqlFlowError::IncludeCycle {
            path: path.display().to_string(),
            span: Default::default(),
        });
    }

    let text = std::fs::read_to_string(path).map_err(|e| {
        SqlFlowError::Config(format!("cannot read pipeline '{}': {e}", path.display()))
    })?;
    let steps = parse_pipeline(&text)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let flattened = flatten(steps, base, visiting)?;

    visiting.remove(&id);
    Ok(flattened)
}

fn flatten(steps: Vec<Step>, base: &Path, visiting: &mut HashSet<PathBuf>) -> Result<Vec<Step>> {
    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        match step {
            Step::Include(inc) => {
                let target = base.join(&inc.path);
                let id = identity(&target);
                if visiting.contains(&id) {
                    return Err(SqlFlowError::IncludeCycle {
                        path: inc.path,
                        span: inc.span,
                    });
                }
                out.extend(load_file(&target, visiting)?);
            }
            Step::If(mut branch) => {
                branch.then_steps = flatten(branch.then_steps, base, visiting)?;
                branch.else_steps = flatten(branch.else_steps, base, visiting)?;
                out.push(Step::If(branch));
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_flattening() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inner.sf"), "SET a = \"1\";").unwrap();
        std::fs::write(
            dir.path().join("main.sf"),
            "INCLUDE \"inner.sf\";\nSET b = \"2\";",
        )
        .unwrap();

        let steps = load_pipeline(dir.path().join("main.sf")).unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_include_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.sf"), "INCLUDE \"b.sf\";").unwrap();
        std::fs::write(dir.path().join("b.sf"), "INCLUDE \"a.sf\";").unwrap();

        let err = load_pipeline(dir.path().join("a.sf")).unwrap_err();
        assert!(matches!(err, SqlFlowError::IncludeCycle { .. }));
    }
}
