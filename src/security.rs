use crate::errors::InvalidParamsError;
use anyhow::{Result, anyhow};
use std::path::{Path, PathBuf};

/// Canonicalize `candidate` and ensure it remains within `workspace_root`.
///
/// This is symlink-aware: we canonicalize both the workspace root and the candidate path.
///
/// If `candidate` does not exist, we canonicalize its parent directory and then re-join
/// the final path segment, which is sufficient for boundary enforcement prior to a write.
pub fn canonicalize_and_enforce_within_workspace(
    workspace_root: &Path,
    candidate: &Path,
    tool: &'static str,
    field: &'static str,
) -> Result<PathBuf> {
    let workspace_root = workspace_root
        .canonicalize()
        .map_err(|e| anyhow!("failed to canonicalize workspace_root: {e}"))?;

    let canonical_candidate = if candidate.exists() {
        candidate.canonicalize().map_err(|e| {
            InvalidParamsError::new(tool, format!("{field} could not be canonicalized: {e}"))
                .with_path(field)
        })?
    } else {
        let parent = candidate.parent().ok_or_else(|| {
            InvalidParamsError::new(tool, format!("{field} must have a parent directory"))
                .with_path(field)
        })?;
        let file_name = candidate.file_name().ok_or_else(|| {
            InvalidParamsError::new(tool, format!("{field} must include a file name"))
                .with_path(field)
        })?;

        let canonical_parent = parent.canonicalize().map_err(|e| {
            InvalidParamsError::new(
                tool,
                format!("{field} parent directory could not be canonicalized: {e}"),
            )
            .with_path(field)
        })?;

        canonical_parent.join(file_name)
    };

    if !canonical_candidate.starts_with(&workspace_root) {
        return Err(InvalidParamsError::new(tool, format!(
            "{field} must be within workspace_root after canonicalization \
             (got '{}', workspace_root='{}')",
            canonical_candidate.display(),
            workspace_root.display(),
        ))
        .with_path(field)
        .into());
    }

    Ok(canonical_candidate)
}

/// Make an uploaded file name safe to echo back and to use with `Path::join`.
pub fn sanitize_filename_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_control() || ch == '/' || ch == '\\' {
            out.push('_');
        } else {
            out.push(ch);
        }
    }

    if out == "." || out == ".." {
        return "_".to_string();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_separators_and_traversal() {
        assert_eq!(sanitize_filename_component("../evil.xlsx"), ".._evil.xlsx");
        assert_eq!(sanitize_filename_component("a\\b.xlsx"), "a_b.xlsx");
        assert_eq!(sanitize_filename_component(".."), "_");
        assert_eq!(sanitize_filename_component("Budget 2024.xlsx"), "Budget 2024.xlsx");
    }

    #[test]
    fn rejects_paths_outside_workspace() {
        let root = tempfile::tempdir().unwrap();
        let inside = root.path().join("out.xlsx");
        let resolved =
            canonicalize_and_enforce_within_workspace(root.path(), &inside, "apply", "out");
        let resolved = resolved.unwrap();
        assert!(resolved.ends_with("out.xlsx"));

        let other = tempfile::tempdir().unwrap();
        let outside = other.path().join("out.xlsx");
        let err = canonicalize_and_enforce_within_workspace(root.path(), &outside, "apply", "out")
            .unwrap_err();
        let inv = err.downcast_ref::<InvalidParamsError>().unwrap();
        assert_eq!(inv.path(), Some("out"));
    }
}
