//! Patching YAML manifests inside the GitOps working copy.
//!
//! Only the first document of a file is edited. Everything from the second
//! document separator onwards is carried through byte-for-byte, so trailing
//! documents keep their comments and formatting. The first document is
//! re-emitted by `serde_yaml` with an explicit `---` start marker.

use serde_yaml::Value;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::keypath::{KeyPath, PathError};
use crate::models::Change;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("change file '{0}' must be a relative path inside the repository")]
    OutsideRepository(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("key '{key}' in {file}: {source}")]
    Path {
        file: String,
        key: String,
        #[source]
        source: PathError,
    },

    #[error("current version is empty; refusing to substitute into '{0}'")]
    EmptyVersion(String),
}

/// A YAML file split into its editable first document and the verbatim rest.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub head: Value,
    tail: String,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        let (first, tail) = split_first_document(text);
        let head = if first.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(first)?
        };
        Ok(Self {
            head,
            tail: tail.to_string(),
        })
    }

    /// The trailing documents, separators included, exactly as read.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    pub fn render(&self) -> Result<String, serde_yaml::Error> {
        let mut out = String::from("---\n");
        out.push_str(&serde_yaml::to_string(&self.head)?);
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.tail);
        Ok(out)
    }
}

fn is_separator(line: &str) -> bool {
    let line = line.trim_end_matches(['\r', '\n']);
    line == "---" || line.starts_with("--- ") || line.starts_with("---\t")
}

/// Split `text` into the first document body and the remainder, which starts
/// at the separator of the second document (or is empty).
///
/// A leading separator (optionally preceded by comments and blank lines)
/// opens the first document and is not part of either half.
fn split_first_document(text: &str) -> (&str, &str) {
    let mut body_start = 0;
    let mut offset = 0;
    let mut seen_content = false;

    for line in text.split_inclusive('\n') {
        let start = offset;
        offset += line.len();

        if is_separator(line) {
            if seen_content {
                return (&text[body_start..start], &text[start..]);
            }
            // Opening marker of the first document.
            body_start = offset;
            seen_content = true;
            continue;
        }

        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') && !trimmed.starts_with('%') {
            seen_content = true;
        }
    }
    (&text[body_start..], "")
}

/// Resolve a change's file against the repository root, refusing absolute
/// paths and `..` components.
pub fn resolve_file(root: &Path, file: &str) -> Result<PathBuf, PatchError> {
    let relative = Path::new(file);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if file.is_empty() || escapes {
        return Err(PatchError::OutsideRepository(file.to_string()));
    }
    Ok(root.join(relative))
}

/// Apply one change inside the working copy at `root`, substituting
/// `from_version` with `to_version` in the change's stored value.
///
/// Returns the change with its rewritten value. The file is only written
/// when every step succeeded.
pub fn apply_change(
    root: &Path,
    change: &Change,
    from_version: &str,
    to_version: &str,
) -> Result<Change, PatchError> {
    if from_version.is_empty() {
        return Err(PatchError::EmptyVersion(change.value.clone()));
    }

    let path = resolve_file(root, &change.file)?;
    let text = std::fs::read_to_string(&path).map_err(|source| PatchError::Read {
        path: path.clone(),
        source,
    })?;
    let mut manifest = Manifest::parse(&text).map_err(|source| PatchError::Yaml {
        path: path.clone(),
        source,
    })?;

    let value = change.value.replace(from_version, to_version);
    let key_error = |source| PatchError::Path {
        file: change.file.clone(),
        key: change.key.clone(),
        source,
    };
    let key: KeyPath = change.key.parse().map_err(key_error)?;
    key.set(&mut manifest.head, Value::String(value.clone()))
        .map_err(key_error)?;

    let rendered = manifest.render().map_err(|source| PatchError::Yaml {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&path, rendered).map_err(|source| PatchError::Write {
        path: path.clone(),
        source,
    })?;

    tracing::debug!(file = %change.file, key = %change.key, value = %value, "applied change");
    Ok(Change {
        value,
        ..change.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const POD: &str = "apiVersion: v1\nkind: Pod\nspec:\n  containers:\n    - name: app\n      image: repo/img:v1.0\n";

    #[test]
    fn test_split_single_document() {
        let (first, rest) = split_first_document(POD);
        assert_eq!(first, POD);
        assert_eq!(rest, "");
    }

    #[test]
    fn test_split_leading_marker_and_tail() {
        let text = "# header\n---\na: 1\n---\n# keep me\nb:   2\n--- \nc: 3\n";
        let (first, rest) = split_first_document(text);
        assert_eq!(first, "a: 1\n");
        assert_eq!(rest, "---\n# keep me\nb:   2\n--- \nc: 3\n");
    }

    #[test]
    fn test_render_preserves_tail_verbatim() {
        let text = "a: 1\n---\n# comment\nb:    [1,2]\n";
        let mut m = Manifest::parse(text).unwrap();
        assert_eq!(m.tail(), "---\n# comment\nb:    [1,2]\n");
        m.head = serde_yaml::from_str("a: 2").unwrap();
        let out = m.render().unwrap();
        assert!(out.starts_with("---\na: 2\n"));
        assert!(out.ends_with("---\n# comment\nb:    [1,2]\n"));
    }

    #[test]
    fn test_apply_change_rewrites_value() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.yaml"), POD).unwrap();

        let change = Change::new("a.yaml", "spec.containers.0.image", "repo/img:v1.0");
        let updated = apply_change(tmp.path(), &change, "v1.0", "v1.1").unwrap();
        assert_eq!(updated.value, "repo/img:v1.1");

        let text = std::fs::read_to_string(tmp.path().join("a.yaml")).unwrap();
        let doc: Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(
            doc["spec"]["containers"][0]["image"],
            Value::String("repo/img:v1.1".into())
        );
        assert_eq!(doc["kind"], Value::String("Pod".into()));
    }

    #[test]
    fn test_apply_change_keeps_other_documents() {
        let tmp = TempDir::new().unwrap();
        let text = "spec:\n  source:\n    targetRevision: 8.6.2\n---\n# second\nkind: Service\n";
        std::fs::write(tmp.path().join("app.yaml"), text).unwrap();

        let change = Change::new("app.yaml", "spec.source.targetRevision", "8.6.2");
        apply_change(tmp.path(), &change, "8.6.2", "8.7.0").unwrap();

        let out = std::fs::read_to_string(tmp.path().join("app.yaml")).unwrap();
        let reread = Manifest::parse(&out).unwrap();
        assert_eq!(
            reread.head["spec"]["source"]["targetRevision"],
            Value::String("8.7.0".into())
        );
        assert_eq!(reread.tail(), "---\n# second\nkind: Service\n");
    }

    #[test]
    fn test_template_text_around_version_survives() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.yaml"), "image: old\n").unwrap();

        let change = Change::new("a.yaml", "image", "ghcr.io/org/app:v2.0-alpine");
        let updated = apply_change(tmp.path(), &change, "v2.0", "v2.1").unwrap();
        assert_eq!(updated.value, "ghcr.io/org/app:v2.1-alpine");
    }

    #[test]
    fn test_missing_file_is_an_error_and_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let change = Change::new("missing.yaml", "a", "x:1");
        let err = apply_change(tmp.path(), &change, "1", "2").unwrap_err();
        assert!(matches!(err, PatchError::Read { .. }));
        assert!(!tmp.path().join("missing.yaml").exists());
    }

    #[test]
    fn test_bad_key_leaves_file_untouched() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.yaml"), POD).unwrap();

        let change = Change::new("a.yaml", "spec.containers[3].image", "repo/img:v1.0");
        let err = apply_change(tmp.path(), &change, "v1.0", "v1.1").unwrap_err();
        assert!(matches!(err, PatchError::Path { .. }));
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.yaml")).unwrap(), POD);
    }

    #[test]
    fn test_rejects_paths_outside_repository() {
        let tmp = TempDir::new().unwrap();
        for file in ["../escape.yaml", "/etc/passwd", ""] {
            let change = Change::new(file, "a", "v1");
            let err = apply_change(tmp.path(), &change, "v1", "v2").unwrap_err();
            assert!(matches!(err, PatchError::OutsideRepository(_)), "{}", file);
        }
    }

    #[test]
    fn test_empty_from_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.yaml"), "image: x\n").unwrap();
        let change = Change::new("a.yaml", "image", "img:latest");
        let err = apply_change(tmp.path(), &change, "", "v1").unwrap_err();
        assert!(matches!(err, PatchError::EmptyVersion(_)));
    }
}
