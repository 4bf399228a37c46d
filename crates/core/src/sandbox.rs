// crates/core/src/sandbox.rs
//! Path sandbox. Every filesystem path the service touches is produced here.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::SandboxError;

/// Join `segments` under `root` and verify the resolved result stays inside
/// the canonical root.
///
/// Resolution follows `realpath` semantics: symlinks that exist are
/// followed, components that do not exist yet are normalized lexically. An
/// escape by `..`, by an absolute segment, or through a symlink fails with
/// [`SandboxError::Traversal`].
pub fn safe_path<I, S>(root: impl AsRef<Path>, segments: I) -> Result<PathBuf, SandboxError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<Path>,
{
    let root = root.as_ref();
    let canonical_root = fs::canonicalize(root).map_err(|source| SandboxError::Root {
        root: root.to_path_buf(),
        source,
    })?;

    let mut joined = canonical_root.clone();
    for segment in segments {
        joined.push(segment);
    }

    let resolved = resolve(&joined)?;
    if !resolved.starts_with(&canonical_root) {
        tracing::warn!(
            root = %canonical_root.display(),
            attempted = %joined.display(),
            "Path traversal rejected"
        );
        return Err(SandboxError::Traversal {
            root: canonical_root,
            attempted: joined,
        });
    }
    Ok(resolved)
}

fn resolve(path: &Path) -> Result<PathBuf, SandboxError> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                let is_link = fs::symlink_metadata(&resolved)
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false);
                if is_link {
                    resolved = fs::canonicalize(&resolved).map_err(|source| SandboxError::Io {
                        path: resolved.clone(),
                        source,
                    })?;
                }
            }
        }
    }
    Ok(resolved)
}
