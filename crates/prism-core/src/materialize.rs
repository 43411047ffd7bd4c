//! Writing file changes into a workspace and reading infrastructure files back.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::model::FileChange;

/// Directories never descended into when listing workspace files.
const SKIPPED_DIRS: [&str; 2] = [".git", ".terraform"];

/// Extension of the files returned by [`list_tf_files`].
const TF_EXTENSION: &str = "tf";

/// Resolve `relative` under `root`, rejecting anything that could land
/// outside it or inside the repository metadata.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    let escape = || Error::PathEscape {
        path: relative.to_string(),
    };
    if relative.trim().is_empty() || relative.contains('\0') {
        return Err(escape());
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                if depth == 0 && part == ".git" {
                    return Err(escape());
                }
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escape());
            }
        }
    }
    if depth == 0 {
        return Err(escape());
    }
    Ok(resolved)
}

/// Write every change under `root`, overwriting existing content.
///
/// All paths are validated before anything is written. Files not named in
/// `changes` are left untouched. If the same path appears more than once
/// the last entry wins.
pub fn write(root: &Path, changes: &[FileChange]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(changes.len());
    for change in changes {
        if !seen.insert(change.path.as_str()) {
            tracing::warn!(path = %change.path, "duplicate path in change set, last entry wins");
        }
        targets.push((resolve(root, &change.path)?, change));
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|e| Error::io_at("resolve workspace", root, e))?;

    for (target, change) in targets {
        let materialize_err = |source| Error::Materialize {
            path: change.path.clone(),
            source,
        };
        if let Some(parent) = target.parent() {
            create_parents(root, &canonical_root, parent, &change.path)?;
        }
        if std::fs::symlink_metadata(&target).is_ok_and(|m| m.file_type().is_symlink()) {
            return Err(Error::PathEscape {
                path: change.path.clone(),
            });
        }
        std::fs::write(&target, &change.content).map_err(materialize_err)?;
        tracing::debug!(path = %change.path, bytes = change.content.len(), "wrote file");
    }

    tracing::info!(count = changes.len(), "materialized file changes");
    Ok(())
}

/// Create `parent` one component at a time below `root`.
///
/// Each existing component is checked before descending, so a symlinked
/// directory that points outside the workspace is rejected before anything
/// is created through it.
fn create_parents(root: &Path, canonical_root: &Path, parent: &Path, path: &str) -> Result<()> {
    let escape = || Error::PathEscape {
        path: path.to_string(),
    };
    let materialize_err = |source| Error::Materialize {
        path: path.to_string(),
        source,
    };
    let relative = parent.strip_prefix(root).map_err(|_| escape())?;

    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let real = current.canonicalize().map_err(materialize_err)?;
                if !real.starts_with(canonical_root) {
                    return Err(escape());
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir(&current).map_err(materialize_err)?;
            }
            Err(e) => return Err(materialize_err(e)),
        }
    }

    let real_parent = parent.canonicalize().map_err(materialize_err)?;
    if !real_parent.starts_with(canonical_root) {
        return Err(escape());
    }
    Ok(())
}

/// Every `.tf` file under `root`, sorted by relative path.
///
/// Paths use `/` separators; `.git` and `.terraform` are skipped.
pub fn list_tf_files(root: &Path) -> Result<Vec<FileChange>> {
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry.depth() > 0
                && SKIPPED_DIRS
                    .iter()
                    .any(|skip| entry.file_name() == std::ffi::OsStr::new(skip)))
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::io_at("walk", &path, e.into())
        })?;
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|ext| ext.to_str()) != Some(TF_EXTENSION)
        {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let content = std::fs::read_to_string(entry.path())
            .map_err(|e| Error::io_at("read", entry.path(), e))?;
        files.push(FileChange::new(relative, content));
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolve_rejects_escapes() {
        let root = Path::new("/ws");
        for bad in ["", "/etc/passwd", "../x.tf", "a/../../x", ".git/config", ".", "./"] {
            assert!(
                matches!(resolve(root, bad), Err(Error::PathEscape { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(resolve(root, "main.tf").unwrap(), Path::new("/ws/main.tf"));
        assert_eq!(
            resolve(root, "./modules/net/vpc.tf").unwrap(),
            Path::new("/ws/modules/net/vpc.tf")
        );
    }

    #[test]
    fn nested_git_name_is_allowed_below_root() {
        assert!(resolve(Path::new("/ws"), "docs/.git-notes.tf").is_ok());
    }

    #[test]
    fn write_creates_parents_and_overwrites() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.tf"), "old content that is longer").unwrap();
        std::fs::write(dir.path().join("keep.tf"), "untouched").unwrap();

        write(
            dir.path(),
            &[
                FileChange::new("main.tf", "new"),
                FileChange::new("modules/vpc/main.tf", "module"),
            ],
        )
        .unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("main.tf")).unwrap(), "new");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("modules/vpc/main.tf")).unwrap(),
            "module"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("keep.tf")).unwrap(),
            "untouched"
        );
    }

    #[test]
    fn escaping_path_aborts_before_writing() {
        let dir = TempDir::new().unwrap();
        let err = write(
            dir.path(),
            &[
                FileChange::new("ok.tf", "x"),
                FileChange::new("../evil.tf", "y"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::PathEscape { ref path } if path == "../evil.tf"));
        assert!(!dir.path().join("ok.tf").exists());
    }

    #[test]
    fn duplicate_paths_last_write_wins() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            &[FileChange::new("a.tf", "first"), FileChange::new("a.tf", "second")],
        )
        .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.tf")).unwrap(), "second");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_cannot_redirect_writes() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = write(dir.path(), &[FileChange::new("link/x.tf", "y")]).unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
        assert!(!outside.path().join("x.tf").exists());
    }

    #[test]
    fn symlinked_directory_gets_no_new_subdirectories() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let err = write(dir.path(), &[FileChange::new("link/newdir/deep/x.tf", "y")]).unwrap_err();

        assert!(matches!(err, Error::PathEscape { .. }));
        assert!(!outside.path().join("newdir").exists());
        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[test]
    fn symlink_inside_workspace_is_followed() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("modules")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("modules"), dir.path().join("mods")).unwrap();

        write(dir.path(), &[FileChange::new("mods/net/vpc.tf", "v")]).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("modules/net/vpc.tf")).unwrap(),
            "v"
        );
    }

    #[test]
    fn lists_tf_files_sorted_and_skips_tool_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("modules/net")).unwrap();
        std::fs::create_dir_all(root.join(".terraform/providers")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("variables.tf"), "v").unwrap();
        std::fs::write(root.join("main.tf"), "m").unwrap();
        std::fs::write(root.join("modules/net/vpc.tf"), "n").unwrap();
        std::fs::write(root.join("README.md"), "r").unwrap();
        std::fs::write(root.join("terraform.tfstate"), "{}").unwrap();
        std::fs::write(root.join(".terraform/providers/p.tf"), "skip").unwrap();
        std::fs::write(root.join(".git/hook.tf"), "skip").unwrap();

        let files = list_tf_files(root).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["main.tf", "modules/net/vpc.tf", "variables.tf"]);
        assert_eq!(files[0].content, "m");
    }

    #[test]
    fn empty_workspace_lists_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(list_tf_files(dir.path()).unwrap().is_empty());
    }
}
