//! Keeps archive requests inside the configured root directory.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Result of resolving a requested path against the root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfinementCheck {
    pub requested_path: String,
    pub resolved_absolute_path: PathBuf,
    pub confined: bool,
}

/// Resolves request paths below a root directory
///
/// In the default mode a path counts as confined when it resolves to the root itself, or
/// when the root is a string prefix of its parent directory. This accepts siblings sharing
/// the root's name as prefix (`/srv/data-other` for root `/srv/data`), `strict` mode compares
/// whole path components instead.
#[derive(Clone, Debug)]
pub struct Confinement {
    root: PathBuf,
    strict: bool,
}

impl Confinement {
    pub fn new<P: AsRef<Path>>(root: P, strict: bool) -> Self {
        Self {
            root: absolute_path(root.as_ref()),
            strict,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn check(&self, requested_path: &str) -> ConfinementCheck {
        let resolved = join_normalized(&self.root, requested_path);

        let confined = resolved == self.root
            || self.contains(&self.root, resolved.parent().unwrap_or(&resolved));

        log::debug!(
            "path {} inside root {:?} = {}",
            requested_path,
            self.root,
            confined
        );

        ConfinementCheck {
            requested_path: requested_path.to_string(),
            resolved_absolute_path: resolved,
            confined,
        }
    }

    /// Whether the directory holding `target` stays inside the root with symlinks resolved.
    ///
    /// [Confinement::check] works on the path string only, a symlinked directory below the
    /// root could lead elsewhere. `target` itself is not resolved, the archive stores it as
    /// link. A parent that cannot be resolved counts as inside, the missing target is
    /// reported when it is opened.
    pub async fn parent_within_root(&self, target: &Path) -> Result<bool, io::Error> {
        let parent = match target.parent() {
            Some(parent) if target != self.root => parent,
            _ => return Ok(true),
        };

        let root = tokio::fs::canonicalize(&self.root).await?;
        match tokio::fs::canonicalize(parent).await {
            Ok(parent) => Ok(self.contains(&root, &parent)),
            Err(err) => {
                log::debug!("unable to resolve {:?} - {}", parent, err);
                Ok(true)
            }
        }
    }

    fn contains(&self, root: &Path, dir: &Path) -> bool {
        if self.strict {
            dir.starts_with(root)
        } else {
            dir.as_os_str()
                .as_bytes()
                .starts_with(root.as_os_str().as_bytes())
        }
    }
}

/// Lexically normalized absolute form of `path`.
///
/// Relative paths are resolved against the current directory. If that is unavailable the
/// path is only normalized.
pub fn absolute_path(path: &Path) -> PathBuf {
    let base = if path.is_absolute() {
        PathBuf::from("/")
    } else {
        match std::env::current_dir() {
            Ok(cwd) => normalize(&cwd, Path::new("")),
            Err(err) => {
                log::debug!("failed to get absolute path of {:?} - {}", path, err);
                PathBuf::new()
            }
        }
    };
    normalize(&base, path)
}

/// Join `requested` onto `root`, removing `.` and resolving `..` without touching the
/// file system. `..` never climbs above `/`.
fn join_normalized(root: &Path, requested: &str) -> PathBuf {
    normalize(root, Path::new(requested))
}

fn normalize(base: &Path, path: &Path) -> PathBuf {
    let mut result = base.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(name) => result.push(name),
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => (),
        }
    }
    result
}
