// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount-relative <-> lower-store path mapping
//!
//! Pure naming layer: no filesystem I/O happens here. Every resolution
//! is lexical and relative to the (lower root, mount root) pair bound at
//! mount time.

use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// Path pair bound at mount time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathMapper {
    lower_root: PathBuf,
    mount_root: PathBuf,
}

impl PathMapper {
    pub fn new(lower_root: impl Into<PathBuf>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            lower_root: normalize_absolute(&lower_root.into()),
            mount_root: normalize_absolute(&mount_root.into()),
        }
    }

    pub fn lower_root(&self) -> &Path {
        &self.lower_root
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Normalize a mount-relative path. Leading slashes are dropped, `.`
    /// segments removed and `..` folded; the mount root itself is `.`.
    pub fn normalize(&self, mount_relative: &Path) -> Result<PathBuf, PathError> {
        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in mount_relative.components() {
            match component {
                Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(PathError::PathEscape(mount_relative.to_path_buf()));
                    }
                }
                Component::Normal(name) => parts.push(name),
            }
        }
        if parts.is_empty() {
            return Ok(PathBuf::from("."));
        }
        Ok(parts.into_iter().collect())
    }

    /// Resolve a mount-relative path to its lower-store location
    pub fn to_lower(&self, mount_relative: &Path) -> Result<PathBuf, PathError> {
        let relative = self.normalize(mount_relative)?;
        if relative == Path::new(".") {
            return Ok(self.lower_root.clone());
        }
        Ok(self.lower_root.join(relative))
    }

    /// Map a lower-store path back to its mount-relative form
    pub fn to_mount(&self, lower_path: &Path) -> Result<PathBuf, PathError> {
        let absolute = if lower_path.is_absolute() {
            normalize_absolute(lower_path)
        } else {
            return self.normalize(lower_path);
        };
        match absolute.strip_prefix(&self.lower_root) {
            Ok(rest) if rest.as_os_str().is_empty() => Ok(PathBuf::from(".")),
            Ok(rest) => Ok(rest.to_path_buf()),
            Err(_) => Err(PathError::PathEscape(lower_path.to_path_buf())),
        }
    }
}

/// Provider-supplied paths must be relative and free of `..` segments.
pub fn check_safe_rel_path(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn normalize_absolute(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the filesystem root stays at the root
                if out.parent().is_some() {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PathMapper {
        PathMapper::new("/srv/lower/", "/mnt/projfs")
    }

    #[test]
    fn normalizes_relative_paths() {
        let m = mapper();
        assert_eq!(m.normalize(Path::new("/a/./b/")).unwrap(), PathBuf::from("a/b"));
        assert_eq!(m.normalize(Path::new("a/b/../c")).unwrap(), PathBuf::from("a/c"));
        assert_eq!(m.normalize(Path::new("/")).unwrap(), PathBuf::from("."));
        assert_eq!(m.normalize(Path::new("")).unwrap(), PathBuf::from("."));
    }

    #[test]
    fn resolves_into_lower_root() {
        let m = mapper();
        assert_eq!(
            m.to_lower(Path::new("target/f1.txt")).unwrap(),
            PathBuf::from("/srv/lower/target/f1.txt")
        );
        assert_eq!(m.to_lower(Path::new("/")).unwrap(), PathBuf::from("/srv/lower"));
    }

    #[test]
    fn rejects_traversal_out_of_lower_root() {
        let m = mapper();
        assert!(matches!(
            m.to_lower(Path::new("../etc/passwd")),
            Err(PathError::PathEscape(_))
        ));
        assert!(matches!(
            m.to_lower(Path::new("a/../../b")),
            Err(PathError::PathEscape(_))
        ));
        // staying inside after a detour is fine
        assert!(m.to_lower(Path::new("a/../b")).is_ok());
    }

    #[test]
    fn maps_lower_paths_back_to_mount() {
        let m = mapper();
        assert_eq!(
            m.to_mount(Path::new("/srv/lower/d1/x")).unwrap(),
            PathBuf::from("d1/x")
        );
        assert_eq!(m.to_mount(Path::new("/srv/lower")).unwrap(), PathBuf::from("."));
        assert!(matches!(
            m.to_mount(Path::new("/srv/lower/../other")),
            Err(PathError::PathEscape(_))
        ));
        assert!(matches!(
            m.to_mount(Path::new("/srv/lowerish/x")),
            Err(PathError::PathEscape(_))
        ));
    }

    #[test]
    fn safe_relative_path_check() {
        assert!(check_safe_rel_path(Path::new("a/b.txt")));
        assert!(check_safe_rel_path(Path::new("..hidden")));
        assert!(!check_safe_rel_path(Path::new("/abs")));
        assert!(!check_safe_rel_path(Path::new("a/../b")));
        assert!(!check_safe_rel_path(Path::new("..")));
        assert!(!check_safe_rel_path(Path::new("")));
    }
}
