// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Extended attribute access on lower-store paths (no symlink follow)

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Namespace owned by the projection layer
pub const PROJECTION_XATTR_PREFIX: &str = "user.projection.";

/// Marks a directory as an unpopulated projection root
pub const PROJECTION_EMPTY_XATTR: &str = "user.projection.empty";

pub fn is_reserved(name: &OsStr) -> bool {
    name.as_bytes().starts_with(PROJECTION_XATTR_PREFIX.as_bytes())
}

fn missing() -> io::Error {
    io::Error::from_raw_os_error(libc::ENODATA)
}

/// Set `name`, honoring `XATTR_CREATE` / `XATTR_REPLACE` with a check
/// before the write
pub fn set(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
    let create = flags & libc::XATTR_CREATE != 0;
    let replace = flags & libc::XATTR_REPLACE != 0;
    if create || replace {
        let exists = ::xattr::get(path, name)?.is_some();
        if create && exists {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        if replace && !exists {
            return Err(missing());
        }
    }
    ::xattr::set(path, name, value)
}

pub fn get(path: &Path, name: &OsStr) -> io::Result<Vec<u8>> {
    ::xattr::get(path, name)?.ok_or_else(missing)
}

/// NUL-separated attribute names, as the kernel expects them
pub fn list(path: &Path) -> io::Result<Vec<u8>> {
    let mut names = Vec::new();
    for name in ::xattr::list(path)? {
        names.extend_from_slice(name.as_bytes());
        names.push(0);
    }
    Ok(names)
}

pub fn remove(path: &Path, name: &OsStr) -> io::Result<()> {
    ::xattr::remove(path, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_namespace_is_reserved() {
        assert!(is_reserved(OsStr::new(PROJECTION_EMPTY_XATTR)));
        assert!(is_reserved(OsStr::new("user.projection.anything")));
        assert!(!is_reserved(OsStr::new("user.projectionx")));
        assert!(!is_reserved(OsStr::new("user.mime_type")));
    }

    #[test]
    fn create_and_replace_flags_when_supported() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"").unwrap();
        let name = OsStr::new("user.projfs.test");

        match set(&file, name, b"v1", 0) {
            Ok(()) => {
                assert_eq!(get(&file, name).unwrap(), b"v1");
                let err = set(&file, name, b"v2", libc::XATTR_CREATE).unwrap_err();
                assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
                set(&file, name, b"v2", libc::XATTR_REPLACE).unwrap();
                assert_eq!(get(&file, name).unwrap(), b"v2");
                let names = list(&file).unwrap();
                assert!(names.split(|b| *b == 0).any(|n| n == b"user.projfs.test"));

                remove(&file, name).unwrap();
                assert_eq!(get(&file, name).unwrap_err().raw_os_error(), Some(libc::ENODATA));
                let err = set(&file, name, b"v3", libc::XATTR_REPLACE).unwrap_err();
                assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
            }
            // tmpfs without user xattrs, for instance
            Err(err) => assert_eq!(err.raw_os_error(), Some(libc::ENOTSUP)),
        }
    }
}
