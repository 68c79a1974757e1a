// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open file handles on the lower store
//!
//! Writable handles remember the process that opened them so that the
//! eventual `close_modify` is attributed to it, even when the kernel
//! delivers the release on an unrelated thread.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct OpenHandle {
    pub file: Arc<File>,
    /// Normalized mount-relative path at open time
    pub path: PathBuf,
    pub writable: bool,
    /// Thread group id credited with the handle
    pub owner: u32,
}

#[derive(Debug)]
pub struct HandleTable {
    next: Mutex<u64>,
    entries: Mutex<HashMap<u64, OpenHandle>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            // 0 is never handed out
            next: Mutex::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file: File, path: &Path, writable: bool, owner: u32) -> u64 {
        let fh = {
            let mut next = self.next.lock();
            let fh = *next;
            *next = next.saturating_add(1);
            fh
        };
        self.entries.lock().insert(
            fh,
            OpenHandle {
                file: Arc::new(file),
                path: path.to_path_buf(),
                writable,
                owner,
            },
        );
        fh
    }

    pub fn get(&self, fh: u64) -> Option<OpenHandle> {
        self.entries.lock().get(&fh).cloned()
    }

    /// Credit a writable handle to `owner` (flush from another process)
    pub fn refresh_owner(&self, fh: u64, owner: u32) -> bool {
        match self.entries.lock().get_mut(&fh) {
            Some(handle) if handle.writable => {
                handle.owner = owner;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, fh: u64) -> Option<OpenHandle> {
        self.entries.lock().remove(&fh)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_owner_of_writable_handles() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("f")).unwrap();
        let table = HandleTable::new();
        let fh = table.insert(file, Path::new("f"), true, 100);
        assert_ne!(fh, 0);
        assert!(table.refresh_owner(fh, 200));
        let handle = table.remove(fh).unwrap();
        assert_eq!(handle.owner, 200);
        assert!(table.is_empty());
    }

    #[test]
    fn read_only_handles_keep_their_opener() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let table = HandleTable::new();
        let fh = table.insert(File::open(dir.path().join("f")).unwrap(), Path::new("f"), false, 7);
        assert!(!table.refresh_owner(fh, 8));
        assert_eq!(table.get(fh).unwrap().owner, 7);
        assert!(!table.refresh_owner(fh + 1, 8));
    }
}
