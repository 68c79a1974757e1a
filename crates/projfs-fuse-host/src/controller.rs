// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount controller
//!
//! Applies intercepted operations to the lower store. Permission kinds
//! are dispatched first and never touch the store when denied;
//! notification kinds are dispatched after the store operation
//! succeeded. Pass-through operations resolve paths but dispatch nothing.
//!
//! All paths taken here are mount-relative. Caller pids are raw request
//! pids and are resolved to thread group ids.

use projfs_core::{
    check_safe_rel_path, Decision, DenyReason, Dispatched, Dispatcher, Operation, OperationKind,
};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, Metadata, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::fdtable::HandleTable;
use crate::proc_info::thread_group_id;
use crate::xattr;

/// Directory entry as listed from the lower store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub is_dir: bool,
    pub is_symlink: bool,
}

pub struct MountController {
    dispatcher: Arc<Dispatcher>,
    handles: HandleTable,
}

impl MountController {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            handles: HandleTable::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn lower_root(&self) -> &Path {
        self.dispatcher.context().paths().lower_root()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn lower(&self, path: &Path) -> ControllerResult<PathBuf> {
        Ok(self.dispatcher.context().paths().to_lower(path)?)
    }

    /// Dispatch a permission kind; a denial becomes an error
    fn permit(&self, op: Operation) -> ControllerResult<Dispatched> {
        let dispatched = self.dispatcher.dispatch_and_wait(&op)?;
        match dispatched.decision {
            Decision::Allow => Ok(dispatched),
            Decision::Deny(reason) => {
                debug!(kind = %op.kind(), path = %op.path().display(), %reason, "operation denied");
                Err(ControllerError::Denied(reason))
            }
            // dispatch_and_wait never hands back a pending decision
            Decision::Pending => Err(ControllerError::Denied(DenyReason::IoError)),
        }
    }

    /// Dispatch a notification after the store operation succeeded.
    /// Failures here are logged; the operation already happened.
    fn notify(&self, op: Operation) {
        if let Err(err) = self.dispatcher.dispatch(&op) {
            warn!(kind = %op.kind(), path = %op.path().display(), error = %err, "notification failed");
        }
    }

    // Pass-through

    pub fn getattr(&self, path: &Path) -> ControllerResult<Metadata> {
        Ok(fs::symlink_metadata(self.lower(path)?)?)
    }

    pub fn readlink(&self, path: &Path) -> ControllerResult<PathBuf> {
        Ok(fs::read_link(self.lower(path)?)?)
    }

    /// Entries sorted by name so offsets are stable across calls
    pub fn read_dir(&self, path: &Path) -> ControllerResult<Vec<DirEntryInfo>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.lower(path)?)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            entries.push(DirEntryInfo {
                name: entry.file_name(),
                is_dir: file_type.is_dir(),
                is_symlink: file_type.is_symlink(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn read(&self, fh: u64, offset: u64, size: usize) -> ControllerResult<Vec<u8>> {
        let handle = self.handles.get(fh).ok_or(ControllerError::BadHandle(fh))?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = handle.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> ControllerResult<usize> {
        let handle = self.handles.get(fh).ok_or(ControllerError::BadHandle(fh))?;
        handle.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> ControllerResult<()> {
        let handle = self.handles.get(fh).ok_or(ControllerError::BadHandle(fh))?;
        if datasync {
            handle.file.sync_data()?;
        } else {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> ControllerResult<()> {
        fs::set_permissions(self.lower(path)?, fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    pub fn truncate(&self, path: &Path, size: u64) -> ControllerResult<()> {
        let file = OpenOptions::new().write(true).open(self.lower(path)?)?;
        file.set_len(size)?;
        Ok(())
    }

    pub fn set_times(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ControllerResult<()> {
        let mut times = fs::FileTimes::new();
        if let Some(atime) = atime {
            times = times.set_accessed(atime);
        }
        if let Some(mtime) = mtime {
            times = times.set_modified(mtime);
        }
        let lower = self.lower(path)?;
        let file = if fs::metadata(&lower)?.is_dir() {
            File::open(&lower)?
        } else {
            OpenOptions::new().write(true).open(&lower)?
        };
        file.set_times(times)?;
        Ok(())
    }

    // Notification kinds

    pub fn mkdir(&self, path: &Path, mode: u32, pid: u32) -> ControllerResult<()> {
        fs::DirBuilder::new().mode(mode & 0o7777).create(self.lower(path)?)?;
        self.notify(Operation::new(OperationKind::CreateDir, path, thread_group_id(pid)));
        Ok(())
    }

    /// Create and open a new file; returns the handle
    pub fn create(&self, path: &Path, mode: u32, flags: i32, pid: u32) -> ControllerResult<u64> {
        let lower = self.lower(path)?;
        let file = open_options(flags | libc::O_CREAT)
            .mode(mode & 0o7777)
            .open(&lower)?;
        let tgid = thread_group_id(pid);
        let normalized = self.dispatcher.context().paths().normalize(path)?;
        let writable = has_write_mode(flags);
        let fh = self.handles.insert(file, &normalized, writable, tgid);
        self.notify(Operation::new(OperationKind::CreateFile, path, tgid));
        Ok(fh)
    }

    pub fn open(&self, path: &Path, flags: i32, pid: u32) -> ControllerResult<u64> {
        let lower = self.lower(path)?;
        let file = open_options(flags & !libc::O_NOFOLLOW).open(&lower)?;
        let tgid = thread_group_id(pid);
        let normalized = self.dispatcher.context().paths().normalize(path)?;
        let fh = self.handles.insert(file, &normalized, has_write_mode(flags), tgid);
        self.notify(Operation::new(OperationKind::Open, path, tgid));
        Ok(fh)
    }

    /// Writable handles are re-credited to the flushing process
    pub fn flush(&self, fh: u64, pid: u32) -> ControllerResult<()> {
        if self.handles.get(fh).is_none() {
            return Err(ControllerError::BadHandle(fh));
        }
        self.handles.refresh_owner(fh, thread_group_id(pid));
        Ok(())
    }

    /// Close a handle and report whether it could have modified the file
    pub fn release(&self, fh: u64) -> ControllerResult<()> {
        let handle = self.handles.remove(fh).ok_or(ControllerError::BadHandle(fh))?;
        let path = handle.path.clone();
        // last reference closes the descriptor
        drop(handle.file);
        self.notify(Operation::close(path, handle.writable, handle.owner));
        Ok(())
    }

    pub fn link(&self, path: &Path, new_path: &Path, pid: u32) -> ControllerResult<()> {
        fs::hard_link(self.lower(path)?, self.lower(new_path)?)?;
        self.notify(Operation::with_target(
            OperationKind::Link,
            path,
            new_path,
            thread_group_id(pid),
        ));
        Ok(())
    }

    pub fn symlink(&self, target: &Path, link_path: &Path, pid: u32) -> ControllerResult<()> {
        std::os::unix::fs::symlink(target, self.lower(link_path)?)?;
        self.notify(Operation::new(OperationKind::CreateFile, link_path, thread_group_id(pid)));
        Ok(())
    }

    // Permission kinds

    pub fn unlink(&self, path: &Path, pid: u32) -> ControllerResult<()> {
        let dispatched =
            self.permit(Operation::new(OperationKind::DeleteFile, path, thread_group_id(pid)))?;
        fs::remove_file(&dispatched.lower_path)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path, pid: u32) -> ControllerResult<()> {
        let dispatched =
            self.permit(Operation::new(OperationKind::DeleteDir, path, thread_group_id(pid)))?;
        fs::remove_dir(&dispatched.lower_path)?;
        Ok(())
    }

    pub fn rename(&self, from: &Path, to: &Path, pid: u32) -> ControllerResult<()> {
        let dispatched = self.permit(Operation::with_target(
            OperationKind::Rename,
            from,
            to,
            thread_group_id(pid),
        ))?;
        let target = match dispatched.lower_target {
            Some(target) => target,
            None => self.lower(to)?,
        };
        fs::rename(&dispatched.lower_path, target)?;
        Ok(())
    }

    // Extended attributes

    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> ControllerResult<()> {
        if xattr::is_reserved(name) {
            return Err(ControllerError::ReservedXattr(name.to_string_lossy().into_owned()));
        }
        Ok(xattr::set(&self.lower(path)?, name, value, flags)?)
    }

    pub fn getxattr(&self, path: &Path, name: &OsStr) -> ControllerResult<Vec<u8>> {
        Ok(xattr::get(&self.lower(path)?, name)?)
    }

    /// NUL-separated names
    pub fn listxattr(&self, path: &Path) -> ControllerResult<Vec<u8>> {
        Ok(xattr::list(&self.lower(path)?)?)
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> ControllerResult<()> {
        if xattr::is_reserved(name) {
            return Err(ControllerError::ReservedXattr(name.to_string_lossy().into_owned()));
        }
        Ok(xattr::remove(&self.lower(path)?, name)?)
    }

    // Provider helpers; these write the lower store directly and dispatch nothing

    pub fn create_proj_dir(&self, path: &Path, mode: u32) -> ControllerResult<()> {
        let lower = self.provider_path(path)?;
        fs::DirBuilder::new().mode(enforce_user_read(mode, true)).create(&lower)?;
        mark_unpopulated(&lower);
        Ok(())
    }

    pub fn create_proj_file(&self, path: &Path, size: u64, mode: u32) -> ControllerResult<()> {
        let lower = self.provider_path(path)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(enforce_user_read(mode, false))
            .open(&lower)?;
        if let Err(err) = file.set_len(size) {
            drop(file);
            let _ = fs::remove_file(&lower);
            return Err(err.into());
        }
        mark_unpopulated(&lower);
        Ok(())
    }

    pub fn create_proj_symlink(&self, path: &Path, target: &Path) -> ControllerResult<()> {
        let lower = self.provider_path(path)?;
        std::os::unix::fs::symlink(target, lower)?;
        Ok(())
    }

    fn provider_path(&self, path: &Path) -> ControllerResult<PathBuf> {
        if !check_safe_rel_path(path) {
            return Err(ControllerError::UnsafePath(path.to_path_buf()));
        }
        self.lower(path)
    }
}

/// Stamp the lower root as an empty projection root
pub fn mark_projection_root(lower_root: &Path) {
    if let Err(err) = xattr::set(
        lower_root,
        OsStr::new(xattr::PROJECTION_EMPTY_XATTR),
        &[],
        0,
    ) {
        warn!(
            lower = %lower_root.display(),
            error = %err,
            "could not set projection flag xattr"
        );
    }
}

fn mark_unpopulated(lower: &Path) {
    if let Err(err) = xattr::set(lower, OsStr::new(xattr::PROJECTION_EMPTY_XATTR), &[], 0) {
        debug!(path = %lower.display(), error = %err, "projection state xattr not set");
    }
}

/// Provider-created entries stay readable (and directories searchable)
/// by their owner
fn enforce_user_read(mode: u32, is_dir: bool) -> u32 {
    let mode = (mode & 0o7777) | 0o400;
    if is_dir {
        mode | 0o100
    } else {
        mode
    }
}

fn has_write_mode(flags: i32) -> bool {
    matches!(flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR)
}

fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    if flags & libc::O_CREAT != 0 {
        options.create(true);
    }
    if flags & libc::O_EXCL != 0 && flags & libc::O_CREAT != 0 {
        options.create_new(true);
    }
    if flags & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    let extra = flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_APPEND);
    options.custom_flags(extra);
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mode_detection() {
        assert!(has_write_mode(libc::O_WRONLY));
        assert!(has_write_mode(libc::O_RDWR | libc::O_APPEND));
        assert!(!has_write_mode(libc::O_RDONLY));
    }

    #[test]
    fn provider_entries_are_user_readable() {
        assert_eq!(enforce_user_read(0o000, false), 0o400);
        assert_eq!(enforce_user_read(0o644, false), 0o644);
        assert_eq!(enforce_user_read(0o000, true), 0o500);
        assert_eq!(enforce_user_read(0o40755, true), 0o755);
    }
}
