// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Projfs FUSE adapter
//!
//! Maps kernel requests onto [`MountController`] calls. Inode numbers are
//! allocated here and only live as long as the session. Deletions and
//! renames wait on the provider, so they are answered from request
//! workers; every other request is served on the session thread.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, ReplyXattr, Request as FuseRequest, TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, ENAMETOOLONG, ENOENT, ERANGE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::controller::MountController;
use crate::error::ControllerError;
use crate::request_pool::{Request, RequestPool};

/// Maximum single path component length to guard against overly long names
const NAME_MAX: usize = 255;

/// Attribute and entry cache lifetime handed to the kernel
const TTL: Duration = Duration::from_secs(1);

/// Inode numbers handed to the kernel and the mount-relative paths behind
/// them. Shared with request workers, which re-key it after a reply.
pub(crate) struct InodeTable {
    inodes: HashMap<u64, PathBuf>,
    paths: HashMap<PathBuf, u64>,
    next_inode: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();
        inodes.insert(FUSE_ROOT_ID, PathBuf::new());
        paths.insert(PathBuf::new(), FUSE_ROOT_ID);
        Self {
            inodes,
            paths,
            next_inode: FUSE_ROOT_ID + 1,
        }
    }

    fn path(&self, ino: u64) -> Option<&Path> {
        self.inodes.get(&ino).map(PathBuf::as_path)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf, c_int> {
        if name.as_bytes().len() > NAME_MAX {
            return Err(ENAMETOOLONG);
        }
        let parent = self.path(parent).ok_or(ENOENT)?;
        Ok(parent.join(name))
    }

    fn get_or_alloc(&mut self, path: &Path) -> u64 {
        if let Some(&inode) = self.paths.get(path) {
            return inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(path.to_path_buf(), inode);
        self.inodes.insert(inode, path.to_path_buf());
        inode
    }

    fn forget(&mut self, inode: u64) {
        if inode == FUSE_ROOT_ID {
            return;
        }
        if let Some(path) = self.inodes.remove(&inode) {
            self.paths.remove(&path);
        }
    }

    fn drop_path(&mut self, path: &Path) {
        if let Some(inode) = self.paths.remove(path) {
            self.inodes.remove(&inode);
        }
    }

    /// Re-key a renamed entry and everything below it
    fn move_paths(&mut self, from: &Path, to: &Path) {
        self.drop_path(to);
        let moved: Vec<(PathBuf, u64)> = self
            .paths
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let new = match old.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            self.paths.remove(&old);
            self.paths.insert(new.clone(), ino);
            self.inodes.insert(ino, new);
        }
    }
}

pub struct ProjfsFuse {
    controller: Arc<MountController>,
    table: Arc<Mutex<InodeTable>>,
    /// Carries permission requests off the session thread
    requests: RequestPool,
}

impl ProjfsFuse {
    pub fn new(controller: Arc<MountController>, request_threads: usize) -> Self {
        Self {
            controller,
            table: Arc::new(Mutex::new(InodeTable::new())),
            requests: RequestPool::new(request_threads),
        }
    }

    fn inode_path(&self, ino: u64) -> Result<PathBuf, c_int> {
        self.table.lock().path(ino).map(Path::to_path_buf).ok_or(ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf, c_int> {
        self.table.lock().child_path(parent, name)
    }

    fn entry_attr(&self, path: &Path) -> Result<FileAttr, ControllerError> {
        let metadata = self.controller.getattr(path)?;
        let ino = self.table.lock().get_or_alloc(path);
        Ok(metadata_to_attr(&metadata, ino))
    }

    /// Run a permission request on a worker; `apply` performs it and
    /// `settle` updates the inode table once it succeeded
    fn defer<A, S>(&self, reply: ReplyEmpty, apply: A, settle: S)
    where
        A: FnOnce(&MountController) -> Result<(), ControllerError> + Send + 'static,
        S: FnOnce(&mut InodeTable) + Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        let table = Arc::clone(&self.table);
        let request: Request = Box::new(move || match apply(controller.as_ref()) {
            Ok(()) => {
                settle(&mut *table.lock());
                reply.ok();
            }
            Err(err) => {
                debug!(error = %err, errno = err.errno(), "request failed");
                reply.error(err.errno());
            }
        });
        if let Err(request) = self.requests.submit(request) {
            warn!("request workers unavailable; serving on the session thread");
            request();
        }
    }
}

fn metadata_to_attr(metadata: &Metadata, ino: u64) -> FileAttr {
    let to_system_time = |secs: i64, nanos: i64| {
        SystemTime::UNIX_EPOCH
            + Duration::from_secs(secs.max(0) as u64)
            + Duration::from_nanos(nanos.max(0) as u64)
    };
    FileAttr {
        ino,
        size: metadata.size(),
        blocks: metadata.blocks(),
        atime: to_system_time(metadata.atime(), metadata.atime_nsec()),
        mtime: to_system_time(metadata.mtime(), metadata.mtime_nsec()),
        ctime: to_system_time(metadata.ctime(), metadata.ctime_nsec()),
        crtime: to_system_time(metadata.ctime(), metadata.ctime_nsec()),
        kind: file_type(metadata.file_type()),
        perm: (metadata.mode() & 0o7777) as u16,
        nlink: metadata.nlink() as u32,
        uid: metadata.uid(),
        gid: metadata.gid(),
        rdev: metadata.rdev() as u32,
        blksize: metadata.blksize() as u32,
        flags: 0,
    }
}

fn file_type(ft: std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn resolve_time(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|t| match t {
        TimeOrNow::SpecificTime(at) => at,
        TimeOrNow::Now => SystemTime::now(),
    })
}

/// Shared size negotiation for getxattr/listxattr replies
fn reply_xattr(reply: ReplyXattr, size: u32, value: Vec<u8>) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() <= size as usize {
        reply.data(&value);
    } else {
        reply.error(ERANGE);
    }
}

macro_rules! try_reply {
    ($reply:ident, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(errno) => {
                $reply.error(errno);
                return;
            }
        }
    };
}

macro_rules! try_op {
    ($reply:ident, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => {
                let err: ControllerError = err;
                debug!(error = %err, errno = err.errno(), "request failed");
                $reply.error(err.errno());
                return;
            }
        }
    };
}

impl fuser::Filesystem for ProjfsFuse {
    fn init(&mut self, _req: &FuseRequest, _config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        info!(lower = %self.controller.lower_root().display(), "projfs FUSE adapter initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.requests.shutdown();
        info!("projfs FUSE adapter destroyed");
    }

    fn forget(&mut self, _req: &FuseRequest, ino: u64, _nlookup: u64) {
        self.table.lock().forget(ino);
    }

    fn lookup(&mut self, _req: &FuseRequest, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = try_reply!(reply, self.child_path(parent, name));
        let attr = try_op!(reply, self.entry_attr(&path));
        reply.entry(&TTL, &attr, 0);
    }

    fn getattr(&mut self, _req: &FuseRequest, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = try_reply!(reply, self.inode_path(ino));
        let metadata = try_op!(reply, self.controller.getattr(&path));
        reply.attr(&TTL, &metadata_to_attr(&metadata, ino));
    }

    fn setattr(
        &mut self,
        _req: &FuseRequest,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = try_reply!(reply, self.inode_path(ino));
        if let Some(mode) = mode {
            try_op!(reply, self.controller.chmod(&path, mode));
        }
        if let Some(size) = size {
            try_op!(reply, self.controller.truncate(&path, size));
        }
        if atime.is_some() || mtime.is_some() {
            try_op!(
                reply,
                self.controller.set_times(&path, resolve_time(atime), resolve_time(mtime))
            );
        }
        let metadata = try_op!(reply, self.controller.getattr(&path));
        reply.attr(&TTL, &metadata_to_attr(&metadata, ino));
    }

    fn readlink(&mut self, _req: &FuseRequest, ino: u64, reply: ReplyData) {
        let path = try_reply!(reply, self.inode_path(ino));
        let target = try_op!(reply, self.controller.readlink(&path));
        reply.data(target.as_os_str().as_bytes());
    }

    fn readdir(
        &mut self,
        _req: &FuseRequest,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = try_reply!(reply, self.inode_path(ino));
        let entries = try_op!(reply, self.controller.read_dir(&path));

        let mut table = self.table.lock();
        let parent_ino = match path.parent() {
            Some(parent) => table.get_or_alloc(parent),
            None => FUSE_ROOT_ID,
        };
        let mut listing = vec![
            (ino, FileType::Directory, OsStr::new(".").to_os_string()),
            (parent_ino, FileType::Directory, OsStr::new("..").to_os_string()),
        ];
        for entry in entries {
            let entry_ino = table.get_or_alloc(&path.join(&entry.name));
            let kind = if entry.is_dir {
                FileType::Directory
            } else if entry.is_symlink {
                FileType::Symlink
            } else {
                FileType::RegularFile
            };
            listing.push((entry_ino, kind, entry.name));
        }
        drop(table);

        for (i, (entry_ino, kind, name)) in listing.iter().enumerate().skip(offset as usize) {
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        req: &FuseRequest,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.child_path(parent, name));
        try_op!(reply, self.controller.mkdir(&path, mode & !umask, req.pid()));
        let attr = try_op!(reply, self.entry_attr(&path));
        reply.entry(&TTL, &attr, 0);
    }

    fn unlink(&mut self, req: &FuseRequest, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.child_path(parent, name));
        let pid = req.pid();
        let removed = path.clone();
        self.defer(
            reply,
            move |controller| controller.unlink(&path, pid),
            move |table| table.drop_path(&removed),
        );
    }

    fn rmdir(&mut self, req: &FuseRequest, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.child_path(parent, name));
        let pid = req.pid();
        let removed = path.clone();
        self.defer(
            reply,
            move |controller| controller.rmdir(&path, pid),
            move |table| table.drop_path(&removed),
        );
    }

    fn symlink(
        &mut self,
        req: &FuseRequest,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.child_path(parent, link_name));
        try_op!(reply, self.controller.symlink(target, &path, req.pid()));
        let attr = try_op!(reply, self.entry_attr(&path));
        reply.entry(&TTL, &attr, 0);
    }

    fn rename(
        &mut self,
        req: &FuseRequest,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = try_reply!(reply, self.child_path(parent, name));
        let to = try_reply!(reply, self.child_path(newparent, newname));
        let pid = req.pid();
        let (moved_from, moved_to) = (from.clone(), to.clone());
        self.defer(
            reply,
            move |controller| controller.rename(&from, &to, pid),
            move |table| table.move_paths(&moved_from, &moved_to),
        );
    }

    fn link(
        &mut self,
        req: &FuseRequest,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.inode_path(ino));
        let new_path = try_reply!(reply, self.child_path(newparent, newname));
        try_op!(reply, self.controller.link(&path, &new_path, req.pid()));
        let attr = try_op!(reply, self.entry_attr(&new_path));
        reply.entry(&TTL, &attr, 0);
    }

    fn open(&mut self, req: &FuseRequest, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = try_reply!(reply, self.inode_path(ino));
        let fh = try_op!(reply, self.controller.open(&path, flags, req.pid()));
        reply.opened(fh, 0);
    }

    fn create(
        &mut self,
        req: &FuseRequest,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = try_reply!(reply, self.child_path(parent, name));
        let fh = try_op!(reply, self.controller.create(&path, mode & !umask, flags, req.pid()));
        let attr = try_op!(reply, self.entry_attr(&path));
        reply.created(&TTL, &attr, 0, fh, 0);
    }

    fn read(
        &mut self,
        _req: &FuseRequest,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let data = try_op!(reply, self.controller.read(fh, offset.max(0) as u64, size as usize));
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &FuseRequest,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let written = try_op!(reply, self.controller.write(fh, offset.max(0) as u64, data));
        reply.written(written as u32);
    }

    fn flush(&mut self, req: &FuseRequest, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        try_op!(reply, self.controller.flush(fh, req.pid()));
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &FuseRequest,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        try_op!(reply, self.controller.release(fh));
        reply.ok();
    }

    fn fsync(&mut self, _req: &FuseRequest, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        try_op!(reply, self.controller.fsync(fh, datasync));
        reply.ok();
    }

    fn setxattr(
        &mut self,
        _req: &FuseRequest,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = try_reply!(reply, self.inode_path(ino));
        try_op!(reply, self.controller.setxattr(&path, name, value, flags));
        reply.ok();
    }

    fn getxattr(&mut self, _req: &FuseRequest, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = try_reply!(reply, self.inode_path(ino));
        let value = try_op!(reply, self.controller.getxattr(&path, name));
        reply_xattr(reply, size, value);
    }

    fn listxattr(&mut self, _req: &FuseRequest, ino: u64, size: u32, reply: ReplyXattr) {
        let path = try_reply!(reply, self.inode_path(ino));
        let names = try_op!(reply, self.controller.listxattr(&path));
        reply_xattr(reply, size, names);
    }

    fn removexattr(&mut self, _req: &FuseRequest, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.inode_path(ino));
        try_op!(reply, self.controller.removexattr(&path, name));
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_names_are_rejected() {
        let table = InodeTable::new();
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(table.child_path(FUSE_ROOT_ID, OsStr::new(&long)), Err(ENAMETOOLONG));
        assert_eq!(table.child_path(99, OsStr::new("a")), Err(ENOENT));
        assert_eq!(table.child_path(FUSE_ROOT_ID, OsStr::new("a")), Ok(PathBuf::from("a")));
    }

    #[test]
    fn rename_rekeys_descendants() {
        let mut table = InodeTable::new();
        let dir_ino = table.get_or_alloc(Path::new("d"));
        let file_ino = table.get_or_alloc(Path::new("d/f"));
        table.move_paths(Path::new("d"), Path::new("e"));
        assert_eq!(table.path(dir_ino), Some(Path::new("e")));
        assert_eq!(table.path(file_ino), Some(Path::new("e/f")));
        assert!(!table.paths.contains_key(Path::new("d/f")));
    }

    #[test]
    fn root_is_never_forgotten() {
        let mut table = InodeTable::new();
        table.forget(FUSE_ROOT_ID);
        assert_eq!(table.path(FUSE_ROOT_ID), Some(Path::new("")));
        let ino = table.get_or_alloc(Path::new("a"));
        table.forget(ino);
        assert_eq!(table.path(ino), None);
    }
}
