//! Kernel-facing filesystem: translates FUSE callbacks into remote calls.
//!
//! Writes go through the [`WriteBackCache`]; everything else goes straight to
//! the [`RemoteClient`]. Before any read, stat, or truncate of a path, the
//! pending writes of every handle open on that path are written back, so a
//! process always observes its own writes.

pub mod handle;
pub mod inode;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::consts::{FOPEN_DIRECT_IO, FOPEN_KEEP_CACHE, FOPEN_NONSEEKABLE};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use libc::c_int;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::client::{ClientError, RemoteClient, WriteBackCache};
use crate::net::Channel;
use crate::proto::{Attributes, OpenContext};
use handle::HandleTable;
use inode::InodeMap;

const TTL: Duration = Duration::from_secs(1);
const PREFERRED_IO_SIZE: u32 = 4096;

pub struct NetFs<C> {
    cache: Arc<WriteBackCache<C>>,
    inodes: Mutex<InodeMap>,
    handles: Mutex<HandleTable>,
}

impl<C: Channel> NetFs<C> {
    pub fn new(cache: Arc<WriteBackCache<C>>) -> Self {
        Self {
            cache,
            inodes: Mutex::new(InodeMap::new()),
            handles: Mutex::new(HandleTable::new()),
        }
    }

    fn client(&self) -> &RemoteClient<C> {
        self.cache.client()
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes
            .lock()
            .get_path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        // Names travel as UTF-8 strings.
        let name = name.to_str().ok_or(libc::EINVAL)?;
        self.inodes
            .lock()
            .child_path(parent, name)
            .ok_or(libc::ENOENT)
    }

    /// Path and context for an open handle. An unknown handle gets an
    /// unresolved context, so the server falls back to the path.
    fn open_file(
        &self,
        ino: u64,
        fh: u64,
        fallback_flags: i32,
    ) -> Result<(String, OpenContext), c_int> {
        if let Some(open) = self.handles.lock().get(fh) {
            return Ok((open.path, open.ctx));
        }
        Ok((self.path_of(ino)?, OpenContext::with_flags(fallback_flags)))
    }

    /// Write back pending data of every handle open on `path`.
    fn write_back_path(&self, path: &str) -> Result<(), ClientError> {
        let open: Vec<_> = {
            let handles = self.handles.lock();
            handles
                .handles_for(path)
                .into_iter()
                .filter_map(|fh| handles.get(fh))
                .collect()
        };
        for file in open {
            let mut ctx = file.ctx;
            let result = self.cache.write_back(path, &mut ctx);
            self.handles.lock().update(file.ctx.fh, ctx);
            result?;
        }
        Ok(())
    }

    fn file_attr(&self, path: &str, attrs: &Attributes) -> FileAttr {
        let ino = self.inodes.lock().get_or_insert(path);
        to_file_attr(ino, attrs)
    }

    fn stat(&self, path: &str) -> Result<FileAttr, c_int> {
        let attrs = self
            .client()
            .get_attributes(path, None)
            .map_err(|e| fail("getattr", path, e))?;
        Ok(self.file_attr(path, &attrs))
    }

    fn lookup_child(&self, parent: u64, name: &OsStr) -> Result<FileAttr, c_int> {
        let path = self.child_of(parent, name)?;
        self.stat(&path)
    }

    fn stat_ino(&self, ino: u64) -> Result<FileAttr, c_int> {
        let path = self.path_of(ino)?;
        if let Err(e) = self.write_back_path(&path) {
            warn!(path, error = %e, "Write-back before getattr failed, size may be stale");
        }
        self.stat(&path)
    }

    fn list_dir(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, c_int> {
        let path = self.path_of(ino)?;
        let entries = self
            .client()
            .read_directory(&path)
            .map_err(|e| fail("readdir", &path, e))?;

        let mut inodes = self.inodes.lock();
        let mut listing = Vec::with_capacity(entries.len() + 2);
        listing.push((ino, FileType::Directory, ".".to_string()));
        listing.push((inodes.parent_ino(&path), FileType::Directory, "..".to_string()));
        for entry in entries {
            let child = inodes.get_or_insert(&inode::join(&path, &entry.name));
            listing.push((child, file_type(entry.attr.mode), entry.name));
        }
        Ok(listing)
    }

    fn open_path(&self, ino: u64, flags: i32) -> Result<OpenContext, c_int> {
        let path = self.path_of(ino)?;
        let mut ctx = OpenContext::with_flags(flags);
        self.client()
            .open(&path, &mut ctx)
            .map_err(|e| fail("open", &path, e))?;
        debug!(path, fh = ctx.fh, flags, "Opened");
        self.handles.lock().insert(path, ctx);
        Ok(ctx)
    }

    fn create_child(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> Result<(FileAttr, OpenContext), c_int> {
        let path = self.child_of(parent, name)?;
        let mut ctx = OpenContext::with_flags(flags);
        self.client()
            .create(&path, mode, &mut ctx)
            .map_err(|e| fail("create", &path, e))?;

        let attr = match self.stat(&path) {
            Ok(attr) => attr,
            Err(errno) => {
                // The kernel never learns of this handle.
                if let Err(e) = self.client().release(&path, &mut ctx) {
                    fail("release", &path, e);
                }
                return Err(errno);
            }
        };
        debug!(path, fh = ctx.fh, "Created");
        self.handles.lock().insert(path, ctx);
        Ok((attr, ctx))
    }

    fn read_file(&self, ino: u64, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, c_int> {
        let (path, mut ctx) = self.open_file(ino, fh, libc::O_RDONLY)?;
        self.write_back_path(&path)
            .map_err(|e| fail("read", &path, e))?;
        if let Some(open) = self.handles.lock().get(fh) {
            ctx = open.ctx;
        }
        let result = self.client().read(&path, offset, size, &mut ctx);
        self.handles.lock().update(fh, ctx);
        result.map_err(|e| fail("read", &path, e))
    }

    fn write_file(&self, ino: u64, fh: u64, offset: u64, data: &[u8]) -> Result<u32, c_int> {
        let (path, mut ctx) = self.open_file(ino, fh, libc::O_WRONLY)?;
        let result = self.cache.write(&path, data, offset, &mut ctx);
        self.handles.lock().update(fh, ctx);
        result.map_err(|e| fail("write", &path, e))
    }

    fn truncate(&self, ino: u64, fh: Option<u64>, size: u64) -> Result<(), c_int> {
        let path = self.path_of(ino)?;
        // Buffered bytes past the new end would otherwise land after it.
        self.write_back_path(&path)
            .map_err(|e| fail("truncate", &path, e))?;

        let open = fh.and_then(|fh| self.handles.lock().get(fh));
        let mut ctx = match &open {
            Some(file) => file.ctx,
            None => OpenContext::with_flags(libc::O_WRONLY),
        };
        let result = self.client().truncate(&path, size, &mut ctx);
        if let Some(file) = &open {
            self.handles.lock().update(file.ctx.fh, ctx);
        }
        result.map_err(|e| fail("truncate", &path, e))
    }

    fn flush_file(&self, ino: u64, fh: u64, lock_owner: u64) -> Result<(), c_int> {
        let (path, mut ctx) = self.open_file(ino, fh, libc::O_RDONLY)?;
        ctx.flush = true;
        ctx.lock_owner = lock_owner;
        let result = self.cache.flush(&path, &mut ctx);
        self.handles.lock().update(fh, ctx);
        result.map_err(|e| fail("flush", &path, e))
    }

    fn fsync_file(&self, ino: u64, fh: u64, datasync: bool) -> Result<(), c_int> {
        let (path, mut ctx) = self.open_file(ino, fh, libc::O_RDONLY)?;
        let result = self.cache.fsync(&path, datasync, &mut ctx);
        self.handles.lock().update(fh, ctx);
        result.map_err(|e| fail("fsync", &path, e))
    }

    fn release_file(&self, fh: u64, flush: bool, lock_owner: Option<u64>) -> Result<(), c_int> {
        let Some(open) = self.handles.lock().release(fh) else {
            return Ok(());
        };
        let mut ctx = open.ctx;
        ctx.flush = flush;
        if let Some(owner) = lock_owner {
            ctx.lock_owner = owner;
        }
        debug!(path = %open.path, fh, "Releasing");
        self.cache
            .release(&open.path, &mut ctx)
            .map_err(|e| fail("release", &open.path, e))
    }

    fn rename_child(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<(), c_int> {
        let from = self.child_of(parent, name)?;
        let to = self.child_of(newparent, newname)?;
        self.client()
            .rename(&from, &to)
            .map_err(|e| fail("rename", &from, e))?;
        self.inodes.lock().rename(&from, &to);
        self.handles.lock().rename(&from, &to);
        Ok(())
    }

    fn remove_child(&self, parent: u64, name: &OsStr, dir: bool) -> Result<(), c_int> {
        let path = self.child_of(parent, name)?;
        let result = if dir {
            self.client().rmdir(&path)
        } else {
            self.client().unlink(&path)
        };
        result.map_err(|e| fail(if dir { "rmdir" } else { "unlink" }, &path, e))?;
        self.inodes.lock().remove_path(&path);
        Ok(())
    }
}

impl<C: Channel> Filesystem for NetFs<C> {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), c_int> {
        debug!("FUSE init");
        Ok(())
    }

    fn destroy(&mut self) {
        let open: Vec<u64> = {
            let handles = self.handles.lock();
            if handles.is_empty() {
                return;
            }
            handles.open_handles()
        };
        info!(count = open.len(), "Releasing handles left open at unmount");
        for fh in open {
            let _ = self.release_file(fh, true, None);
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_child(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.stat_ino(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if let Some(size) = size {
            if let Err(errno) = self.truncate(ino, fh, size) {
                reply.error(errno);
                return;
            }
        }
        if mode.is_some() || uid.is_some() || gid.is_some() || atime.is_some() || mtime.is_some() {
            debug!(ino, "Ignoring mode, owner and time changes");
        }
        match self.stat_ino(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let listing = match self.list_dir(ino) {
            Ok(listing) => listing,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (ino, kind, name)) in listing.iter().enumerate().skip(skip) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, name).and_then(|path| {
            self.client()
                .mkdir(&path, mode)
                .map_err(|e| fail("mkdir", &path, e))?;
            self.stat(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, name).and_then(|path| {
            self.client()
                .mknod(&path, mode, u64::from(rdev))
                .map_err(|e| fail("mknod", &path, e))?;
            self.stat(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_child(parent, name, mode, flags) {
            Ok((attr, ctx)) => reply.created(&TTL, &attr, 0, ctx.fh, open_reply_flags(&ctx)),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_path(ino, flags) {
            Ok(ctx) => reply.opened(ctx.fh, open_reply_flags(&ctx)),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.read_file(ino, fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.write_file(ino, fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        match self.flush_file(ino, fh, lock_owner) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.fsync_file(ino, fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.release_file(fh, flush, lock_owner) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_child(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_child(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE and friends have no remote counterpart.
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.rename_child(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }
}

/// Log a failed remote call and pick the errno for the kernel.
fn fail(op: &str, path: &str, e: ClientError) -> c_int {
    if e.is_transport() {
        warn!(op, path, error = %e, "Remote call did not complete");
    } else {
        debug!(op, path, error = %e, "Remote call failed");
    }
    e.errno()
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Kernel view of remote attributes. `ino` is the mount-local inode, not the
/// server's.
fn to_file_attr(ino: u64, attrs: &Attributes) -> FileAttr {
    let ctime = attrs.ctime.to_system_time();
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.blocks,
        atime: attrs.atime.to_system_time(),
        mtime: attrs.mtime.to_system_time(),
        ctime,
        crtime: ctime,
        kind: file_type(attrs.mode),
        perm: attrs.permissions(),
        nlink: u32::try_from(attrs.nlink).unwrap_or(u32::MAX),
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: attrs.rdev as u32,
        blksize: PREFERRED_IO_SIZE,
        flags: 0,
    }
}

fn open_reply_flags(ctx: &OpenContext) -> u32 {
    let mut flags = 0;
    if ctx.direct_io {
        flags |= FOPEN_DIRECT_IO;
    }
    if ctx.keep_cache {
        flags |= FOPEN_KEEP_CACHE;
    }
    if ctx.nonseekable {
        flags |= FOPEN_NONSEEKABLE;
    }
    flags
}
