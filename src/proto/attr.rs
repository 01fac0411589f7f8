//! Conversions between local POSIX-side structures and their wire forms.
//!
//! Every wire type here has a matching local type and a pair of total
//! conversions. Wire input comes from our own peer, so there is no validation
//! step: a malformed value converts to a malformed value.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::UNRESOLVED_HANDLE;

/// Per-open-file context: open flags, the server-assigned handle, and the
/// per-open flags the server side replicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenContext {
    pub flags: i32,
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
    pub nonseekable: bool,
    /// Set by the mount layer when the kernel requests a flush on this open.
    pub flush: bool,
    pub lock_owner: u64,
}

impl OpenContext {
    /// A fresh context for `open`/`create` with no handle assigned yet.
    pub fn with_flags(flags: i32) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// A context for operations on an already opened handle.
    pub fn for_handle(fh: u64, flags: i32) -> Self {
        Self {
            flags,
            fh,
            ..Self::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.fh != UNRESOLVED_HANDLE
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFileInfo {
    pub flags: i32,
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
    pub nonseekable: bool,
    pub flush: bool,
    pub lock_owner: u64,
}

impl From<&OpenContext> for WireFileInfo {
    fn from(ctx: &OpenContext) -> Self {
        Self {
            flags: ctx.flags,
            fh: ctx.fh,
            direct_io: ctx.direct_io,
            keep_cache: ctx.keep_cache,
            nonseekable: ctx.nonseekable,
            flush: ctx.flush,
            lock_owner: ctx.lock_owner,
        }
    }
}

impl From<&WireFileInfo> for OpenContext {
    fn from(info: &WireFileInfo) -> Self {
        Self {
            flags: info.flags,
            fh: info.fh,
            direct_io: info.direct_io,
            keep_cache: info.keep_cache,
            nonseekable: info.nonseekable,
            flush: info.flush,
            lock_owner: info.lock_owner,
        }
    }
}

/// Timestamp with second + nanosecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: u32,
}

impl Timespec {
    pub fn to_system_time(self) -> SystemTime {
        if self.secs >= 0 {
            UNIX_EPOCH + Duration::new(self.secs as u64, self.nanos)
        } else {
            UNIX_EPOCH - Duration::new(self.secs.unsigned_abs(), 0) + Duration::new(0, self.nanos)
        }
    }

    fn from_parts(secs: i64, nanos: i64) -> Self {
        Self {
            secs,
            nanos: nanos.clamp(0, 999_999_999) as u32,
        }
    }
}

/// The stat projection carried across the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attributes {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Device holding the file.
    pub dev: u64,
    /// Device id for character/block special files.
    pub rdev: u64,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl Attributes {
    /// Project an lstat/stat result onto the carried subset.
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            dev: meta.dev(),
            rdev: meta.rdev(),
            blocks: meta.blocks(),
            atime: Timespec::from_parts(meta.atime(), meta.atime_nsec()),
            mtime: Timespec::from_parts(meta.mtime(), meta.mtime_nsec()),
            ctime: Timespec::from_parts(meta.ctime(), meta.ctime_nsec()),
        }
    }

    /// The `S_IFMT` bits of `mode`.
    pub fn file_type_bits(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type_bits() == libc::S_IFDIR
    }

    /// Permission bits including setuid/setgid/sticky.
    pub fn permissions(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAttr {
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_dev: u64,
    pub st_rdev: u64,
    pub st_blocks: u64,
    pub st_atime: i64,
    pub st_atime_nsec: u32,
    pub st_mtime: i64,
    pub st_mtime_nsec: u32,
    pub st_ctime: i64,
    pub st_ctime_nsec: u32,
}

impl From<&Attributes> for WireAttr {
    fn from(attr: &Attributes) -> Self {
        Self {
            st_ino: attr.ino,
            st_mode: attr.mode,
            st_nlink: attr.nlink,
            st_uid: attr.uid,
            st_gid: attr.gid,
            st_size: attr.size,
            st_dev: attr.dev,
            st_rdev: attr.rdev,
            st_blocks: attr.blocks,
            st_atime: attr.atime.secs,
            st_atime_nsec: attr.atime.nanos,
            st_mtime: attr.mtime.secs,
            st_mtime_nsec: attr.mtime.nanos,
            st_ctime: attr.ctime.secs,
            st_ctime_nsec: attr.ctime.nanos,
        }
    }
}

impl From<&WireAttr> for Attributes {
    fn from(wire: &WireAttr) -> Self {
        Self {
            ino: wire.st_ino,
            mode: wire.st_mode,
            nlink: wire.st_nlink,
            uid: wire.st_uid,
            gid: wire.st_gid,
            size: wire.st_size,
            dev: wire.st_dev,
            rdev: wire.st_rdev,
            blocks: wire.st_blocks,
            atime: Timespec {
                secs: wire.st_atime,
                nanos: wire.st_atime_nsec,
            },
            mtime: Timespec {
                secs: wire.st_mtime,
                nanos: wire.st_mtime_nsec,
            },
            ctime: Timespec {
                secs: wire.st_ctime,
                nanos: wire.st_ctime_nsec,
            },
        }
    }
}

/// One member of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attr: Attributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDirEntry {
    pub name: String,
    pub attr: WireAttr,
}

impl From<&DirEntry> for WireDirEntry {
    fn from(entry: &DirEntry) -> Self {
        Self {
            name: entry.name.clone(),
            attr: WireAttr::from(&entry.attr),
        }
    }
}

impl From<&WireDirEntry> for DirEntry {
    fn from(wire: &WireDirEntry) -> Self {
        Self {
            name: wire.name.clone(),
            attr: Attributes::from(&wire.attr),
        }
    }
}
