//! Request/response messages exchanged between the client and the server.
//!
//! Paths are always relative to the server's base path and start with `/`.

pub mod attr;

use serde::{Deserialize, Serialize};

pub use attr::{Attributes, DirEntry, OpenContext, Timespec, WireAttr, WireDirEntry, WireFileInfo};

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// One variant per protocol operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// First message on every connection.
    Hello { protocol_version: u32 },

    Mkdir { path: String, mode: u32 },

    Rmdir { path: String },

    Rename { from: String, to: String },

    Open { path: String, info: WireFileInfo },

    Create {
        path: String,
        mode: u32,
        info: WireFileInfo,
    },

    Truncate {
        path: String,
        size: u64,
        info: WireFileInfo,
    },

    Unlink { path: String },

    Mknod { path: String, mode: u32, rdev: u64 },

    /// `hint` is the caller's current view of the attributes, if it has one.
    GetAttributes {
        path: String,
        hint: Option<WireAttr>,
    },

    Read {
        path: String,
        offset: u64,
        size: u32,
        info: WireFileInfo,
    },

    Write {
        path: String,
        /// True when `data` is several local writes coalesced by the cache.
        coalesced: bool,
        data: Vec<u8>,
        offset: u64,
        size: u32,
        info: WireFileInfo,
    },

    Fsync {
        path: String,
        datasync: bool,
        info: WireFileInfo,
    },

    Flush { path: String, info: WireFileInfo },

    Release { path: String, info: WireFileInfo },

    ReadDirectory { path: String },
}

impl Request {
    /// Short operation name for logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Mkdir { .. } => "mkdir",
            Request::Rmdir { .. } => "rmdir",
            Request::Rename { .. } => "rename",
            Request::Open { .. } => "open",
            Request::Create { .. } => "create",
            Request::Truncate { .. } => "truncate",
            Request::Unlink { .. } => "unlink",
            Request::Mknod { .. } => "mknod",
            Request::GetAttributes { .. } => "get_attributes",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Fsync { .. } => "fsync",
            Request::Flush { .. } => "flush",
            Request::Release { .. } => "release",
            Request::ReadDirectory { .. } => "read_directory",
        }
    }
}

/// Outcome of a syscall as (success flag, errno).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStatus {
    pub success: bool,
    pub errno: i32,
}

impl OpStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            errno: 0,
        }
    }

    pub fn failed(errno: i32) -> Self {
        Self {
            success: false,
            errno,
        }
    }

    /// Status code form: 0 on success, `-errno` on failure.
    pub fn code(&self) -> i32 {
        if self.success {
            0
        } else {
            -self.errno
        }
    }
}

/// Response shapes. Each request has exactly one expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Hello { protocol_version: u32 },

    /// mkdir, rmdir, rename, unlink, mknod.
    Status(OpStatus),

    /// open, create, truncate.
    Opened { info: WireFileInfo, status: OpStatus },

    /// get_attributes. `status` is 0 or `-errno`.
    Attributes { attr: WireAttr, status: i32 },

    /// read. `size` is the count of valid bytes in `data`.
    Data {
        data: Vec<u8>,
        size: u32,
        info: WireFileInfo,
        status: i32,
    },

    /// write.
    Written {
        written: u32,
        info: WireFileInfo,
        status: i32,
    },

    /// fsync, flush, release.
    Synced { status: i32, info: WireFileInfo },

    /// read_directory.
    Directory {
        status: i32,
        entries: Vec<WireDirEntry>,
    },
}

impl Response {
    pub fn shape_name(&self) -> &'static str {
        match self {
            Response::Hello { .. } => "Hello",
            Response::Status(_) => "Status",
            Response::Opened { .. } => "Opened",
            Response::Attributes { .. } => "Attributes",
            Response::Data { .. } => "Data",
            Response::Written { .. } => "Written",
            Response::Synced { .. } => "Synced",
            Response::Directory { .. } => "Directory",
        }
    }
}
