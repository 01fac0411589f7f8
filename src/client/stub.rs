//! Typed client for the remote filesystem operations.
//!
//! Each method builds one request, performs one blocking call on the channel
//! and converts the response. Remote failures come back as
//! [`ClientError::Remote`] with the server's errno untouched; a call that did
//! not complete is [`ClientError::Transport`].
//!
//! Operations carrying an [`OpenContext`] copy the server's returned context
//! back into the caller's whenever the call completed, including when the
//! syscall itself failed.

use tracing::{debug, trace};

use super::{ClientError, ClientResult};
use crate::net::Channel;
use crate::proto::{
    Attributes, DirEntry, OpStatus, OpenContext, Request, Response, WireAttr, WireFileInfo,
};
use crate::NetFsError;

pub struct RemoteClient<C> {
    channel: C,
}

impl<C: Channel> RemoteClient<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> ClientResult<()> {
        self.status_call(Request::Mkdir {
            path: path.to_string(),
            mode,
        })
    }

    pub fn rmdir(&self, path: &str) -> ClientResult<()> {
        self.status_call(Request::Rmdir {
            path: path.to_string(),
        })
    }

    pub fn rename(&self, from: &str, to: &str) -> ClientResult<()> {
        self.status_call(Request::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    pub fn unlink(&self, path: &str) -> ClientResult<()> {
        self.status_call(Request::Unlink {
            path: path.to_string(),
        })
    }

    pub fn mknod(&self, path: &str, mode: u32, rdev: u64) -> ClientResult<()> {
        self.status_call(Request::Mknod {
            path: path.to_string(),
            mode,
            rdev,
        })
    }

    /// Open `path` with `ctx.flags`. On success `ctx.fh` holds the server's
    /// handle; on failure it is the unresolved sentinel.
    pub fn open(&self, path: &str, ctx: &mut OpenContext) -> ClientResult<()> {
        let request = Request::Open {
            path: path.to_string(),
            info: WireFileInfo::from(&*ctx),
        };
        self.opened_call(request, ctx)
    }

    /// Create and open `path`. `O_CREAT` is implied.
    pub fn create(&self, path: &str, mode: u32, ctx: &mut OpenContext) -> ClientResult<()> {
        let request = Request::Create {
            path: path.to_string(),
            mode,
            info: WireFileInfo::from(&*ctx),
        };
        self.opened_call(request, ctx)
    }

    /// Set the length of `path`, through `ctx.fh` when it is resolved.
    pub fn truncate(&self, path: &str, size: u64, ctx: &mut OpenContext) -> ClientResult<()> {
        let request = Request::Truncate {
            path: path.to_string(),
            size,
            info: WireFileInfo::from(&*ctx),
        };
        self.opened_call(request, ctx)
    }

    pub fn get_attributes(
        &self,
        path: &str,
        hint: Option<&Attributes>,
    ) -> ClientResult<Attributes> {
        let request = Request::GetAttributes {
            path: path.to_string(),
            hint: hint.map(WireAttr::from),
        };
        match self.call(request)? {
            Response::Attributes { attr, status } => {
                check_code(status)?;
                Ok(Attributes::from(&attr))
            }
            other => Err(unexpected("Attributes", &other)),
        }
    }

    /// Read up to `size` bytes at `offset`. Never returns more than requested.
    pub fn read(
        &self,
        path: &str,
        offset: u64,
        size: u32,
        ctx: &mut OpenContext,
    ) -> ClientResult<Vec<u8>> {
        let request = Request::Read {
            path: path.to_string(),
            offset,
            size,
            info: WireFileInfo::from(&*ctx),
        };
        match self.call(request)? {
            Response::Data {
                mut data,
                size: valid,
                info,
                status,
            } => {
                *ctx = OpenContext::from(&info);
                check_code(status)?;
                let len = data.len().min(valid as usize).min(size as usize);
                data.truncate(len);
                Ok(data)
            }
            other => Err(unexpected("Data", &other)),
        }
    }

    /// Write `data` at `offset` and return the server's byte count.
    /// `coalesced` marks a write assembled from several buffered writes.
    pub fn write(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        coalesced: bool,
        ctx: &mut OpenContext,
    ) -> ClientResult<u32> {
        let size = u32::try_from(data.len())
            .map_err(|_| NetFsError::MessageTooLarge(u32::MAX))?;
        let request = Request::Write {
            path: path.to_string(),
            coalesced,
            data: data.to_vec(),
            offset,
            size,
            info: WireFileInfo::from(&*ctx),
        };
        match self.call(request)? {
            Response::Written {
                written,
                info,
                status,
            } => {
                *ctx = OpenContext::from(&info);
                check_code(status)?;
                Ok(written)
            }
            other => Err(unexpected("Written", &other)),
        }
    }

    pub fn fsync(&self, path: &str, datasync: bool, ctx: &mut OpenContext) -> ClientResult<()> {
        let request = Request::Fsync {
            path: path.to_string(),
            datasync,
            info: WireFileInfo::from(&*ctx),
        };
        self.synced_call(request, ctx)
    }

    pub fn flush(&self, path: &str, ctx: &mut OpenContext) -> ClientResult<()> {
        let request = Request::Flush {
            path: path.to_string(),
            info: WireFileInfo::from(&*ctx),
        };
        self.synced_call(request, ctx)
    }

    /// Close the server-side descriptor behind `ctx.fh`.
    pub fn release(&self, path: &str, ctx: &mut OpenContext) -> ClientResult<()> {
        let request = Request::Release {
            path: path.to_string(),
            info: WireFileInfo::from(&*ctx),
        };
        self.synced_call(request, ctx)
    }

    /// List `path`, excluding `.` and `..`. Order is whatever the server's
    /// directory enumeration produced.
    pub fn read_directory(&self, path: &str) -> ClientResult<Vec<DirEntry>> {
        let request = Request::ReadDirectory {
            path: path.to_string(),
        };
        match self.call(request)? {
            Response::Directory { status, entries } => {
                check_code(status)?;
                Ok(entries.iter().map(DirEntry::from).collect())
            }
            other => Err(unexpected("Directory", &other)),
        }
    }

    fn call(&self, request: Request) -> ClientResult<Response> {
        let op = request.op_name();
        trace!(op, "Sending request");
        self.channel.call(&request).map_err(|e| {
            debug!(op, error = %e, "Call did not complete");
            ClientError::Transport(e)
        })
    }

    fn status_call(&self, request: Request) -> ClientResult<()> {
        match self.call(request)? {
            Response::Status(status) => check_status(status),
            other => Err(unexpected("Status", &other)),
        }
    }

    fn opened_call(&self, request: Request, ctx: &mut OpenContext) -> ClientResult<()> {
        match self.call(request)? {
            Response::Opened { info, status } => {
                *ctx = OpenContext::from(&info);
                check_status(status)
            }
            other => Err(unexpected("Opened", &other)),
        }
    }

    fn synced_call(&self, request: Request, ctx: &mut OpenContext) -> ClientResult<()> {
        match self.call(request)? {
            Response::Synced { status, info } => {
                *ctx = OpenContext::from(&info);
                check_code(status)
            }
            other => Err(unexpected("Synced", &other)),
        }
    }
}

fn check_status(status: OpStatus) -> ClientResult<()> {
    if status.success {
        Ok(())
    } else {
        Err(ClientError::Remote {
            errno: status.errno,
        })
    }
}

fn check_code(code: i32) -> ClientResult<()> {
    if code < 0 {
        Err(ClientError::Remote { errno: -code })
    } else {
        Ok(())
    }
}

fn unexpected(expected: &str, got: &Response) -> ClientError {
    ClientError::Transport(NetFsError::UnexpectedMessage(format!(
        "expected {expected}, got {}",
        got.shape_name()
    )))
}
