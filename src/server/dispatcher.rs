//! Executes one filesystem syscall per request against `base_path + path`.
//!
//! Paths are joined by plain concatenation. No canonicalization or `..`
//! filtering happens here: the base path scopes requests, it does not confine
//! them.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};

use nix::sys::stat::{Mode, SFlag};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::handle::FileTable;
use crate::net::protocol::MAX_PAYLOAD_SIZE;
use crate::proto::{
    Attributes, DirEntry, OpStatus, Request, Response, WireAttr, WireDirEntry, WireFileInfo,
    PROTOCOL_VERSION,
};
use crate::UNRESOLVED_HANDLE;

/// Upper bound on a single read so the response fits in one frame.
pub const MAX_READ_SIZE: u32 = MAX_PAYLOAD_SIZE;

pub struct Dispatcher {
    base: String,
    files: Mutex<FileTable>,
}

fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn status_of(result: io::Result<()>) -> OpStatus {
    match result {
        Ok(()) => OpStatus::ok(),
        Err(e) => OpStatus::failed(errno_of(&e)),
    }
}

fn code_of<T>(result: &io::Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => -errno_of(e),
    }
}

fn bad_handle() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

impl Dispatcher {
    pub fn new(base_path: impl Into<String>) -> Self {
        let base: String = base_path.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
            files: Mutex::new(FileTable::new()),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base
    }

    /// Number of descriptors currently held for clients.
    pub fn open_files(&self) -> usize {
        self.files.lock().len()
    }

    fn resolve(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Handle one request. Never fails: syscall errors travel in the response.
    pub fn dispatch(&self, request: Request) -> Response {
        debug!(op = request.op_name(), "Dispatching request");
        match request {
            Request::Hello { protocol_version } => {
                debug!(protocol_version, "Hello from client");
                Response::Hello {
                    protocol_version: PROTOCOL_VERSION,
                }
            }
            Request::Mkdir { path, mode } => Response::Status(status_of(
                DirBuilder::new().mode(mode).create(self.resolve(&path)),
            )),
            Request::Rmdir { path } => {
                Response::Status(status_of(fs::remove_dir(self.resolve(&path))))
            }
            Request::Rename { from, to } => Response::Status(status_of(fs::rename(
                self.resolve(&from),
                self.resolve(&to),
            ))),
            Request::Unlink { path } => {
                Response::Status(status_of(fs::remove_file(self.resolve(&path))))
            }
            Request::Mknod { path, mode, rdev } => Response::Status(self.mknod(&path, mode, rdev)),
            Request::Open { path, info } => self.open(&path, info.flags, None, info),
            Request::Create { path, mode, info } => {
                self.open(&path, info.flags | libc::O_CREAT, Some(mode), info)
            }
            Request::Truncate { path, size, info } => self.truncate(&path, size, info),
            Request::GetAttributes { path, hint } => self.get_attributes(&path, hint),
            Request::Read {
                path,
                offset,
                size,
                info,
            } => self.read(&path, offset, size, info),
            Request::Write {
                path,
                coalesced,
                data,
                offset,
                size,
                info,
            } => self.write(&path, coalesced, &data, offset, size, info),
            Request::Fsync {
                path,
                datasync,
                info,
            } => {
                let result = self.with_file(&path, info.fh, libc::O_RDONLY, |file| {
                    if datasync {
                        file.sync_data()
                    } else {
                        file.sync_all()
                    }
                });
                Response::Synced {
                    status: code_of(&result),
                    info,
                }
            }
            Request::Flush { info, .. } => {
                // Nothing is buffered server side; only the handle is checked.
                let known =
                    info.fh == UNRESOLVED_HANDLE || self.files.lock().get(info.fh).is_some();
                let result = if known {
                    Ok(())
                } else {
                    Err(bad_handle())
                };
                Response::Synced {
                    status: code_of(&result),
                    info,
                }
            }
            Request::Release { info, .. } => {
                let result = if info.fh == UNRESOLVED_HANDLE {
                    Ok(())
                } else {
                    self.files.lock().release(info.fh).map(|_| ()).ok_or_else(bad_handle)
                };
                Response::Synced {
                    status: code_of(&result),
                    info,
                }
            }
            Request::ReadDirectory { path } => self.read_directory(&path),
        }
    }

    fn open_options(flags: i32, mode: Option<u32>) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => opts.write(true),
            libc::O_RDWR => opts.read(true).write(true),
            _ => opts.read(true),
        };
        // std masks the access mode out of custom flags; O_CREAT, O_TRUNC,
        // O_EXCL and O_APPEND pass through to open(2) unchanged.
        opts.custom_flags(flags & !libc::O_ACCMODE);
        if let Some(mode) = mode {
            opts.mode(mode);
        }
        opts
    }

    fn open(&self, path: &str, flags: i32, mode: Option<u32>, info: WireFileInfo) -> Response {
        match Self::open_options(flags, mode).open(self.resolve(path)) {
            Ok(file) => {
                let fh = self.files.lock().insert(file);
                debug!(path, fh, flags, "Opened file");
                Response::Opened {
                    info: WireFileInfo { fh, ..info },
                    status: OpStatus::ok(),
                }
            }
            Err(e) => {
                debug!(path, error = %e, "Open failed");
                Response::Opened {
                    info: WireFileInfo {
                        fh: UNRESOLVED_HANDLE,
                        ..info
                    },
                    status: OpStatus::failed(errno_of(&e)),
                }
            }
        }
    }

    /// Run `f` on the handle's file, or on a transient open of `path` with
    /// `fallback_flags` when the handle is unresolved.
    fn with_file<T>(
        &self,
        path: &str,
        fh: u64,
        fallback_flags: i32,
        f: impl FnOnce(&File) -> io::Result<T>,
    ) -> io::Result<T> {
        if fh == UNRESOLVED_HANDLE {
            let file = Self::open_options(fallback_flags, None).open(self.resolve(path))?;
            f(&file)
        } else {
            let file = self.files.lock().get(fh).ok_or_else(bad_handle)?;
            f(&file)
        }
    }

    fn truncate(&self, path: &str, size: u64, info: WireFileInfo) -> Response {
        let status = if info.fh == UNRESOLVED_HANDLE {
            match nix::unistd::truncate(self.resolve(path).as_str(), size as libc::off_t) {
                Ok(()) => OpStatus::ok(),
                Err(errno) => OpStatus::failed(errno as i32),
            }
        } else {
            let file = self.files.lock().get(info.fh);
            match file {
                Some(file) => status_of(file.set_len(size)),
                None => OpStatus::failed(libc::EBADF),
            }
        };
        Response::Opened { info, status }
    }

    fn mknod(&self, path: &str, mode: u32, rdev: u64) -> OpStatus {
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        match nix::sys::stat::mknod(self.resolve(path).as_str(), kind, perm, rdev as libc::dev_t) {
            Ok(()) => OpStatus::ok(),
            Err(errno) => OpStatus::failed(errno as i32),
        }
    }

    fn get_attributes(&self, path: &str, hint: Option<WireAttr>) -> Response {
        if let Some(hint) = hint {
            trace!(path, hint_size = hint.st_size, hint_mode = hint.st_mode, "Attribute hint");
        }
        match fs::symlink_metadata(self.resolve(path)) {
            Ok(meta) => Response::Attributes {
                attr: WireAttr::from(&Attributes::from_metadata(&meta)),
                status: 0,
            },
            Err(e) => Response::Attributes {
                attr: WireAttr::default(),
                status: -errno_of(&e),
            },
        }
    }

    fn read(&self, path: &str, offset: u64, size: u32, info: WireFileInfo) -> Response {
        let size = size.min(MAX_READ_SIZE);
        match self.with_file(path, info.fh, libc::O_RDONLY, |file| {
            read_full_at(file, size, offset)
        }) {
            Ok(data) => Response::Data {
                size: data.len() as u32,
                data,
                info,
                status: 0,
            },
            Err(e) => Response::Data {
                data: Vec::new(),
                size: 0,
                info,
                status: -errno_of(&e),
            },
        }
    }

    fn write(
        &self,
        path: &str,
        coalesced: bool,
        data: &[u8],
        offset: u64,
        size: u32,
        info: WireFileInfo,
    ) -> Response {
        let len = (size as usize).min(data.len());
        let result = self.with_file(path, info.fh, libc::O_WRONLY, |file| {
            file.write_all_at(&data[..len], offset)
        });
        debug!(path, offset, len, coalesced, ok = result.is_ok(), "Write");
        Response::Written {
            written: if result.is_ok() { len as u32 } else { 0 },
            info,
            status: code_of(&result),
        }
    }

    fn read_directory(&self, path: &str) -> Response {
        let iter = match fs::read_dir(self.resolve(path)) {
            Ok(iter) => iter,
            Err(e) => {
                return Response::Directory {
                    status: -errno_of(&e),
                    entries: Vec::new(),
                }
            }
        };

        let mut entries = Vec::new();
        for item in iter {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    return Response::Directory {
                        status: -errno_of(&e),
                        entries: Vec::new(),
                    }
                }
            };
            let name = item.file_name().to_string_lossy().into_owned();
            match item.metadata() {
                Ok(meta) => entries.push(WireDirEntry::from(&DirEntry {
                    name,
                    attr: Attributes::from_metadata(&meta),
                })),
                // Removed between readdir and lstat.
                Err(e) => debug!(path, name, error = %e, "Skipping vanished entry"),
            }
        }

        Response::Directory { status: 0, entries }
    }
}

/// pread until `size` bytes or end of file.
fn read_full_at(file: &File, size: u32, offset: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
