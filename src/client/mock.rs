//! Scripted in-process channel for client-side tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::net::protocol::MAX_MESSAGE_SIZE;
use crate::net::Channel;
use crate::proto::{
    Attributes, OpStatus, Request, Response, WireAttr, WireFileInfo, PROTOCOL_VERSION,
};
use crate::{NetFsError, Result};

type Responder = Box<dyn Fn(&Request) -> Response + Send + Sync>;

/// Handle the mock server assigns on open/create.
pub const MOCK_FH: u64 = 7;

pub struct MockChannel {
    delivered: Mutex<Vec<Request>>,
    /// Calls that never reached the responder.
    failed: AtomicUsize,
    failing: AtomicBool,
    responder: Responder,
}

impl MockChannel {
    pub fn new(responder: impl Fn(&Request) -> Response + Send + Sync + 'static) -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            failed: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            responder: Box::new(responder),
        }
    }

    /// Accepts everything and reports full success.
    pub fn accepting() -> Self {
        Self::new(success_response)
    }

    /// While set, every call fails at the transport level.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.delivered.lock().len() + self.failed.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Request> {
        self.delivered.lock().clone()
    }

    /// Delivered writes as (offset, data, coalesced).
    pub fn writes(&self) -> Vec<(u64, Vec<u8>, bool)> {
        self.delivered()
            .into_iter()
            .filter_map(|req| match req {
                Request::Write {
                    offset,
                    data,
                    coalesced,
                    ..
                } => Some((offset, data, coalesced)),
                _ => None,
            })
            .collect()
    }

    pub fn op_names(&self) -> Vec<&'static str> {
        self.delivered().iter().map(Request::op_name).collect()
    }
}

impl Channel for MockChannel {
    fn call(&self, request: &Request) -> Result<Response> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(NetFsError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock channel down",
            )));
        }
        // Same frame limit as the TCP transport.
        let len = postcard::to_allocvec(request)?.len();
        if len > MAX_MESSAGE_SIZE as usize {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(NetFsError::MessageTooLarge(u32::try_from(len).unwrap_or(u32::MAX)));
        }
        self.delivered.lock().push(request.clone());
        Ok((self.responder)(request))
    }
}

pub fn success_response(request: &Request) -> Response {
    match request {
        Request::Hello { .. } => Response::Hello {
            protocol_version: PROTOCOL_VERSION,
        },
        Request::Open { info, .. } | Request::Create { info, .. } => Response::Opened {
            info: WireFileInfo {
                fh: MOCK_FH,
                ..*info
            },
            status: OpStatus::ok(),
        },
        Request::Truncate { info, .. } => Response::Opened {
            info: *info,
            status: OpStatus::ok(),
        },
        Request::GetAttributes { .. } => Response::Attributes {
            attr: WireAttr::from(&Attributes {
                mode: libc::S_IFREG | 0o644,
                nlink: 1,
                ..Attributes::default()
            }),
            status: 0,
        },
        Request::Read { size, info, .. } => Response::Data {
            data: vec![b'r'; *size as usize],
            size: *size,
            info: *info,
            status: 0,
        },
        Request::Write { size, info, .. } => Response::Written {
            written: *size,
            info: *info,
            status: 0,
        },
        Request::Fsync { info, .. }
        | Request::Flush { info, .. }
        | Request::Release { info, .. } => Response::Synced {
            status: 0,
            info: *info,
        },
        Request::ReadDirectory { .. } => Response::Directory {
            status: 0,
            entries: Vec::new(),
        },
        Request::Mkdir { .. }
        | Request::Rmdir { .. }
        | Request::Rename { .. }
        | Request::Unlink { .. }
        | Request::Mknod { .. } => Response::Status(OpStatus::ok()),
    }
}
