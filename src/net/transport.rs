use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol;
use crate::proto::{Request, Response, PROTOCOL_VERSION};
use crate::{NetFsError, Result};

/// A synchronous request/response channel to the server.
///
/// `call` blocks until the response arrives. An `Err` means the call did not
/// complete; remote syscall failures come back inside the `Response`.
pub trait Channel: Send + Sync {
    fn call(&self, request: &Request) -> Result<Response>;
}

impl<T: Channel + ?Sized> Channel for Arc<T> {
    fn call(&self, request: &Request) -> Result<Response> {
        (**self).call(request)
    }
}

/// TCP channel holding one connection, re-established lazily after a failure.
pub struct TcpChannel {
    addr: SocketAddr,
    timeout: Duration,
    rt_handle: tokio::runtime::Handle,
    conn: Mutex<Option<TcpStream>>,
}

impl TcpChannel {
    /// `rt_handle` drives the async I/O; `call` must not be invoked from a
    /// thread that is itself running on that runtime.
    pub fn new(addr: SocketAddr, timeout: Duration, rt_handle: tokio::runtime::Handle) -> Self {
        Self {
            addr,
            timeout,
            rt_handle,
            conn: Mutex::new(None),
        }
    }

    /// Connect and exchange Hello messages.
    async fn connect(&self) -> Result<TcpStream> {
        debug!(addr = %self.addr, "Connecting to server");
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;

        let hello = Request::Hello {
            protocol_version: PROTOCOL_VERSION,
        };
        protocol::write_message(&mut stream, &hello).await?;

        match protocol::read_message(&mut stream).await? {
            Response::Hello { protocol_version } if protocol_version == PROTOCOL_VERSION => {
                info!(addr = %self.addr, protocol_version, "Connected to server");
                Ok(stream)
            }
            Response::Hello { protocol_version } => Err(NetFsError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: protocol_version,
            }),
            other => Err(NetFsError::UnexpectedMessage(format!(
                "expected Hello, got {}",
                other.shape_name()
            ))),
        }
    }

    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let mut guard = self.conn.lock().await;

        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => tokio::time::timeout(self.timeout, self.connect())
                .await
                .map_err(|_| NetFsError::Timeout(self.timeout))??,
        };

        let exchange = async {
            protocol::write_message(&mut stream, request).await?;
            protocol::read_message::<_, Response>(&mut stream).await
        };

        // The connection is only put back after a clean exchange; a stream
        // abandoned mid-frame cannot be reused.
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => {
                *guard = Some(stream);
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!(op = request.op_name(), error = %e, "Request failed, dropping connection");
                Err(e)
            }
            Err(_) => {
                warn!(
                    op = request.op_name(),
                    timeout = ?self.timeout,
                    "Request timed out, dropping connection"
                );
                Err(NetFsError::Timeout(self.timeout))
            }
        }
    }
}

impl Channel for TcpChannel {
    fn call(&self, request: &Request) -> Result<Response> {
        self.rt_handle.block_on(self.round_trip(request))
    }
}
