pub mod dispatcher;
pub mod handle;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::net::protocol;
use crate::proto::Request;
use crate::{NetFsError, Result};
pub use dispatcher::Dispatcher;

/// TCP front end: accepts connections and feeds each one's requests to the
/// shared dispatcher.
pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, dispatcher: Dispatcher) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections in a loop. This never returns under normal operation.
    pub async fn run(self) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            base = %self.dispatcher.base_path(),
            "Server listening"
        );

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
            }

            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                info!(%addr, "Client connected");
                match serve_connection(stream, dispatcher).await {
                    Ok(()) => info!(%addr, "Client disconnected"),
                    Err(e) => warn!(%addr, error = %e, "Connection failed"),
                }
            });
        }
    }
}

/// Serve requests from one stream until the peer closes it.
///
/// Requests on a connection are handled strictly in order; syscalls run on
/// the blocking pool.
pub async fn serve_connection<S>(mut stream: S, dispatcher: Arc<Dispatcher>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request: Request = match protocol::read_message(&mut stream).await {
            Ok(request) => request,
            Err(e) if protocol::is_disconnect(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        let dispatcher = dispatcher.clone();
        let response = tokio::task::spawn_blocking(move || dispatcher.dispatch(request))
            .await
            .map_err(|e| NetFsError::Other(format!("dispatch task failed: {e}")))?;

        protocol::write_message(&mut stream, &response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{OpStatus, Response, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_serve_connection_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(dir.path().display().to_string()));
        let (mut client, server_end) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(server_end, dispatcher));

        protocol::write_message(
            &mut client,
            &Request::Hello {
                protocol_version: PROTOCOL_VERSION,
            },
        )
        .await
        .unwrap();
        let hello: Response = protocol::read_message(&mut client).await.unwrap();
        assert_eq!(
            hello,
            Response::Hello {
                protocol_version: PROTOCOL_VERSION
            }
        );

        for expected in [OpStatus::ok(), OpStatus::failed(libc::EEXIST)] {
            let mkdir = Request::Mkdir {
                path: "/x".to_string(),
                mode: 0o700,
            };
            protocol::write_message(&mut client, &mkdir).await.unwrap();
            let resp: Response = protocol::read_message(&mut client).await.unwrap();
            assert_eq!(resp, Response::Status(expected));
        }

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_loopback_end_to_end() {
        use std::time::Duration;

        use crate::client::{BufferState, RemoteClient, WriteBackCache};
        use crate::net::TcpChannel;
        use crate::proto::OpenContext;

        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let server = runtime
            .block_on(Server::bind(
                "127.0.0.1:0".parse().unwrap(),
                Dispatcher::new(dir.path().display().to_string()),
            ))
            .unwrap();
        let addr = server.local_addr().unwrap();
        runtime.spawn(server.run());

        let channel = TcpChannel::new(addr, Duration::from_secs(5), runtime.handle().clone());
        let client = Arc::new(RemoteClient::new(channel));
        let cache = WriteBackCache::new(client.clone(), 16);

        client.mkdir("/docs", 0o755).unwrap();
        let path = "/docs/notes.txt";
        let mut ctx = OpenContext::with_flags(libc::O_RDWR);
        client.create(path, 0o644, &mut ctx).unwrap();
        assert!(ctx.is_resolved());
        let fh = ctx.fh;

        for (i, chunk) in [b"hello ", b"from  ", b"netfs!"].iter().enumerate() {
            assert_eq!(cache.write(path, *chunk, (i * 6) as u64, &mut ctx).unwrap(), 6);
        }
        // 18 bytes crossed the 16-byte threshold on the third write.
        assert_eq!(cache.status(fh).len, 0);

        cache.write(path, b"?", 18, &mut ctx).unwrap();
        cache.fsync(path, false, &mut ctx).unwrap();

        let data = client.read(path, 0, 64, &mut ctx).unwrap();
        assert_eq!(data, b"hello from  netfs!?");
        assert_eq!(
            std::fs::read(dir.path().join("docs/notes.txt")).unwrap(),
            b"hello from  netfs!?"
        );

        let attr = client.get_attributes(path, None).unwrap();
        assert_eq!(attr.size, 19);
        let names: Vec<String> = client
            .read_directory("/docs")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["notes.txt".to_string()]);

        cache.release(path, &mut ctx).unwrap();
        assert_eq!(cache.status(fh).state, BufferState::Unbuffered);

        let err = client.mkdir("/docs", 0o755).unwrap_err();
        assert_eq!(err.return_code(), -libc::EEXIST);
    }
}
