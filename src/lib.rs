pub mod client;
pub mod config;
pub mod fuse_fs;
pub mod net;
pub mod proto;
pub mod server;

/// File handle value meaning "not resolved yet": operations carrying it fall
/// back to path-based resolution on the server.
pub const UNRESOLVED_HANDLE: u64 = 0;

#[derive(Debug, thiserror::Error)]
pub enum NetFsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(u32),

    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, NetFsError>;
