pub mod cache;
pub mod stub;

#[cfg(test)]
pub(crate) mod mock;

use crate::NetFsError;
pub use cache::{
    BufferState, BufferStatus, WriteBackCache, DEFAULT_WRITE_BUFFER_SIZE, MAX_WRITE_CHUNK,
};
pub use stub::RemoteClient;

/// Return code for a call that never completed. It is not an errno.
pub const TRANSPORT_FAILURE: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server ran the syscall and it failed with `errno`.
    #[error("remote operation failed with errno {errno}")]
    Remote { errno: i32 },

    /// The call did not complete: connection, codec, timeout, or a response
    /// of the wrong shape.
    #[error("transport failure: {0}")]
    Transport(#[from] NetFsError),

    /// The server accepted fewer bytes than a flush sent. The remainder stays
    /// buffered and dirty.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: u32, expected: usize },
}

impl ClientError {
    /// POSIX-style return code: `-errno` for remote failures,
    /// [`TRANSPORT_FAILURE`] when the call did not complete.
    pub fn return_code(&self) -> i32 {
        match self {
            ClientError::Remote { errno } => -errno,
            ClientError::Transport(_) => TRANSPORT_FAILURE,
            ClientError::ShortWrite { .. } => -libc::EIO,
        }
    }

    /// Errno to hand to the kernel. Transport failures become `EIO` there,
    /// since the kernel has no code for them.
    pub fn errno(&self) -> i32 {
        match self {
            ClientError::Remote { errno } => *errno,
            ClientError::Transport(_) | ClientError::ShortWrite { .. } => libc::EIO,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
