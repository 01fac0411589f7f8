//! Write-back buffering in front of [`RemoteClient::write`].
//!
//! Consecutive writes on one open handle are accumulated into a single
//! contiguous run and sent as one coalesced write once the run would exceed
//! the threshold, or when the handle is flushed, fsynced, or released.
//!
//! Durability: a buffered write is acknowledged with its full length before
//! it reaches the server. When the flush that carries it fails, the run is
//! kept and marked dirty, and the write that triggered the flush still
//! reports success. The next write, flush, or fsync on that handle retries
//! it, and only that retry can surface the error. Buffered bytes exist only
//! in this process until then.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{ClientError, ClientResult, RemoteClient};
use crate::net::protocol::MAX_PAYLOAD_SIZE;
use crate::net::Channel;
use crate::proto::OpenContext;

pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 65536;

/// Largest slice of a run sent in one write request. Longer runs go out as
/// consecutive chunks.
pub const MAX_WRITE_CHUNK: usize = MAX_PAYLOAD_SIZE as usize;

/// One handle's pending run of bytes, starting at `origin_offset`.
#[derive(Debug, Default)]
struct CachedWriteBuffer {
    data: Vec<u8>,
    origin_offset: u64,
    /// A flush of this run already failed once.
    dirty: bool,
    /// Evicted by release. Writers that still hold the entry must look it up
    /// again.
    released: bool,
}

impl CachedWriteBuffer {
    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn end(&self) -> u64 {
        self.origin_offset + self.data.len() as u64
    }

    /// A write at `offset` overlaps the run or starts right where it ends.
    fn is_contiguous(&self, offset: u64) -> bool {
        offset >= self.origin_offset && offset <= self.end()
    }

    /// Run length after placing `len` bytes at a contiguous `offset`.
    fn len_after(&self, offset: u64, len: usize) -> usize {
        let rel = (offset - self.origin_offset) as usize;
        self.data.len().max(rel + len)
    }

    /// Copy `bytes` in at `offset`, overwriting any overlap and extending the
    /// run past its end. An empty buffer starts a new run at `offset`.
    fn place(&mut self, offset: u64, bytes: &[u8]) {
        if self.is_empty() {
            self.origin_offset = offset;
            self.data.extend_from_slice(bytes);
            return;
        }
        let rel = (offset - self.origin_offset) as usize;
        let overlap = (self.data.len() - rel).min(bytes.len());
        self.data[rel..rel + overlap].copy_from_slice(&bytes[..overlap]);
        self.data.extend_from_slice(&bytes[overlap..]);
    }

    fn clear(&mut self) {
        self.data.clear();
        self.dirty = false;
    }

    /// Drop the first `n` bytes, which the server already has.
    fn consume(&mut self, n: usize) {
        self.data.drain(..n);
        self.origin_offset += n as u64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// No entry for the handle.
    Unbuffered,
    Clean,
    /// Holds bytes whose last flush failed.
    Dirty,
}

/// Point-in-time view of one handle's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatus {
    pub state: BufferState,
    pub origin_offset: u64,
    pub len: usize,
}

impl BufferStatus {
    const UNBUFFERED: Self = Self {
        state: BufferState::Unbuffered,
        origin_offset: 0,
        len: 0,
    };
}

pub struct WriteBackCache<C> {
    client: Arc<RemoteClient<C>>,
    threshold: usize,
    /// Outer lock guards membership only; each buffer has its own lock, held
    /// across the remote flush so that writes on one handle stay ordered.
    entries: Mutex<HashMap<u64, Arc<Mutex<CachedWriteBuffer>>>>,
}

impl<C: Channel> WriteBackCache<C> {
    pub fn new(client: Arc<RemoteClient<C>>, threshold: usize) -> Self {
        Self {
            client,
            threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<RemoteClient<C>> {
        &self.client
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Buffer or send `data` at `offset` on the handle in `ctx`.
    ///
    /// Returns the number of bytes the caller may consider written. That is
    /// the full length whenever the bytes were buffered, even if a flush
    /// triggered by this write failed.
    pub fn write(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        ctx: &mut OpenContext,
    ) -> ClientResult<u32> {
        if !ctx.is_resolved() {
            debug!(path, offset, len = data.len(), "No server handle, writing through");
            return self.client.write(path, data, offset, false, ctx);
        }
        let requested = u32::try_from(data.len()).unwrap_or(u32::MAX);

        loop {
            let entry = self.entry(ctx.fh);
            let mut buf = entry.lock();
            // Lost a race with release; the next lookup creates a fresh entry.
            if buf.released {
                continue;
            }
            return self.write_run(path, data, offset, requested, ctx, &mut buf);
        }
    }

    fn write_run(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        requested: u32,
        ctx: &mut OpenContext,
        buf: &mut CachedWriteBuffer,
    ) -> ClientResult<u32> {
        if buf.is_empty() {
            buf.place(offset, data);
            trace!(path, fh = ctx.fh, offset, len = data.len(), "Started write run");
            return Ok(requested);
        }

        if !buf.is_contiguous(offset) {
            debug!(
                path,
                fh = ctx.fh,
                offset,
                run_start = buf.origin_offset,
                run_end = buf.end(),
                "Non-contiguous write, flushing pending run"
            );
            self.flush_buffer(path, ctx, buf)?;
            buf.place(offset, data);
            return Ok(requested);
        }

        let must_flush = buf.dirty || buf.len_after(offset, data.len()) > self.threshold;
        buf.place(offset, data);
        if !must_flush {
            trace!(path, fh = ctx.fh, offset, pending = buf.data.len(), "Buffered write");
            return Ok(requested);
        }

        let retry = buf.dirty;
        match self.flush_buffer(path, ctx, buf) {
            Ok(written) => Ok(u32::try_from(written).unwrap_or(u32::MAX).min(requested)),
            Err(e) => {
                warn!(
                    path,
                    fh = ctx.fh,
                    pending = buf.data.len(),
                    retry,
                    error = %e,
                    "Flush failed, keeping buffer dirty"
                );
                Ok(requested)
            }
        }
    }

    /// Send any pending bytes for the handle without forwarding a flush.
    pub fn write_back(&self, path: &str, ctx: &mut OpenContext) -> ClientResult<()> {
        let Some(entry) = self.existing(ctx.fh) else {
            return Ok(());
        };
        let mut buf = entry.lock();
        self.flush_buffer(path, ctx, &mut buf).map(|_| ())
    }

    /// Write back pending bytes, then forward the flush.
    pub fn flush(&self, path: &str, ctx: &mut OpenContext) -> ClientResult<()> {
        self.write_back(path, ctx)?;
        self.client.flush(path, ctx)
    }

    /// Write back pending bytes, then forward the fsync.
    pub fn fsync(&self, path: &str, datasync: bool, ctx: &mut OpenContext) -> ClientResult<()> {
        self.write_back(path, ctx)?;
        self.client.fsync(path, datasync, ctx)
    }

    /// Final write-back for a handle. The entry is evicted and the release
    /// forwarded even if the write-back fails; the first error is returned.
    pub fn release(&self, path: &str, ctx: &mut OpenContext) -> ClientResult<()> {
        let flushed = match self.existing(ctx.fh) {
            Some(entry) => {
                // Evict under the buffer lock so no write lands in it afterwards.
                let mut buf = entry.lock();
                buf.released = true;
                self.entries.lock().remove(&ctx.fh);

                let result = self.flush_buffer(path, ctx, &mut buf).map(|_| ());
                if let Err(e) = &result {
                    error!(
                        path,
                        fh = ctx.fh,
                        lost = buf.data.len(),
                        error = %e,
                        "Discarding unflushed writes on release"
                    );
                    buf.clear();
                }
                result
            }
            None => Ok(()),
        };
        let released = self.client.release(path, ctx);
        flushed.and(released)
    }

    /// An entry holding no bytes and no failed flush reports as unbuffered.
    pub fn status(&self, fh: u64) -> BufferStatus {
        let Some(entry) = self.existing(fh) else {
            return BufferStatus::UNBUFFERED;
        };
        let buf = entry.lock();
        let state = if buf.dirty {
            BufferState::Dirty
        } else if buf.is_empty() {
            return BufferStatus::UNBUFFERED;
        } else {
            BufferState::Clean
        };
        BufferStatus {
            state,
            origin_offset: buf.origin_offset,
            len: buf.data.len(),
        }
    }

    /// Number of handles with a buffer entry.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn entry(&self, fh: u64) -> Arc<Mutex<CachedWriteBuffer>> {
        self.entries.lock().entry(fh).or_default().clone()
    }

    fn existing(&self, fh: u64) -> Option<Arc<Mutex<CachedWriteBuffer>>> {
        self.entries.lock().get(&fh).cloned()
    }

    /// Send the run as coalesced writes of at most [`MAX_WRITE_CHUNK`] bytes,
    /// in order. Each accepted chunk leaves the buffer at once, so a failure
    /// keeps only the unsent tail, marked dirty.
    fn flush_buffer(
        &self,
        path: &str,
        ctx: &mut OpenContext,
        buf: &mut CachedWriteBuffer,
    ) -> ClientResult<usize> {
        let origin = buf.origin_offset;
        let mut sent = 0usize;
        while !buf.is_empty() {
            let expected = buf.data.len().min(MAX_WRITE_CHUNK);
            let chunk = &buf.data[..expected];
            match self.client.write(path, chunk, buf.origin_offset, true, ctx) {
                Ok(written) if written as usize >= expected => {
                    buf.consume(expected);
                    sent += expected;
                }
                Ok(written) => {
                    buf.consume(written as usize);
                    buf.dirty = true;
                    return Err(ClientError::ShortWrite { written, expected });
                }
                Err(e) => {
                    buf.dirty = true;
                    return Err(e);
                }
            }
        }
        if sent > 0 {
            debug!(path, fh = ctx.fh, offset = origin, len = sent, "Flushed write run");
        }
        buf.clear();
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{success_response, MockChannel};
    use crate::client::TRANSPORT_FAILURE;
    use crate::proto::{Request, Response};

    const FH: u64 = 5;

    fn setup(channel: MockChannel) -> (WriteBackCache<Arc<MockChannel>>, Arc<MockChannel>) {
        let channel = Arc::new(channel);
        let client = Arc::new(RemoteClient::new(channel.clone()));
        (
            WriteBackCache::new(client, DEFAULT_WRITE_BUFFER_SIZE),
            channel,
        )
    }

    fn ctx() -> OpenContext {
        OpenContext::for_handle(FH, libc::O_WRONLY)
    }

    #[test]
    fn test_small_writes_stay_local() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        for i in 0..3u64 {
            assert_eq!(cache.write("/f", &[1u8; 1000], i * 1000, &mut ctx).unwrap(), 1000);
        }

        assert_eq!(channel.attempts(), 0);
        assert_eq!(
            cache.status(FH),
            BufferStatus {
                state: BufferState::Clean,
                origin_offset: 0,
                len: 3000
            }
        );
    }

    #[test]
    fn test_run_at_threshold_is_not_flushed() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", &vec![0u8; 65000], 0, &mut ctx).unwrap();
        cache.write("/f", &vec![0u8; 536], 65000, &mut ctx).unwrap();

        assert_eq!(channel.attempts(), 0);
        assert_eq!(cache.status(FH).len, DEFAULT_WRITE_BUFFER_SIZE);
    }

    #[test]
    fn test_crossing_threshold_sends_one_coalesced_write() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", &vec![1u8; 60000], 4096, &mut ctx).unwrap();
        let n = cache.write("/f", &vec![2u8; 6000], 64096, &mut ctx).unwrap();
        assert_eq!(n, 6000);

        let writes = channel.writes();
        assert_eq!(writes.len(), 1);
        let (offset, data, coalesced) = &writes[0];
        assert_eq!(*offset, 4096);
        assert!(*coalesced);
        assert_eq!(data.len(), 66000);
        assert!(data[..60000].iter().all(|&b| b == 1));
        assert!(data[60000..].iter().all(|&b| b == 2));

        // The entry remains but holds nothing.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.status(FH).state, BufferState::Unbuffered);
    }

    #[test]
    fn test_first_write_is_buffered_whatever_its_size() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", &vec![0u8; 100_000], 0, &mut ctx).unwrap();
        assert_eq!(channel.attempts(), 0);
        assert_eq!(cache.status(FH).len, 100_000);
    }

    #[test]
    fn test_failed_flush_keeps_bytes_dirty() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", &vec![1u8; 60000], 0, &mut ctx).unwrap();
        channel.set_failing(true);
        let n = cache.write("/f", &vec![2u8; 6000], 60000, &mut ctx).unwrap();

        assert_eq!(n, 6000);
        assert_eq!(channel.attempts(), 1);
        assert_eq!(
            cache.status(FH),
            BufferStatus {
                state: BufferState::Dirty,
                origin_offset: 0,
                len: 66000
            }
        );

        // Any write on a dirty handle retries, however small.
        channel.set_failing(false);
        assert_eq!(cache.write("/f", b"tail", 66000, &mut ctx).unwrap(), 4);

        let writes = channel.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0);
        assert_eq!(writes[0].1.len(), 66004);
        assert_eq!(&writes[0].1[66000..], b"tail");
        assert_eq!(cache.status(FH).state, BufferState::Unbuffered);
        assert_eq!(cache.status(FH).len, 0);
    }

    #[test]
    fn test_run_larger_than_a_frame_recovers_in_chunks() {
        const MIB: usize = 1024 * 1024;
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        // Server down while 17 MiB of acknowledged writes pile up.
        channel.set_failing(true);
        for i in 0..17 {
            let n = cache.write("/f", &vec![i as u8; MIB], (i * MIB) as u64, &mut ctx);
            assert_eq!(n.unwrap(), MIB as u32);
        }
        assert_eq!(cache.status(FH).state, BufferState::Dirty);
        assert_eq!(cache.status(FH).len, 17 * MIB);

        channel.set_failing(false);
        cache.fsync("/f", false, &mut ctx).unwrap();

        let writes = channel.writes();
        let layout: Vec<(u64, usize)> = writes.iter().map(|(o, d, _)| (*o, d.len())).collect();
        assert_eq!(
            layout,
            vec![
                (0, MAX_WRITE_CHUNK),
                (MAX_WRITE_CHUNK as u64, MAX_WRITE_CHUNK),
                (2 * MAX_WRITE_CHUNK as u64, 17 * MIB - 2 * MAX_WRITE_CHUNK),
            ]
        );
        assert!(writes.iter().all(|(_, _, coalesced)| *coalesced));
        let joined: Vec<u8> = writes.into_iter().flat_map(|(_, d, _)| d).collect();
        for (i, block) in joined.chunks(MIB).enumerate() {
            assert!(block.iter().all(|&b| b == i as u8));
        }
        assert_eq!(cache.status(FH).state, BufferState::Unbuffered);
    }

    #[test]
    fn test_failed_chunk_keeps_only_unsent_tail() {
        let total = MAX_WRITE_CHUNK + 1000;
        let (cache, channel) = setup(MockChannel::new(move |req| match req {
            Request::Write { offset, info, .. } if *offset > 0 => Response::Written {
                written: 0,
                info: *info,
                status: -libc::ENOSPC,
            },
            other => success_response(other),
        }));
        let mut ctx = ctx();

        cache.write("/f", &vec![3u8; total], 0, &mut ctx).unwrap();
        let err = cache.write_back("/f", &mut ctx).unwrap_err();
        assert_eq!(err.return_code(), -libc::ENOSPC);

        assert_eq!(channel.writes().len(), 2);
        assert_eq!(
            cache.status(FH),
            BufferStatus {
                state: BufferState::Dirty,
                origin_offset: MAX_WRITE_CHUNK as u64,
                len: 1000
            }
        );
    }

    #[test]
    fn test_unresolved_handle_writes_through() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = OpenContext::with_flags(libc::O_WRONLY);

        assert_eq!(cache.write("/f", b"abc", 9, &mut ctx).unwrap(), 3);
        assert_eq!(channel.writes(), vec![(9, b"abc".to_vec(), false)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unresolved_handle_propagates_failure() {
        let (cache, channel) = setup(MockChannel::accepting());
        channel.set_failing(true);
        let mut ctx = OpenContext::with_flags(libc::O_WRONLY);

        let err = cache.write("/f", b"abc", 0, &mut ctx).unwrap_err();
        assert_eq!(err.return_code(), TRANSPORT_FAILURE);
    }

    #[test]
    fn test_non_contiguous_write_flushes_pending_run() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", &[7u8; 100], 0, &mut ctx).unwrap();
        cache.write("/f", &[8u8; 50], 1000, &mut ctx).unwrap();

        assert_eq!(channel.writes(), vec![(0, vec![7u8; 100], true)]);
        assert_eq!(
            cache.status(FH),
            BufferStatus {
                state: BufferState::Clean,
                origin_offset: 1000,
                len: 50
            }
        );
    }

    #[test]
    fn test_non_contiguous_write_rejected_when_flush_fails() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", &[7u8; 100], 0, &mut ctx).unwrap();
        channel.set_failing(true);
        let err = cache.write("/f", &[8u8; 50], 1000, &mut ctx).unwrap_err();

        assert!(err.is_transport());
        let status = cache.status(FH);
        assert_eq!(status.state, BufferState::Dirty);
        assert_eq!(status.origin_offset, 0);
        assert_eq!(status.len, 100);
    }

    #[test]
    fn test_overlapping_write_is_spliced() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", b"hello world", 0, &mut ctx).unwrap();
        cache.write("/f", b"HELLO", 0, &mut ctx).unwrap();
        cache.write("/f", b"World!", 6, &mut ctx).unwrap();
        assert_eq!(channel.attempts(), 0);

        cache.flush("/f", &mut ctx).unwrap();
        assert_eq!(channel.writes(), vec![(0, b"HELLO World!".to_vec(), true)]);
        assert_eq!(channel.op_names(), vec!["write", "flush"]);
    }

    #[test]
    fn test_flush_without_entry_only_forwards() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.flush("/f", &mut ctx).unwrap();
        assert_eq!(channel.op_names(), vec!["flush"]);
    }

    #[test]
    fn test_fsync_surfaces_failure_and_retries() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", b"0123456789", 0, &mut ctx).unwrap();
        channel.set_failing(true);
        let err = cache.fsync("/f", false, &mut ctx).unwrap_err();
        assert_eq!(err.return_code(), TRANSPORT_FAILURE);
        assert_eq!(cache.status(FH).state, BufferState::Dirty);
        assert_eq!(cache.status(FH).len, 10);

        channel.set_failing(false);
        cache.fsync("/f", true, &mut ctx).unwrap();
        assert_eq!(channel.op_names(), vec!["write", "fsync"]);
        assert_eq!(cache.status(FH).len, 0);
    }

    #[test]
    fn test_remote_errno_from_flush() {
        let (cache, _) = setup(MockChannel::new(|req| match req {
            Request::Write { info, .. } => Response::Written {
                written: 0,
                info: *info,
                status: -libc::ENOSPC,
            },
            other => success_response(other),
        }));
        let mut ctx = ctx();

        cache.write("/f", b"data", 0, &mut ctx).unwrap();
        let err = cache.flush("/f", &mut ctx).unwrap_err();
        assert_eq!(err.return_code(), -libc::ENOSPC);
        assert_eq!(cache.status(FH).state, BufferState::Dirty);
    }

    #[test]
    fn test_short_write_keeps_remainder() {
        let (cache, _) = setup(MockChannel::new(|req| match req {
            Request::Write { info, .. } => Response::Written {
                written: 4,
                info: *info,
                status: 0,
            },
            other => success_response(other),
        }));
        let mut ctx = ctx();

        cache.write("/f", b"abcdefgh", 100, &mut ctx).unwrap();
        let err = cache.write_back("/f", &mut ctx).unwrap_err();
        assert!(matches!(err, ClientError::ShortWrite { written: 4, expected: 8 }));
        assert_eq!(
            cache.status(FH),
            BufferStatus {
                state: BufferState::Dirty,
                origin_offset: 104,
                len: 4
            }
        );
    }

    #[test]
    fn test_release_flushes_and_evicts() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", b"abc", 0, &mut ctx).unwrap();
        cache.release("/f", &mut ctx).unwrap();

        assert_eq!(channel.op_names(), vec!["write", "release"]);
        assert_eq!(cache.status(FH).state, BufferState::Unbuffered);
    }

    #[test]
    fn test_release_evicts_even_when_flush_fails() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", b"abc", 0, &mut ctx).unwrap();
        channel.set_failing(true);
        assert!(cache.release("/f", &mut ctx).is_err());

        assert!(cache.is_empty());
        // Both the write-back and the release were attempted.
        assert_eq!(channel.attempts(), 2);
    }

    #[test]
    fn test_write_after_release_uses_fresh_entry() {
        let (cache, channel) = setup(MockChannel::accepting());
        let mut ctx = ctx();

        cache.write("/f", b"abc", 0, &mut ctx).unwrap();
        let stale = cache.entry(FH);
        cache.release("/f", &mut ctx).unwrap();
        assert!(stale.lock().released);
        assert!(cache.is_empty());

        assert_eq!(cache.write("/f", b"late", 3, &mut ctx).unwrap(), 4);
        assert!(!Arc::ptr_eq(&stale, &cache.entry(FH)));
        assert!(stale.lock().is_empty());
        assert_eq!(cache.status(FH).len, 4);
        assert_eq!(channel.writes(), vec![(0, b"abc".to_vec(), true)]);
    }

    #[test]
    fn test_write_racing_release_is_not_orphaned() {
        let (cache, _) = setup(MockChannel::accepting());
        let stale = cache.entry(FH);

        std::thread::scope(|s| {
            let mut guard = stale.lock();
            let writer = s.spawn(|| {
                let mut ctx = ctx();
                cache.write("/f", b"late", 0, &mut ctx).unwrap()
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            // Evict the way release does, while the writer waits on the lock.
            guard.released = true;
            cache.entries.lock().remove(&FH);
            drop(guard);
            assert_eq!(writer.join().unwrap(), 4);
        });

        assert!(stale.lock().is_empty());
        assert_eq!(
            cache.status(FH),
            BufferStatus {
                state: BufferState::Clean,
                origin_offset: 0,
                len: 4
            }
        );
    }

    #[test]
    fn test_handles_are_independent() {
        let (cache, channel) = setup(MockChannel::accepting());

        std::thread::scope(|s| {
            for fh in 1..=4u64 {
                let cache = &cache;
                s.spawn(move || {
                    let mut ctx = OpenContext::for_handle(fh, libc::O_WRONLY);
                    for i in 0..100u64 {
                        cache
                            .write("/f", &[fh as u8; 1000], i * 1000, &mut ctx)
                            .unwrap();
                    }
                    cache.flush("/f", &mut ctx).unwrap();
                });
            }
        });

        for fh in 1..=4u64 {
            let mut next = 0u64;
            let mut total = 0usize;
            for req in channel.delivered() {
                if let Request::Write {
                    offset, data, info, ..
                } = req
                {
                    if info.fh != fh {
                        continue;
                    }
                    assert_eq!(offset, next);
                    assert!(data.iter().all(|&b| b == fh as u8));
                    next += data.len() as u64;
                    total += data.len();
                }
            }
            assert_eq!(total, 100_000);
        }
    }
}
