//! Cache entries.
//!
//! A [`CacheEntry`] sits in front of one back-end entry and serves reads and
//! writes from a pooled [`Buffer`]. The first read pulls the whole entry
//! into the buffer; later reads never touch the back end until the entry is
//! cleared. Writes go to the buffer and reach the back end on [`flush`],
//! immediately after each write under [`Strategy::WriteThrough`] or when the
//! owner decides under [`Strategy::WriteBack`].
//!
//! ```text
//!            flush()
//!   Empty ─────────────── Cached(clean) ◄──┐
//!     │  first read/write        │ write   │ flush ok
//!     └──────────────────► Cached(dirty) ──┘
//!           clear() from any state goes back to Empty
//! ```
//!
//! [`flush`]: CacheEntry::flush

use std::io::{self, Write};
use std::sync::Arc;

use arcfs_types::{AccessKind, EntryMeta, SizeKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::IoConfig;
use super::error::{IoError, IoResult};
use super::pool::{Buffer, BufferPool};
use super::socket::{copy, InputChannel, InputSocket, InputStream, OutputSocket, OutputStream};

/// When buffered writes reach the back end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Flush as soon as a write stream is closed.
    #[default]
    WriteThrough,
    /// Flush only when [`CacheEntry::flush`] is called.
    WriteBack,
}

impl Strategy {
    /// Create an empty cache entry using this strategy.
    pub fn new_entry(self, pool: BufferPool) -> CacheEntry {
        CacheEntry::new(self, pool)
    }
}

/// Buffer currently holding the entry's content.
struct Cached {
    buffer: Buffer,
    dirty: bool,
}

struct CacheState {
    strategy: Strategy,
    pool: BufferPool,
    cached: Option<Cached>,
    input: Option<Box<dyn InputSocket>>,
    output: Option<Box<dyn OutputSocket>>,
}

impl CacheState {
    /// Copy the back-end entry into a fresh buffer.
    fn load(&mut self) -> IoResult<Cached> {
        let socket = self.input.as_mut().ok_or(IoError::NotConfigured("input"))?;
        let buffer = self.pool.allocate()?;
        let mut sink = buffer.output();
        match copy(&mut **socket, &mut sink) {
            Ok(n) => {
                debug!("cached {} bytes in {}", n, buffer.name());
                Ok(Cached {
                    buffer,
                    dirty: false,
                })
            }
            Err(e) => {
                discard(buffer);
                Err(e)
            }
        }
    }

    /// Run `f` on the buffer, loading it first if nothing is cached.
    ///
    /// A failed load leaves the entry empty.
    fn with_loaded<T>(&mut self, f: impl FnOnce(&Buffer) -> IoResult<T>) -> IoResult<T> {
        let cached = match self.cached.take() {
            Some(cached) => cached,
            None => self.load()?,
        };
        let result = f(&cached.buffer);
        self.cached = Some(cached);
        result
    }

    fn flush(&mut self) -> IoResult<()> {
        let Some(cached) = self.cached.as_mut() else {
            return Ok(());
        };
        if !cached.dirty {
            return Ok(());
        }
        let socket = self
            .output
            .as_mut()
            .ok_or(IoError::NotConfigured("output"))?;
        let n = copy(&mut cached.buffer.input(), &mut **socket)?;
        cached.dirty = false;
        debug!("flushed {} bytes from {}", n, cached.buffer.name());
        Ok(())
    }

    /// Install the buffer of a committed front write, replacing any cached
    /// content.
    fn install(&mut self, buffer: Buffer) -> IoResult<()> {
        if let Some(old) = self.cached.take() {
            if old.dirty {
                debug!("{} overwritten before it was flushed", old.buffer.name());
            }
            discard(old.buffer);
        }
        debug!("installed written buffer {}", buffer.name());
        self.cached = Some(Cached {
            buffer,
            dirty: true,
        });
        match self.strategy {
            Strategy::WriteThrough => self.flush(),
            Strategy::WriteBack => Ok(()),
        }
    }

    fn clear(&mut self) -> IoResult<()> {
        match self.cached.take() {
            Some(cached) => {
                if cached.dirty {
                    debug!("discarding unflushed {}", cached.buffer.name());
                }
                self.pool.release(cached.buffer)
            }
            None => Ok(()),
        }
    }

    /// Front sockets report the buffer while cached, the back end otherwise.
    fn front_target(
        &self,
        back: Option<IoResult<EntryMeta>>,
        direction: &'static str,
    ) -> IoResult<EntryMeta> {
        match (&self.cached, back) {
            (Some(cached), _) => Ok(cached.buffer.meta()),
            (None, Some(target)) => target,
            (None, None) => Err(IoError::NotConfigured(direction)),
        }
    }
}

impl Drop for CacheState {
    fn drop(&mut self) {
        if let Some(cached) = &self.cached {
            if cached.dirty {
                warn!(
                    "cache entry dropped with unflushed data in {}",
                    cached.buffer.name()
                );
            }
        }
    }
}

fn discard(buffer: Buffer) {
    let name = buffer.name();
    if let Err(e) = buffer.release() {
        warn!("failed to release buffer {}: {}", name, e);
    }
}

/// Caches one back-end entry in a pooled buffer.
///
/// The entry starts empty. Configure the back-end sockets, then hand out the
/// front sockets from [`input`](Self::input) and [`output`](Self::output);
/// those stay valid across reconfiguration and clearing.
pub struct CacheEntry {
    state: Arc<Mutex<CacheState>>,
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("strategy", &state.strategy)
            .field("cached", &state.cached.as_ref().map(|c| c.buffer.name()))
            .field("dirty", &state.cached.as_ref().is_some_and(|c| c.dirty))
            .finish()
    }
}

impl CacheEntry {
    /// Create an empty entry drawing buffers from `pool`.
    pub fn new(strategy: Strategy, pool: BufferPool) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                strategy,
                pool,
                cached: None,
                input: None,
                output: None,
            })),
        }
    }

    /// Create an empty entry with the strategy and pool from `config`.
    pub fn with_config(config: &IoConfig) -> Self {
        Self::new(config.strategy, BufferPool::from_config(&config.pool))
    }

    pub fn strategy(&self) -> Strategy {
        self.state.lock().strategy
    }

    /// Replace the back-end input socket. The cached content is kept.
    pub fn configure_input(&self, socket: impl InputSocket + 'static) -> &Self {
        self.state.lock().input = Some(Box::new(socket));
        self
    }

    /// Replace the back-end output socket. The cached content is kept.
    pub fn configure_output(&self, socket: impl OutputSocket + 'static) -> &Self {
        self.state.lock().output = Some(Box::new(socket));
        self
    }

    /// Front socket for reading through the cache.
    pub fn input(&self) -> CacheInputSocket {
        CacheInputSocket {
            state: Arc::clone(&self.state),
            peer: None,
        }
    }

    /// Front socket for writing into the cache.
    pub fn output(&self) -> CacheOutputSocket {
        CacheOutputSocket {
            state: Arc::clone(&self.state),
            peer: None,
        }
    }

    /// Write dirty content to the back-end output socket.
    ///
    /// Does nothing when the entry is empty or clean. Fails with
    /// [`IoError::NotConfigured`] if there is something to write but no
    /// output socket; the content then stays dirty. A failed copy also keeps
    /// it dirty, so the flush can be retried.
    #[tracing::instrument(skip(self), name = "cache.flush")]
    pub fn flush(&self) -> IoResult<()> {
        self.state.lock().flush()
    }

    /// Drop the cached content and return its buffer to the pool.
    ///
    /// **This does not flush.** Dirty content is discarded. Call
    /// [`flush`](Self::flush) first to keep it. Streams already reading the
    /// old content can finish.
    pub fn clear(&self) -> IoResult<()> {
        self.state.lock().clear()
    }

    /// Metadata of the cached buffer, or `None` while empty.
    pub fn entry(&self) -> Option<EntryMeta> {
        self.state.lock().cached.as_ref().map(|c| c.buffer.meta())
    }

    /// Size of the cached content, `None` while empty.
    pub fn size(&self, kind: SizeKind) -> Option<u64> {
        self.entry().and_then(|meta| meta.size(kind))
    }

    /// Access time of the cached buffer, `None` while empty.
    pub fn time(&self, kind: AccessKind) -> Option<i64> {
        self.entry().and_then(|meta| meta.time(kind))
    }

    pub fn is_cached(&self) -> bool {
        self.state.lock().cached.is_some()
    }

    /// Returns true if the cache holds writes not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().cached.as_ref().is_some_and(|c| c.dirty)
    }
}

/// Reads an entry through its cache.
pub struct CacheInputSocket {
    state: Arc<Mutex<CacheState>>,
    peer: Option<EntryMeta>,
}

impl InputSocket for CacheInputSocket {
    fn target(&self) -> IoResult<EntryMeta> {
        let state = self.state.lock();
        let back = state.input.as_ref().map(|s| s.target());
        state.front_target(back, "input")
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.peer.as_ref()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.peer = peer;
    }

    fn stream(&mut self) -> IoResult<InputStream> {
        self.state
            .lock()
            .with_loaded(|buffer| buffer.input().stream())
    }

    fn channel(&mut self) -> IoResult<InputChannel> {
        self.state
            .lock()
            .with_loaded(|buffer| buffer.input().channel())
    }
}

/// Writes an entry through its cache.
pub struct CacheOutputSocket {
    state: Arc<Mutex<CacheState>>,
    peer: Option<EntryMeta>,
}

impl OutputSocket for CacheOutputSocket {
    fn target(&self) -> IoResult<EntryMeta> {
        let state = self.state.lock();
        let back = match (&state.output, &state.input) {
            (Some(socket), _) => Some(socket.target()),
            (None, Some(socket)) => Some(socket.target()),
            (None, None) => None,
        };
        state.front_target(back, "output")
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.peer.as_ref()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.peer = peer;
    }

    /// Open a stream into a fresh buffer.
    ///
    /// The cache does not change until the stream is closed successfully;
    /// only then does the new buffer replace the cached content.
    fn stream(&mut self) -> IoResult<Box<dyn OutputStream>> {
        let buffer = self.state.lock().pool.allocate()?;
        let mut socket = buffer.output();
        socket.bind(self.peer.clone());
        match socket.stream() {
            Ok(inner) => Ok(Box::new(CacheOutputStream {
                inner: Some(inner),
                buffer: Some(buffer),
                state: Arc::clone(&self.state),
            })),
            Err(e) => {
                discard(buffer);
                Err(e)
            }
        }
    }
}

/// Front write stream; installs its buffer in the cache when closed.
struct CacheOutputStream {
    inner: Option<Box<dyn OutputStream>>,
    buffer: Option<Buffer>,
    state: Arc<Mutex<CacheState>>,
}

impl CacheOutputStream {
    fn finish(&mut self) -> IoResult<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        let Some(buffer) = self.buffer.take() else {
            return inner.close();
        };
        if let Err(e) = inner.close() {
            discard(buffer);
            return Err(e);
        }
        self.state.lock().install(buffer)
    }
}

impl Write for CacheOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            Some(inner) => inner.write(buf),
            None => Err(io::Error::other("cache stream is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for CacheOutputStream {
    fn close(mut self: Box<Self>) -> IoResult<()> {
        self.finish()
    }
}

impl Drop for CacheOutputStream {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("closing cache stream on drop failed: {}", e);
        }
    }
}
