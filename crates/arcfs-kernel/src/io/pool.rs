//! Pooled temporary buffers.
//!
//! A [`BufferPool`] hands out [`Buffer`]s backed either by memory or by a
//! temp file. Every buffer exposes its own [`EntryMeta`] plus input and
//! output sockets onto its storage, so it can take part in a [`copy`] like
//! any archive entry.
//!
//! Ownership: the borrower owns a buffer until it is released. Releasing
//! consumes the buffer, so it cannot be released twice; dropping an
//! unreleased buffer releases it. Temp files are deleted once the buffer and
//! every stream opened on it are gone.
//!
//! Both storage kinds commit a write stream in one step when it closes.
//! Until then readers see the previous content, and a reader opened before
//! the commit keeps reading what it started with.
//!
//! [`copy`]: super::socket::copy

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arcfs_types::{AccessKind, EntryMeta, SizeKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, warn};

use super::config::PoolConfig;
use super::error::{IoError, IoResult};
use super::socket::{InputChannel, InputSocket, InputStream, OutputSocket, OutputStream};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Where pooled buffers keep their bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// Heap memory.
    #[default]
    Memory,
    /// One temp file per buffer.
    TempFile,
}

/// Allocates and tracks temporary buffers.
///
/// Cloning is cheap; clones share one registry of outstanding buffers. The
/// pool is not meant to be hammered from many threads at once, but it is
/// `Send + Sync` so it can be shared by the caches and multiplexers of one
/// mount.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    id: u64,
    storage: StorageKind,
    temp_dir: Option<PathBuf>,
    prefix: String,
    next_buffer: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let live = self.live.get_mut();
        if !live.is_empty() {
            warn!("buffer pool {} dropped with {} outstanding buffers", self.id, live.len());
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.shared.id)
            .field("storage", &self.shared.storage)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl BufferPool {
    /// Create a pool with the given storage in the system temp dir.
    pub fn new(storage: StorageKind) -> Self {
        Self::from_config(&PoolConfig {
            storage,
            ..PoolConfig::default()
        })
    }

    /// Create a memory-backed pool.
    pub fn memory() -> Self {
        Self::new(StorageKind::Memory)
    }

    /// Create a pool of temp files in `dir` (system temp dir if `None`).
    pub fn temp_files(dir: Option<PathBuf>) -> Self {
        Self::from_config(&PoolConfig {
            storage: StorageKind::TempFile,
            temp_dir: dir,
            ..PoolConfig::default()
        })
    }

    /// Create a pool from configuration.
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                storage: config.storage,
                temp_dir: config.temp_dir.clone(),
                prefix: config.prefix.clone(),
                next_buffer: AtomicU64::new(1),
                live: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Pool identity, unique within the process.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Storage used for new buffers.
    pub fn storage(&self) -> StorageKind {
        self.shared.storage
    }

    /// Number of buffers allocated and not yet released.
    pub fn outstanding(&self) -> usize {
        self.shared.live.lock().len()
    }

    /// Allocate a new, empty buffer.
    ///
    /// Outstanding buffers never share storage.
    pub fn allocate(&self) -> IoResult<Buffer> {
        let shared = &self.shared;
        let id = shared.next_buffer.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}{}-{}", shared.prefix, shared.id, id);

        let storage = match shared.storage {
            StorageKind::Memory => Storage::Memory(Mutex::new(Arc::from(Vec::new()))),
            StorageKind::TempFile => {
                let mut builder = tempfile::Builder::new();
                builder.prefix(&shared.prefix);
                let file = match &shared.temp_dir {
                    Some(dir) => builder.tempfile_in(dir)?,
                    None => builder.tempfile()?,
                };
                Storage::File(file.into_temp_path())
            }
        };

        let mut meta = EntryMeta::file(name);
        meta.touch(AccessKind::Create);
        meta.set_size(SizeKind::Data, Some(0));
        meta.set_size(SizeKind::Storage, Some(0));

        shared.live.lock().insert(id);
        debug!("allocated buffer {}", meta.name());

        Ok(Buffer {
            id,
            pool_id: shared.id,
            pool: Arc::downgrade(shared),
            meta: Arc::new(Mutex::new(meta)),
            storage: Arc::new(storage),
            released: false,
        })
    }

    /// Return a buffer to this pool.
    ///
    /// Fails with [`IoError::ForeignBuffer`] if another pool allocated it; the
    /// buffer then goes back to its own pool when dropped.
    pub fn release(&self, mut buffer: Buffer) -> IoResult<()> {
        if buffer.pool_id != self.shared.id {
            return Err(IoError::ForeignBuffer(buffer.name()));
        }
        buffer.release_in(&self.shared);
        Ok(())
    }
}

/// Backing store of one buffer.
enum Storage {
    Memory(Mutex<Arc<[u8]>>),
    File(TempPath),
}

impl Storage {
    fn reader(self: &Arc<Self>) -> io::Result<InputChannel> {
        match &**self {
            Storage::Memory(content) => Ok(Box::new(Cursor::new(Arc::clone(&content.lock())))),
            Storage::File(path) => Ok(Box::new(FileReader {
                file: File::open(path)?,
                _storage: Arc::clone(self),
            })),
        }
    }

    fn sink(&self) -> io::Result<Sink> {
        match self {
            Storage::Memory(_) => Ok(Sink::Memory(Vec::new())),
            Storage::File(path) => {
                // Rewrites go to a sibling file so readers keep the old content.
                let dir = path.parent().map_or_else(std::env::temp_dir, Path::to_path_buf);
                let staged = tempfile::Builder::new().prefix(".staged-").tempfile_in(dir)?;
                Ok(Sink::File(BufWriter::new(staged)))
            }
        }
    }

    /// Make the sink's bytes the new content. Returns the content length.
    fn commit(&self, sink: Sink) -> io::Result<u64> {
        match (self, sink) {
            (Storage::Memory(content), Sink::Memory(data)) => {
                let len = data.len() as u64;
                *content.lock() = Arc::from(data);
                Ok(len)
            }
            (Storage::File(path), Sink::File(writer)) => {
                let staged = writer.into_inner().map_err(|e| e.into_error())?;
                staged.as_file().sync_data()?;
                let len = staged.as_file().metadata()?.len();
                staged.persist(&**path).map_err(|e| e.error)?;
                Ok(len)
            }
            _ => Err(io::Error::other("sink does not match buffer storage")),
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Storage::Memory(_) => None,
            Storage::File(path) => Some(&**path),
        }
    }
}

/// Keeps a temp file alive while it is being read.
struct FileReader {
    file: File,
    _storage: Arc<Storage>,
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

enum Sink {
    Memory(Vec<u8>),
    File(BufWriter<NamedTempFile>),
}

/// One allocation from a [`BufferPool`].
pub struct Buffer {
    id: u64,
    pool_id: u64,
    pool: Weak<PoolShared>,
    meta: Arc<Mutex<EntryMeta>>,
    storage: Arc<Storage>,
    released: bool,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name())
            .field("pool", &self.pool_id)
            .finish()
    }
}

impl Buffer {
    /// Buffer name (unique per pool).
    pub fn name(&self) -> String {
        self.meta.lock().name().to_string()
    }

    /// Snapshot of the buffer's metadata.
    pub fn meta(&self) -> EntryMeta {
        self.meta.lock().clone()
    }

    /// Length of the committed content.
    pub fn len(&self) -> u64 {
        self.meta.lock().size(SizeKind::Data).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the temp file, for file-backed buffers.
    pub fn path(&self) -> Option<&Path> {
        self.storage.path()
    }

    /// Socket for reading the buffer.
    pub fn input(&self) -> BufferInputSocket {
        BufferInputSocket {
            meta: Arc::clone(&self.meta),
            storage: Arc::clone(&self.storage),
            peer: None,
        }
    }

    /// Socket for replacing the buffer's content.
    pub fn output(&self) -> BufferOutputSocket {
        BufferOutputSocket {
            meta: Arc::clone(&self.meta),
            storage: Arc::clone(&self.storage),
            peer: None,
        }
    }

    /// Return the buffer to the pool that allocated it.
    pub fn release(mut self) -> IoResult<()> {
        if let Some(pool) = self.pool.upgrade() {
            self.release_in(&pool);
        } else {
            self.released = true;
        }
        Ok(())
    }

    fn release_in(&mut self, pool: &PoolShared) {
        if self.released {
            return;
        }
        self.released = true;
        pool.live.lock().remove(&self.id);
        debug!("released buffer {}", self.meta.lock().name());
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.released {
            if let Some(pool) = self.pool.upgrade() {
                self.release_in(&pool);
            }
        }
    }
}

/// Reads a buffer's committed content.
pub struct BufferInputSocket {
    meta: Arc<Mutex<EntryMeta>>,
    storage: Arc<Storage>,
    peer: Option<EntryMeta>,
}

impl InputSocket for BufferInputSocket {
    fn target(&self) -> IoResult<EntryMeta> {
        Ok(self.meta.lock().clone())
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.peer.as_ref()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.peer = peer;
    }

    fn stream(&mut self) -> IoResult<InputStream> {
        let channel = self.channel()?;
        Ok(Box::new(channel))
    }

    fn channel(&mut self) -> IoResult<InputChannel> {
        let reader = self.storage.reader()?;
        self.meta.lock().touch(AccessKind::Read);
        Ok(reader)
    }
}

/// Replaces a buffer's content.
pub struct BufferOutputSocket {
    meta: Arc<Mutex<EntryMeta>>,
    storage: Arc<Storage>,
    peer: Option<EntryMeta>,
}

impl OutputSocket for BufferOutputSocket {
    fn target(&self) -> IoResult<EntryMeta> {
        Ok(self.meta.lock().clone())
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.peer.as_ref()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.peer = peer;
    }

    fn stream(&mut self) -> IoResult<Box<dyn OutputStream>> {
        Ok(Box::new(BufferOutputStream {
            sink: Some(self.storage.sink()?),
            meta: Arc::clone(&self.meta),
            storage: Arc::clone(&self.storage),
        }))
    }
}

/// Collects bytes and commits them to the buffer on close.
struct BufferOutputStream {
    sink: Option<Sink>,
    meta: Arc<Mutex<EntryMeta>>,
    storage: Arc<Storage>,
}

impl BufferOutputStream {
    fn finish(&mut self) -> IoResult<()> {
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };
        let len = self.storage.commit(sink)?;
        let mut meta = self.meta.lock();
        meta.set_size(SizeKind::Data, Some(len));
        meta.set_size(SizeKind::Storage, Some(len));
        meta.touch(AccessKind::Write);
        Ok(())
    }
}

impl Write for BufferOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.sink {
            Some(Sink::Memory(data)) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            Some(Sink::File(writer)) => writer.write(buf),
            None => Err(io::Error::other("buffer stream is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Some(Sink::File(writer)) => writer.flush(),
            _ => Ok(()),
        }
    }
}

impl OutputStream for BufferOutputStream {
    fn close(mut self: Box<Self>) -> IoResult<()> {
        self.finish()
    }
}

impl Drop for BufferOutputStream {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("closing buffer stream on drop failed: {}", e);
        }
    }
}
