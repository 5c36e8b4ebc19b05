//! In-memory archive.
//!
//! A container held entirely in memory that behaves like a streaming archive
//! writer: it accepts one entry stream at a time and fails a second one with
//! [`IoError::Busy`]. Used as the simplest driver and for testing.

use std::io::{self, Cursor, Write};
use std::sync::Arc;

use arcfs_types::{AccessKind, EntryMeta, SizeKind};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::io::error::{IoError, IoResult};
use crate::io::service::{InputService, OutputService};
use crate::io::socket::{
    InputChannel, InputSocket, InputStream, LazyOutputSocket, OutputSocket, OutputStream,
};

#[derive(Debug, Default)]
struct ArchiveState {
    entries: IndexMap<String, (EntryMeta, Arc<[u8]>)>,
    /// Entry currently being written.
    writing: Option<String>,
    /// Entry names in the order their streams were committed.
    log: Vec<String>,
    closed: bool,
    reads: usize,
    writes: usize,
}

/// Single-writer in-memory archive.
///
/// Clones are handles onto the same archive.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    state: Arc<Mutex<ArchiveState>>,
}

impl MemoryArchive {
    /// Create an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an entry directly, bypassing the single-writer rule and counters.
    pub fn insert(&self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        let name = name.into();
        let data: Vec<u8> = data.into();
        let mut meta = EntryMeta::file(name.clone());
        meta.set_size(SizeKind::Data, Some(data.len() as u64));
        meta.set_size(SizeKind::Storage, Some(data.len() as u64));
        meta.touch(AccessKind::Create);
        meta.touch(AccessKind::Write);
        self.state.lock().entries.insert(name, (meta, Arc::from(data)));
    }

    /// Content of an entry.
    pub fn data(&self, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .entries
            .get(name)
            .map(|(_, data)| data.to_vec())
    }

    /// Entry names in the order their writes were committed.
    pub fn write_log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Number of read streams opened.
    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    /// Number of write streams committed.
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    /// Returns true while an entry stream is open.
    pub fn is_writing(&self) -> bool {
        self.state.lock().writing.is_some()
    }

    /// Returns true once the output side has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn resolve(state: &Mutex<ArchiveState>, name: &str) -> IoResult<EntryMeta> {
        state
            .lock()
            .entries
            .get(name)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| IoError::not_found(name))
    }

    fn open_read(state: &Mutex<ArchiveState>, name: &str) -> IoResult<Cursor<Arc<[u8]>>> {
        let mut state = state.lock();
        let data = match state.entries.get_mut(name) {
            Some((meta, data)) => {
                meta.touch(AccessKind::Read);
                Arc::clone(data)
            }
            None => return Err(IoError::not_found(name)),
        };
        state.reads += 1;
        Ok(Cursor::new(data))
    }
}

impl InputService for MemoryArchive {
    fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn entries(&self) -> Vec<EntryMeta> {
        self.state
            .lock()
            .entries
            .values()
            .map(|(meta, _)| meta.clone())
            .collect()
    }

    fn entry(&self, name: &str) -> Option<EntryMeta> {
        Self::resolve(&self.state, name).ok()
    }

    fn input(&self, name: &str) -> Box<dyn InputSocket> {
        Box::new(MemoryInputSocket {
            state: Arc::clone(&self.state),
            name: name.to_string(),
            peer: None,
        })
    }
}

/// Reads one entry; resolves the entry on every use.
struct MemoryInputSocket {
    state: Arc<Mutex<ArchiveState>>,
    name: String,
    peer: Option<EntryMeta>,
}

impl InputSocket for MemoryInputSocket {
    fn target(&self) -> IoResult<EntryMeta> {
        MemoryArchive::resolve(&self.state, &self.name)
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.peer.as_ref()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.peer = peer;
    }

    fn stream(&mut self) -> IoResult<InputStream> {
        Ok(Box::new(MemoryArchive::open_read(&self.state, &self.name)?))
    }

    fn channel(&mut self) -> IoResult<InputChannel> {
        Ok(Box::new(MemoryArchive::open_read(&self.state, &self.name)?))
    }
}

impl OutputService for MemoryArchive {
    fn size(&self) -> usize {
        InputService::size(self)
    }

    fn entries(&self) -> Vec<EntryMeta> {
        InputService::entries(self)
    }

    fn entry(&self, name: &str) -> Option<EntryMeta> {
        InputService::entry(self, name)
    }

    fn output(&self, entry: EntryMeta) -> Box<dyn OutputSocket> {
        let state = Arc::clone(&self.state);
        Box::new(LazyOutputSocket::new(
            move || Ok(entry.clone()),
            move |entry: &EntryMeta, peer: Option<&EntryMeta>| {
                let mut guard = state.lock();
                if guard.closed {
                    return Err(IoError::Closed);
                }
                if guard.writing.is_some() {
                    return Err(IoError::busy(entry.name()));
                }
                guard.writing = Some(entry.name().to_string());
                drop(guard);

                let mut meta = entry.clone();
                if let Some(peer) = peer {
                    // Keep what the source knew, e.g. its stored size.
                    meta.merge_known(peer);
                }
                Ok(Box::new(MemoryOutputStream {
                    state: Arc::clone(&state),
                    meta,
                    data: Some(Vec::new()),
                }) as Box<dyn OutputStream>)
            },
        ))
    }

    fn close(&mut self) -> IoResult<()> {
        let mut state = self.state.lock();
        if let Some(name) = &state.writing {
            warn!("closing memory archive while {} is still being written", name);
        }
        state.closed = true;
        debug!("memory archive closed with {} entries", state.entries.len());
        Ok(())
    }
}

/// Collects one entry and commits it on close.
struct MemoryOutputStream {
    state: Arc<Mutex<ArchiveState>>,
    meta: EntryMeta,
    data: Option<Vec<u8>>,
}

impl MemoryOutputStream {
    fn finish(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };
        let len = data.len() as u64;
        let mut meta = self.meta.clone();
        meta.set_size(SizeKind::Data, Some(len));
        if meta.size(SizeKind::Storage).is_none() {
            meta.set_size(SizeKind::Storage, Some(len));
        }
        meta.touch(AccessKind::Write);

        let name = meta.name().to_string();
        let mut state = self.state.lock();
        state.entries.insert(name.clone(), (meta, Arc::from(data)));
        state.log.push(name);
        state.writes += 1;
        state.writing = None;
    }
}

impl Write for MemoryOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.data {
            Some(data) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => Err(io::Error::other("entry stream is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputStream for MemoryOutputStream {
    fn close(mut self: Box<Self>) -> IoResult<()> {
        self.finish();
        Ok(())
    }
}

impl Drop for MemoryOutputStream {
    fn drop(&mut self) {
        self.finish();
    }
}
