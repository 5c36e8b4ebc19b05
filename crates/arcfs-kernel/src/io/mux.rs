//! Output multiplexer.
//!
//! Archive writers can only produce one entry at a time. [`OutputMux`]
//! decorates such a single-writer [`OutputService`] so callers may keep any
//! number of entry streams open at once:
//!
//! - The first writer gets the target's write slot and streams directly.
//! - Writers that arrive while the slot is taken write into pooled overflow
//!   buffers instead (temp files by default).
//! - Whenever the slot becomes free, closed overflow entries are copied into
//!   the target in the order their writers were first opened.
//!
//! Overflow stores distinguish two kinds of failure. Reading a buffer back is
//! an input-side failure: the entry is dropped, a warning collected, and the
//! drain continues. Writing to the target is an output-side failure: the
//! drain stops and the error is returned with the warnings chained on.

use std::io::{self, Write};
use std::sync::Arc;

use arcfs_types::{EntryMeta, SizeKind};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::config::IoConfig;
use super::error::{IoError, IoResult, Warnings};
use super::pool::{Buffer, BufferPool};
use super::service::OutputService;
use super::socket::{copy, OutputSocket, OutputStream};

/// State of the target's single write slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    Writing,
}

/// An entry written to temporary storage while the target was busy.
struct Overflow {
    /// Distinguishes a replaced entry from the one now stored under its name.
    id: u64,
    buffer: Buffer,
    meta: EntryMeta,
    closed: bool,
}

struct MuxState<S: OutputService> {
    target: S,
    slot: Slot,
    pool: BufferPool,
    overflow: IndexMap<String, Overflow>,
    next_id: u64,
    closed: bool,
}

impl<S: OutputService> MuxState<S> {
    /// Store every closed overflow entry, in insertion order.
    #[tracing::instrument(skip(self), name = "mux.store_temps")]
    fn store_temps(&mut self) -> IoResult<()> {
        if self.slot == Slot::Writing {
            return Ok(());
        }

        let mut warnings = Warnings::new();
        let mut index = 0;
        while let Some((_, pending)) = self.overflow.get_index(index) {
            if !pending.closed {
                index += 1;
                continue;
            }
            let Some((name, pending)) = self.overflow.shift_remove_index(index) else {
                break;
            };
            match self.store(pending) {
                Ok(()) => {}
                Err(e) if !e.is_fatal() => {
                    warn!("dropping overflow entry {}: {}", name, e);
                    warnings.warn(e);
                }
                Err(e) => return Err(warnings.fail(e)),
            }
        }
        warnings.finish()
    }

    /// Copy one closed overflow entry into the target.
    ///
    /// The buffer is released whether or not the copy succeeds.
    fn store(&mut self, pending: Overflow) -> IoResult<()> {
        let mut socket = self.target.output(pending.meta);
        let result = copy(&mut pending.buffer.input(), &mut *socket);
        discard(pending.buffer);
        let n = result?;
        debug!("stored {} bytes of overflow into target", n);
        Ok(())
    }

    fn release_pending(&mut self) {
        for (name, pending) in self.overflow.drain(..) {
            debug!("releasing unstored overflow entry {}", name);
            discard(pending.buffer);
        }
    }
}

impl<S: OutputService> Drop for MuxState<S> {
    fn drop(&mut self) {
        if !self.overflow.is_empty() {
            warn!(
                "multiplexer dropped with {} overflow entries not stored",
                self.overflow.len()
            );
        }
    }
}

fn discard(buffer: Buffer) {
    let name = buffer.name();
    if let Err(e) = buffer.release() {
        warn!("failed to release buffer {}: {}", name, e);
    }
}

/// Lets many entries be written at once into a single-writer target.
pub struct OutputMux<S: OutputService> {
    state: Arc<Mutex<MuxState<S>>>,
}

impl<S: OutputService + 'static> OutputMux<S> {
    /// Decorate `target`, buffering overflow in `pool`.
    pub fn new(target: S, pool: BufferPool) -> Self {
        Self {
            state: Arc::new(Mutex::new(MuxState {
                target,
                slot: Slot::Idle,
                pool,
                overflow: IndexMap::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    /// Decorate `target` with the overflow pool from `config`.
    pub fn with_config(target: S, config: &IoConfig) -> Self {
        Self::new(target, BufferPool::from_config(&config.overflow))
    }

    /// Returns true while a writer streams directly into the target.
    pub fn is_busy(&self) -> bool {
        self.state.lock().slot == Slot::Writing
    }

    /// Number of overflow entries waiting to be stored.
    pub fn pending(&self) -> usize {
        self.state.lock().overflow.len()
    }

    /// Try to store closed overflow entries now.
    ///
    /// Happens automatically whenever the write slot frees up.
    pub fn store_temps(&self) -> IoResult<()> {
        self.state.lock().store_temps()
    }
}

impl<S: OutputService + 'static> OutputService for OutputMux<S> {
    fn size(&self) -> usize {
        let state = self.state.lock();
        state.target.size() + state.overflow.len()
    }

    /// Target entries first, then pending overflow in insertion order.
    fn entries(&self) -> Vec<EntryMeta> {
        let state = self.state.lock();
        let mut entries = state.target.entries();
        entries.extend(state.overflow.values().map(|o| o.meta.clone()));
        entries
    }

    fn entry(&self, name: &str) -> Option<EntryMeta> {
        let state = self.state.lock();
        state
            .target
            .entry(name)
            .or_else(|| state.overflow.get(name).map(|o| o.meta.clone()))
    }

    fn output(&self, entry: EntryMeta) -> Box<dyn OutputSocket> {
        Box::new(MuxOutputSocket {
            state: Arc::clone(&self.state),
            entry,
            peer: None,
        })
    }

    /// Store all overflow and close the target.
    ///
    /// # Panics
    ///
    /// If a direct writer is still open, or if an overflow writer is still
    /// open once every closed entry has been stored.
    #[tracing::instrument(skip(self), name = "mux.close")]
    fn close(&mut self) -> IoResult<()> {
        let mut state = self.state.lock();
        assert!(
            state.slot == Slot::Idle,
            "multiplexer closed while an entry is being written"
        );

        let drained = state.store_temps();
        match &drained {
            Err(e) if e.is_fatal() => state.release_pending(),
            _ => assert!(
                state.overflow.is_empty(),
                "multiplexer closed with {} overflow writers still open",
                state.overflow.len()
            ),
        }
        state.closed = true;

        // The target is closed even when draining failed.
        let closed = state.target.close();
        match (drained, closed) {
            (Ok(()), closed) => closed,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(c)) => Err(IoError::chain(e, vec![c])),
        }
    }
}

/// Socket for writing one entry through an [`OutputMux`].
pub struct MuxOutputSocket<S: OutputService> {
    state: Arc<Mutex<MuxState<S>>>,
    entry: EntryMeta,
    peer: Option<EntryMeta>,
}

impl<S: OutputService + 'static> MuxOutputSocket<S> {
    /// Open a stream directly against the target and take its write slot.
    fn direct(&self, state: &mut MuxState<S>) -> IoResult<Box<dyn OutputStream>> {
        let mut socket = state.target.output(self.entry.clone());
        socket.bind(self.peer.clone());
        let inner = socket.stream()?;
        state.slot = Slot::Writing;
        debug!("writing {} directly", self.entry.name());
        Ok(Box::new(DirectStream {
            inner: Some(inner),
            slot: WriteSlot {
                state: Arc::clone(&self.state),
                held: true,
            },
        }))
    }

    /// Open a stream into a fresh overflow buffer.
    fn overflow(&self, state: &mut MuxState<S>) -> IoResult<Box<dyn OutputStream>> {
        let mut meta = self.entry.clone();
        if let Some(size) = self.peer.as_ref().and_then(|p| p.size(SizeKind::Data)) {
            meta.set_size(SizeKind::Data, Some(size));
        }

        let buffer = state.pool.allocate()?;
        let mut sink = buffer.output();
        sink.bind(self.peer.clone());
        let inner = match sink.stream() {
            Ok(inner) => inner,
            Err(e) => {
                discard(buffer);
                return Err(e);
            }
        };

        state.next_id += 1;
        let id = state.next_id;
        let name = meta.name().to_string();
        debug!("target busy, buffering {} in {}", name, buffer.name());
        let replaced = state.overflow.insert(
            name.clone(),
            Overflow {
                id,
                buffer,
                meta,
                closed: false,
            },
        );
        if let Some(old) = replaced {
            debug!("overflow entry {} replaced by a newer writer", name);
            discard(old.buffer);
        }

        Ok(Box::new(OverflowStream {
            inner: Some(inner),
            state: Arc::clone(&self.state),
            name,
            id,
        }))
    }
}

impl<S: OutputService + 'static> OutputSocket for MuxOutputSocket<S> {
    fn target(&self) -> IoResult<EntryMeta> {
        Ok(self.entry.clone())
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.peer.as_ref()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.peer = peer;
    }

    fn stream(&mut self) -> IoResult<Box<dyn OutputStream>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(IoError::Closed);
        }
        match state.slot {
            Slot::Idle => self.direct(&mut state),
            Slot::Writing => self.overflow(&mut state),
        }
    }
}

/// Holds the target's write slot; frees it and drains overflow on release.
struct WriteSlot<S: OutputService> {
    state: Arc<Mutex<MuxState<S>>>,
    held: bool,
}

impl<S: OutputService> WriteSlot<S> {
    fn release(&mut self) -> IoResult<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        let mut state = self.state.lock();
        state.slot = Slot::Idle;
        state.store_temps()
    }
}

impl<S: OutputService> Drop for WriteSlot<S> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("storing overflow after dropped writer failed: {}", e);
        }
    }
}

/// Stream straight into the target.
struct DirectStream<S: OutputService> {
    inner: Option<Box<dyn OutputStream>>,
    slot: WriteSlot<S>,
}

impl<S: OutputService> DirectStream<S> {
    fn finish(&mut self) -> IoResult<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        let closed = inner.close();
        let stored = self.slot.release();
        match (closed, stored) {
            (Ok(()), stored) => stored,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(s)) => Err(IoError::chain(e, vec![s])),
        }
    }
}

impl<S: OutputService> Write for DirectStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            Some(inner) => inner.write(buf),
            None => Err(io::Error::other("entry stream is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl<S: OutputService> OutputStream for DirectStream<S> {
    fn close(mut self: Box<Self>) -> IoResult<()> {
        self.finish()
    }
}

impl<S: OutputService> Drop for DirectStream<S> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("closing entry stream on drop failed: {}", e);
        }
    }
}

/// Stream into an overflow buffer.
struct OverflowStream<S: OutputService> {
    inner: Option<Box<dyn OutputStream>>,
    state: Arc<Mutex<MuxState<S>>>,
    name: String,
    id: u64,
}

impl<S: OutputService> OverflowStream<S> {
    fn finish(&mut self) -> IoResult<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        let closed = inner.close();

        let mut state = self.state.lock();
        let current = state
            .overflow
            .get(&self.name)
            .is_some_and(|o| o.id == self.id);
        if !current {
            if state.closed {
                warn!("overflow entry {} closed after the multiplexer", self.name);
                return closed.and(Err(IoError::Closed));
            }
            debug!("overflow entry {} was superseded", self.name);
            return closed;
        }
        if let Err(e) = closed {
            if let Some(pending) = state.overflow.shift_remove(&self.name) {
                discard(pending.buffer);
            }
            return Err(e);
        }
        if let Some(pending) = state.overflow.get_mut(&self.name) {
            pending.closed = true;
        }
        state.store_temps()
    }
}

impl<S: OutputService> Write for OverflowStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            Some(inner) => inner.write(buf),
            None => Err(io::Error::other("overflow stream is closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl<S: OutputService> OutputStream for OverflowStream<S> {
    fn close(mut self: Box<Self>) -> IoResult<()> {
        self.finish()
    }
}

impl<S: OutputService> Drop for OverflowStream<S> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("closing overflow stream on drop failed: {}", e);
        }
    }
}
