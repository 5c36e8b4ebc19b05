//! Shared helpers for arcfs-kernel integration tests.

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arcfs_kernel::io::{
    InputSocket, InputStream, IoError, IoResult, LazyOutputSocket, MemoryArchive, OutputService,
    OutputSocket, OutputStream,
};
use arcfs_kernel::EntryMeta;
use tracing_subscriber::EnvFilter;

/// Route tracing output to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Entry contents worth checking: empty, short, and larger than one copy
/// buffer.
pub fn samples() -> Vec<Vec<u8>> {
    let large: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
    vec![Vec::new(), b"hello, archive".to_vec(), large]
}

/// Number of files directly inside `dir`.
pub fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Counts how often the wrapped socket opens a stream.
pub struct Counting<S> {
    inner: S,
    opens: Arc<AtomicUsize>,
}

impl<S> Counting<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                opens: Arc::clone(&opens),
            },
            opens,
        )
    }
}

impl<S: InputSocket> InputSocket for Counting<S> {
    fn target(&self) -> IoResult<EntryMeta> {
        self.inner.target()
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.inner.peer()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.inner.bind(peer)
    }

    fn stream(&mut self) -> IoResult<InputStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.stream()
    }
}

impl<S: OutputSocket> OutputSocket for Counting<S> {
    fn target(&self) -> IoResult<EntryMeta> {
        self.inner.target()
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.inner.peer()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.inner.bind(peer)
    }

    fn stream(&mut self) -> IoResult<Box<dyn OutputStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.stream()
    }
}

/// Input socket whose entry exists but can never be opened.
#[derive(Default)]
pub struct BrokenInput {
    peer: Option<EntryMeta>,
}

impl InputSocket for BrokenInput {
    fn target(&self) -> IoResult<EntryMeta> {
        Ok(EntryMeta::file("broken"))
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.peer.as_ref()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.peer = peer;
    }

    fn stream(&mut self) -> IoResult<InputStream> {
        Err(IoError::Io(io::Error::other("device unplugged")))
    }
}

/// Memory archive that fails to open entries with the given names.
pub struct Rejecting {
    pub inner: MemoryArchive,
    pub reject: Vec<&'static str>,
}

impl OutputService for Rejecting {
    fn size(&self) -> usize {
        OutputService::size(&self.inner)
    }

    fn entries(&self) -> Vec<EntryMeta> {
        OutputService::entries(&self.inner)
    }

    fn entry(&self, name: &str) -> Option<EntryMeta> {
        OutputService::entry(&self.inner, name)
    }

    fn output(&self, entry: EntryMeta) -> Box<dyn OutputSocket> {
        if !self.reject.iter().any(|name| *name == entry.name()) {
            return self.inner.output(entry);
        }
        Box::new(LazyOutputSocket::new(
            move || Ok(entry.clone()),
            |target: &EntryMeta, _: Option<&EntryMeta>| {
                Err(IoError::Io(io::Error::other(format!(
                    "no space left for {}",
                    target.name()
                ))))
            },
        ))
    }

    fn close(&mut self) -> IoResult<()> {
        self.inner.close()
    }
}
