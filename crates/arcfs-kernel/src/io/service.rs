//! Container services.
//!
//! Archive drivers expose a container as an [`InputService`] (entries that
//! can be read) and/or an [`OutputService`] (entries being written). Output
//! services may be *single-writer*: only one entry stream may be open at a
//! time. [`OutputMux`](super::mux::OutputMux) lifts that restriction by
//! decorating one.

use arcfs_types::EntryMeta;

use super::error::IoResult;
use super::socket::{InputSocket, OutputSocket};

/// Read side of a container.
pub trait InputService: Send {
    /// Number of entries.
    fn size(&self) -> usize;

    /// Snapshot of all entries.
    fn entries(&self) -> Vec<EntryMeta>;

    /// Look up one entry.
    fn entry(&self, name: &str) -> Option<EntryMeta>;

    /// Socket for reading `name`. A missing entry fails when the socket is
    /// used, not here.
    fn input(&self, name: &str) -> Box<dyn InputSocket>;
}

/// Write side of a container.
pub trait OutputService: Send {
    /// Number of entries written so far.
    fn size(&self) -> usize;

    /// Snapshot of all entries written so far, in order.
    fn entries(&self) -> Vec<EntryMeta>;

    /// Look up one entry.
    fn entry(&self, name: &str) -> Option<EntryMeta>;

    /// Socket for writing `entry`.
    fn output(&self, entry: EntryMeta) -> Box<dyn OutputSocket>;

    /// Finish the container. No entry may be written afterwards.
    fn close(&mut self) -> IoResult<()>;
}
