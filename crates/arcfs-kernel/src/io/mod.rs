//! I/O virtualization core.
//!
//! Key components:
//!
//! - [`InputSocket`] / [`OutputSocket`] - Lazily bound connectors to one
//!   entry, joined by [`copy`]
//! - [`BufferPool`] - Memory or temp-file buffers with their own sockets
//! - [`CacheEntry`] - Serves one back-end entry from a pooled buffer,
//!   write-through or write-back
//! - [`OutputMux`] - Lets many writers share a single-writer container
//! - [`MemoryArchive`] - In-memory single-writer container
//!
//! ## Design Decisions
//!
//! - **Fail late**: sockets resolve their entry when used, so a missing entry
//!   shows up as [`IoError::NotFound`] from `target()` or `stream()`.
//! - **Owned streams**: streams never borrow their socket or cache, and close
//!   themselves on drop.
//! - **Tagged failures**: [`copy`] marks every error as input- or
//!   output-side; multiplexer drains skip the former and stop on the latter.

pub mod backends;
mod cache;
mod config;
mod error;
mod mux;
mod pool;
mod service;
mod socket;

pub use backends::MemoryArchive;
pub use cache::{CacheEntry, CacheInputSocket, CacheOutputSocket, Strategy};
pub use config::{ConfigError, IoConfig, PoolConfig, DEFAULT_PREFIX};
pub use error::{IoError, IoResult, Warnings};
pub use mux::{MuxOutputSocket, OutputMux};
pub use pool::{Buffer, BufferInputSocket, BufferOutputSocket, BufferPool, StorageKind};
pub use service::{InputService, OutputService};
pub use socket::{
    copy, open_reader, read_all, write_all, InputChannel, InputSocket, InputStream,
    LazyInputSocket, LazyOutputSocket, OutputSocket, OutputStream, ReadSeek,
};
