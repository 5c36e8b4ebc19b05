//! # arcfs-kernel
//!
//! I/O virtualization core for arcfs, the virtual archive filesystem.
//!
//! Archive drivers hand out sockets onto their entries. This crate connects
//! those sockets to the rest of the filesystem:
//! - Entry caches decouple a file's content from the archive entry it came
//!   from, so it can be read repeatedly and written before it is flushed
//! - Output multiplexers let any number of entries be written at once even
//!   though archive formats accept one entry at a time
//! - Buffer pools provide the temporary storage both of them need
//!
//! Archive formats, mounting and path handling live elsewhere.

pub mod io;

pub use arcfs_types::{AccessKind, EntryMeta, EntryType, SizeKind};
pub use io::{
    CacheEntry, InputService, InputSocket, IoConfig, IoError, IoResult, MemoryArchive, OutputMux,
    OutputService, OutputSocket, Strategy,
};
