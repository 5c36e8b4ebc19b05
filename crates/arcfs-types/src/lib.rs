//! # arcfs-types
//!
//! Entry metadata shared by archive drivers, buffer pools, caches and the
//! output multiplexer.
//!
//! An [`EntryMeta`] names a resource inside a container and records what is
//! known about it: its [`EntryType`], one size per [`SizeKind`] and one
//! timestamp per [`AccessKind`]. Values that have not been determined yet are
//! `None`, never zero, so a caller can always tell "empty" from "unknown".

mod entry;

pub use entry::{AccessKind, EntryMeta, EntryType, SizeKind, now_millis};
