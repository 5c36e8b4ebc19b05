//! Container backends.
//!
//! Backends implement [`InputService`](super::service::InputService) and
//! [`OutputService`](super::service::OutputService) for concrete storage.

pub mod memory;

pub use memory::MemoryArchive;
