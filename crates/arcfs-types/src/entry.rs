//! Entry metadata.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumCount, EnumIter, EnumString};

/// Type of a named resource in a container.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum EntryType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Anything else the container format knows about (links, devices, ...).
    Special,
}

/// The ways a size can be measured.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    EnumCount,
)]
#[strum(serialize_all = "snake_case")]
pub enum SizeKind {
    /// Uncompressed length of the content.
    Data,
    /// Bytes occupied in the container (after compression/encryption).
    Storage,
}

/// The kinds of access that carry a timestamp.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    EnumCount,
)]
#[strum(serialize_all = "snake_case")]
pub enum AccessKind {
    /// Last read.
    Read,
    /// Last write.
    Write,
    /// Creation.
    Create,
}

/// Milliseconds since the Unix epoch, the unit of every [`EntryMeta`] time.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Metadata of one entry.
///
/// The name is fixed at construction. Sizes and times change as data flows
/// through the entry; `None` means "unknown".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    name: String,
    kind: EntryType,
    sizes: [Option<u64>; SizeKind::COUNT],
    times: [Option<i64>; AccessKind::COUNT],
}

impl EntryMeta {
    /// Create metadata with every size and time unknown.
    pub fn new(name: impl Into<String>, kind: EntryType) -> Self {
        Self {
            name: name.into(),
            kind,
            sizes: [None; SizeKind::COUNT],
            times: [None; AccessKind::COUNT],
        }
    }

    /// Create metadata for a regular file.
    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, EntryType::File)
    }

    /// Create metadata for a directory.
    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, EntryType::Directory)
    }

    /// Entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry type.
    pub fn kind(&self) -> EntryType {
        self.kind
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryType::Directory)
    }

    /// Size of the given kind, `None` if unknown.
    pub fn size(&self, kind: SizeKind) -> Option<u64> {
        self.sizes[kind as usize]
    }

    /// Set (or forget, with `None`) a size. Returns the previous value.
    pub fn set_size(&mut self, kind: SizeKind, size: Option<u64>) -> Option<u64> {
        std::mem::replace(&mut self.sizes[kind as usize], size)
    }

    /// Builder form of [`set_size`](Self::set_size).
    pub fn with_size(mut self, kind: SizeKind, size: u64) -> Self {
        self.sizes[kind as usize] = Some(size);
        self
    }

    /// Time of the given access kind in epoch milliseconds, `None` if unknown.
    pub fn time(&self, kind: AccessKind) -> Option<i64> {
        self.times[kind as usize]
    }

    /// Set (or forget, with `None`) a time. Returns the previous value.
    pub fn set_time(&mut self, kind: AccessKind, millis: Option<i64>) -> Option<i64> {
        std::mem::replace(&mut self.times[kind as usize], millis)
    }

    /// Builder form of [`set_time`](Self::set_time).
    pub fn with_time(mut self, kind: AccessKind, millis: i64) -> Self {
        self.times[kind as usize] = Some(millis);
        self
    }

    /// Stamp the given access kind with the current time.
    pub fn touch(&mut self, kind: AccessKind) {
        self.times[kind as usize] = Some(now_millis());
    }

    /// Copy every known size and time from `other`, leaving unknowns alone.
    pub fn merge_known(&mut self, other: &EntryMeta) {
        for (mine, theirs) in self.sizes.iter_mut().zip(other.sizes.iter()) {
            if theirs.is_some() {
                *mine = *theirs;
            }
        }
        for (mine, theirs) in self.times.iter_mut().zip(other.times.iter()) {
            if theirs.is_some() {
                *mine = *theirs;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_new_entry_is_unknown() {
        let meta = EntryMeta::file("a/b.txt");
        assert_eq!(meta.name(), "a/b.txt");
        assert!(meta.is_file());
        for kind in SizeKind::iter() {
            assert_eq!(meta.size(kind), None);
        }
        for kind in AccessKind::iter() {
            assert_eq!(meta.time(kind), None);
        }
    }

    #[test]
    fn test_zero_size_is_not_unknown() {
        let mut meta = EntryMeta::file("empty");
        assert_eq!(meta.set_size(SizeKind::Data, Some(0)), None);
        assert_eq!(meta.size(SizeKind::Data), Some(0));
        assert_eq!(meta.size(SizeKind::Storage), None);

        assert_eq!(meta.set_size(SizeKind::Data, None), Some(0));
        assert_eq!(meta.size(SizeKind::Data), None);
    }

    #[test]
    fn test_touch_sets_time() {
        let mut meta = EntryMeta::directory("dir");
        meta.touch(AccessKind::Create);
        assert!(meta.time(AccessKind::Create).is_some());
        assert!(meta.time(AccessKind::Write).is_none());
        assert!(meta.is_dir());
    }

    #[test]
    fn test_merge_known_keeps_unknowns() {
        let mut dst = EntryMeta::file("x").with_size(SizeKind::Storage, 7);
        let src = EntryMeta::file("y")
            .with_size(SizeKind::Data, 42)
            .with_time(AccessKind::Write, 1000);

        dst.merge_known(&src);

        assert_eq!(dst.name(), "x");
        assert_eq!(dst.size(SizeKind::Data), Some(42));
        assert_eq!(dst.size(SizeKind::Storage), Some(7));
        assert_eq!(dst.time(AccessKind::Write), Some(1000));
        assert_eq!(dst.time(AccessKind::Read), None);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EntryType::Special.to_string(), "special");
        assert_eq!("storage".parse::<SizeKind>().unwrap(), SizeKind::Storage);
        assert_eq!(AccessKind::Create.to_string(), "create");
    }

    #[test]
    fn test_serde_keeps_unknown_distinct() {
        let meta = EntryMeta::file("f").with_size(SizeKind::Data, 0);
        let json = serde_json::to_string(&meta).unwrap();
        let back: EntryMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.size(SizeKind::Data), Some(0));
        assert_eq!(back.size(SizeKind::Storage), None);
    }
}
