//! End-to-end behavior of caches and multiplexers over a memory archive.

mod common;

use std::io::Write;
use std::sync::atomic::Ordering;

use arcfs_kernel::io::{
    read_all, write_all, BufferPool, CacheEntry, InputService, MemoryArchive, OutputMux,
    OutputService, OutputSocket, OutputStream, Strategy,
};
use arcfs_kernel::{EntryMeta, SizeKind};

use common::{BrokenInput, Counting, Rejecting, files_in, init_tracing, samples};

fn open(mux: &OutputMux<impl OutputService + 'static>, name: &str) -> Box<dyn OutputStream> {
    mux.output(EntryMeta::file(name)).stream().unwrap()
}

fn finish(mut stream: Box<dyn OutputStream>, data: &str) {
    stream.write_all(data.as_bytes()).unwrap();
    stream.close().unwrap();
}

#[test]
fn cache_reads_back_end_once() {
    init_tracing();
    for data in samples() {
        let archive = MemoryArchive::new();
        archive.insert("entry", data.clone());
        let (socket, opens) = Counting::new(archive.input("entry"));

        let cache = CacheEntry::new(Strategy::WriteThrough, BufferPool::memory());
        cache.configure_input(socket);
        for _ in 0..4 {
            assert_eq!(read_all(&mut cache.input()).unwrap(), data);
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(archive.reads(), 1);
        assert_eq!(cache.size(SizeKind::Data), Some(data.len() as u64));
    }
}

#[test]
fn write_back_defers_until_flush() {
    init_tracing();
    let archive = MemoryArchive::new();
    archive.insert("entry", "D1");
    let cache = CacheEntry::new(Strategy::WriteBack, BufferPool::memory());
    cache
        .configure_input(archive.input("entry"))
        .configure_output(archive.output(EntryMeta::file("entry")));

    write_all(&mut cache.output(), b"D2").unwrap();
    assert_eq!(read_all(&mut cache.input()).unwrap(), b"D2");
    assert_eq!(archive.writes(), 0);
    assert_eq!(archive.data("entry").unwrap(), b"D1");

    cache.flush().unwrap();
    assert_eq!(archive.writes(), 1);
    assert_eq!(archive.data("entry").unwrap(), b"D2");
}

#[test]
fn write_through_writes_on_close() {
    init_tracing();
    let archive = MemoryArchive::new();
    let cache = CacheEntry::new(Strategy::WriteThrough, BufferPool::temp_files(None));
    let (socket, opens) = Counting::new(archive.output(EntryMeta::file("entry")));
    cache.configure_output(socket);

    let mut stream = cache.output().stream().unwrap();
    stream.write_all(b"D2").unwrap();
    assert_eq!(archive.writes(), 0);
    stream.close().unwrap();

    assert_eq!(archive.writes(), 1);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(archive.data("entry").unwrap(), b"D2");
    assert!(!cache.is_dirty());
}

#[test]
fn clear_discards_without_back_end_io() {
    init_tracing();
    let pool = BufferPool::memory();
    let archive = MemoryArchive::new();
    archive.insert("entry", "original");
    let before = pool.outstanding();

    let cache = CacheEntry::new(Strategy::WriteBack, pool.clone());
    cache
        .configure_input(archive.input("entry"))
        .configure_output(archive.output(EntryMeta::file("entry")));
    write_all(&mut cache.output(), b"unflushed").unwrap();
    assert_eq!(pool.outstanding(), before + 1);

    let (reads, writes) = (archive.reads(), archive.writes());
    cache.clear().unwrap();

    assert_eq!(pool.outstanding(), before);
    assert_eq!(archive.reads(), reads);
    assert_eq!(archive.writes(), writes);
    assert_eq!(archive.data("entry").unwrap(), b"original");
    assert_eq!(cache.entry(), None);
}

#[test]
fn mux_orders_overflow_under_contention() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let archive = MemoryArchive::new();
    let pool = BufferPool::temp_files(Some(dir.path().to_path_buf()));
    let mut mux = OutputMux::new(archive.clone(), pool.clone());
    let size_matches = |mux: &OutputMux<MemoryArchive>| {
        OutputService::size(mux) == InputService::size(&archive) + mux.pending()
    };

    let busy = open(&mux, "busy");
    let a = open(&mux, "A");
    let b = open(&mux, "B");
    let c = open(&mux, "C");
    assert!(size_matches(&mux));
    // Each open writer holds its buffer and the file it is staging into.
    assert_eq!(files_in(dir.path()), 6);

    finish(b, "bee");
    assert!(size_matches(&mux));
    finish(c, "sea");
    assert!(size_matches(&mux));
    finish(a, "ay");
    assert!(size_matches(&mux));
    assert!(archive.write_log().is_empty());

    finish(busy, "busy");
    assert!(size_matches(&mux));
    assert_eq!(archive.write_log(), vec!["busy", "A", "B", "C"]);
    assert_eq!(archive.data("A").unwrap(), b"ay");
    assert_eq!(files_in(dir.path()), 0);

    mux.close().unwrap();
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn mux_drain_stops_on_output_failure() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let archive = MemoryArchive::new();
    let pool = BufferPool::temp_files(Some(dir.path().to_path_buf()));
    let target = Rejecting {
        inner: archive.clone(),
        reject: vec!["B"],
    };
    let mut mux = OutputMux::new(target, pool.clone());

    let mut busy = open(&mux, "busy");
    for name in ["A", "B", "C"] {
        finish(open(&mux, name), name);
    }
    busy.write_all(b"busy").unwrap();

    let err = busy.close().unwrap_err();
    assert!(err.is_output());
    assert!(err.to_string().contains("no space left for B"));
    assert_eq!(archive.write_log(), vec!["busy", "A"]);
    // A and B were attempted; only C, never attempted, keeps its file.
    assert_eq!(files_in(dir.path()), 1);
    assert_eq!(mux.pending(), 1);

    mux.close().unwrap();
    assert_eq!(archive.write_log(), vec!["busy", "A", "C"]);
    assert_eq!(files_in(dir.path()), 0);
    assert!(archive.is_closed());
}

#[test]
fn mux_close_propagates_fatal_drain() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let archive = MemoryArchive::new();
    let pool = BufferPool::temp_files(Some(dir.path().to_path_buf()));
    let target = Rejecting {
        inner: archive.clone(),
        reject: vec!["A", "B"],
    };
    let mut mux = OutputMux::new(target, pool.clone());

    let mut busy = open(&mux, "busy");
    finish(open(&mux, "A"), "a");
    finish(open(&mux, "B"), "b");
    busy.write_all(b"x").unwrap();
    assert!(busy.close().is_err());

    let err = mux.close().unwrap_err();
    assert!(err.is_output());
    assert!(archive.is_closed());
    assert_eq!(files_in(dir.path()), 0);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn broken_back_end_leaves_cache_empty() {
    init_tracing();
    let pool = BufferPool::memory();
    let cache = CacheEntry::new(Strategy::WriteBack, pool.clone());
    cache.configure_input(BrokenInput::default());

    for _ in 0..2 {
        let err = read_all(&mut cache.input()).unwrap_err();
        assert!(err.is_input());
        assert!(!cache.is_cached());
        assert_eq!(cache.entry(), None);
        assert_eq!(cache.size(SizeKind::Data), None);
        assert_eq!(pool.outstanding(), 0);
    }

    let archive = MemoryArchive::new();
    archive.insert("good", "recovered");
    cache.configure_input(archive.input("good"));
    assert_eq!(read_all(&mut cache.input()).unwrap(), b"recovered");
    assert_eq!(pool.outstanding(), 1);
}

#[test]
fn caches_flush_through_shared_mux() {
    init_tracing();
    let archive = MemoryArchive::new();
    let pool = BufferPool::memory();
    let mut mux = OutputMux::new(archive.clone(), pool.clone());

    let first = CacheEntry::new(Strategy::WriteBack, pool.clone());
    first.configure_output(mux.output(EntryMeta::file("first")));
    let second = CacheEntry::new(Strategy::WriteBack, pool.clone());
    second.configure_output(mux.output(EntryMeta::file("second")));
    write_all(&mut first.output(), b"one").unwrap();
    write_all(&mut second.output(), b"two").unwrap();

    // Hold the target so both flushes overflow.
    let busy = open(&mux, "manifest");
    first.flush().unwrap();
    second.flush().unwrap();
    assert_eq!(mux.pending(), 2);
    assert!(!first.is_dirty());

    finish(busy, "manifest");
    mux.close().unwrap();
    assert_eq!(archive.write_log(), vec!["manifest", "first", "second"]);
    assert_eq!(archive.data("second").unwrap(), b"two");

    first.clear().unwrap();
    second.clear().unwrap();
    assert_eq!(pool.outstanding(), 0);
}
