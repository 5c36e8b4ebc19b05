//! Input and output sockets.
//!
//! A socket is a cheap, reusable connector to one local entry. It holds no
//! resources until a stream is opened, and it may be opened any number of
//! times in sequence. For the duration of a copy the socket can be told about
//! its *peer*, the entry on the other side, so either end may special-case
//! the transfer (for example skip re-compression when both formats match).
//!
//! Streams returned by sockets own whatever they need and do not borrow the
//! socket, so a caller may drop the socket and keep writing.

use std::io::{self, Read, Seek, Write};

use arcfs_types::EntryMeta;
use tracing::debug;

use super::error::{IoError, IoResult};

/// Size of the transfer buffer used by [`copy`].
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A readable stream.
pub type InputStream = Box<dyn Read + Send>;

/// Random-access read handle.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// A seekable read channel.
pub type InputChannel = Box<dyn ReadSeek>;

/// A writable stream with a fallible close.
///
/// `close` commits the written entry. Implementations also close on drop,
/// logging instead of returning any failure, so callers that care about the
/// result must call `close` explicitly.
pub trait OutputStream: Write + Send {
    /// Flush and commit the entry.
    fn close(self: Box<Self>) -> IoResult<()>;
}

/// Connector for reading one entry.
pub trait InputSocket: Send {
    /// Metadata of the local entry. Lazily resolving sockets may fail here.
    fn target(&self) -> IoResult<EntryMeta>;

    /// The entry on the other side of the current copy, if bound.
    fn peer(&self) -> Option<&EntryMeta>;

    /// Bind (or unbind, with `None`) the peer for the next connection.
    fn bind(&mut self, peer: Option<EntryMeta>);

    /// Open a sequential stream.
    fn stream(&mut self) -> IoResult<InputStream>;

    /// Open a seekable channel.
    ///
    /// Sockets without random access fail with [`IoError::Unsupported`].
    fn channel(&mut self) -> IoResult<InputChannel> {
        let name = self
            .target()
            .map(|t| t.name().to_string())
            .unwrap_or_default();
        Err(IoError::unsupported(format!("read channel for {name}")))
    }
}

/// Connector for writing one entry.
pub trait OutputSocket: Send {
    /// Metadata of the local entry. Lazily resolving sockets may fail here.
    fn target(&self) -> IoResult<EntryMeta>;

    /// The entry on the other side of the current copy, if bound.
    fn peer(&self) -> Option<&EntryMeta>;

    /// Bind (or unbind, with `None`) the peer for the next connection.
    fn bind(&mut self, peer: Option<EntryMeta>);

    /// Open a stream replacing the entry's content.
    fn stream(&mut self) -> IoResult<Box<dyn OutputStream>>;
}

impl<S: InputSocket + ?Sized> InputSocket for Box<S> {
    fn target(&self) -> IoResult<EntryMeta> {
        (**self).target()
    }

    fn peer(&self) -> Option<&EntryMeta> {
        (**self).peer()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        (**self).bind(peer)
    }

    fn stream(&mut self) -> IoResult<InputStream> {
        (**self).stream()
    }

    fn channel(&mut self) -> IoResult<InputChannel> {
        (**self).channel()
    }
}

impl<S: OutputSocket + ?Sized> OutputSocket for Box<S> {
    fn target(&self) -> IoResult<EntryMeta> {
        (**self).target()
    }

    fn peer(&self) -> Option<&EntryMeta> {
        (**self).peer()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        (**self).bind(peer)
    }

    fn stream(&mut self) -> IoResult<Box<dyn OutputStream>> {
        (**self).stream()
    }
}

/// Copy all bytes from `input` to `output`.
///
/// Peers are bound both ways before anything is opened. The input is opened
/// first, then the output. Both sides are closed on every path; the first
/// error wins and a failing close after it is chained on. Every failure is
/// tagged as [`IoError::Input`] or [`IoError::Output`] so callers can tell
/// which side broke.
pub fn copy(input: &mut dyn InputSocket, output: &mut dyn OutputSocket) -> IoResult<u64> {
    let src = input.target().map_err(|e| IoError::input("<source>", e))?;
    let dst = output
        .target()
        .map_err(|e| IoError::output("<destination>", e))?;
    input.bind(Some(dst.clone()));
    output.bind(Some(src.clone()));

    let mut reader = input.stream().map_err(|e| IoError::input(src.name(), e))?;
    let mut writer = match output.stream() {
        Ok(writer) => writer,
        Err(e) => return Err(IoError::output(dst.name(), e)),
    };

    let pumped = pump(&mut reader, &mut writer, src.name(), dst.name());
    drop(reader);

    match pumped {
        Ok(n) => {
            writer.close().map_err(|e| IoError::output(dst.name(), e))?;
            debug!("copied {} bytes: {} -> {}", n, src.name(), dst.name());
            Ok(n)
        }
        Err(first) => match writer.close() {
            Ok(()) => Err(first),
            Err(close) => Err(IoError::chain(
                first,
                vec![IoError::output(dst.name(), close)],
            )),
        },
    }
}

fn pump(reader: &mut dyn Read, writer: &mut dyn Write, src: &str, dst: &str) -> IoResult<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(IoError::input(src, e)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|e| IoError::output(dst, e))?;
        total += n as u64;
    }
}

/// Open `socket` for reading, falling back to a channel if it has no stream.
pub fn open_reader(socket: &mut dyn InputSocket) -> IoResult<InputStream> {
    match socket.stream() {
        Err(e) if e.is_unsupported() => {
            let channel = socket.channel()?;
            Ok(Box::new(channel))
        }
        other => other,
    }
}

/// Read the whole content of `socket` into memory.
pub fn read_all(socket: &mut dyn InputSocket) -> IoResult<Vec<u8>> {
    let mut reader = open_reader(socket)?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(data)
}

/// Replace the content behind `socket` with `data`.
pub fn write_all(socket: &mut dyn OutputSocket, data: &[u8]) -> IoResult<()> {
    let mut writer = socket.stream()?;
    writer.write_all(data)?;
    writer.close()
}

/// Input socket whose target and stream come from closures.
///
/// Nothing is resolved until asked for, so a missing entry surfaces as
/// [`IoError::NotFound`] from `target()` or `stream()`, not at construction.
pub struct LazyInputSocket<T, S> {
    resolve: T,
    open: S,
    peer: Option<EntryMeta>,
}

impl<T, S> LazyInputSocket<T, S>
where
    T: Fn() -> IoResult<EntryMeta> + Send,
    S: FnMut(&EntryMeta, Option<&EntryMeta>) -> IoResult<InputStream> + Send,
{
    pub fn new(resolve: T, open: S) -> Self {
        Self {
            resolve,
            open,
            peer: None,
        }
    }
}

impl<T, S> InputSocket for LazyInputSocket<T, S>
where
    T: Fn() -> IoResult<EntryMeta> + Send,
    S: FnMut(&EntryMeta, Option<&EntryMeta>) -> IoResult<InputStream> + Send,
{
    fn target(&self) -> IoResult<EntryMeta> {
        (self.resolve)()
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.peer.as_ref()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.peer = peer;
    }

    fn stream(&mut self) -> IoResult<InputStream> {
        let target = (self.resolve)()?;
        (self.open)(&target, self.peer.as_ref())
    }
}

/// Output socket whose target and stream come from closures.
pub struct LazyOutputSocket<T, S> {
    resolve: T,
    open: S,
    peer: Option<EntryMeta>,
}

impl<T, S> LazyOutputSocket<T, S>
where
    T: Fn() -> IoResult<EntryMeta> + Send,
    S: FnMut(&EntryMeta, Option<&EntryMeta>) -> IoResult<Box<dyn OutputStream>> + Send,
{
    pub fn new(resolve: T, open: S) -> Self {
        Self {
            resolve,
            open,
            peer: None,
        }
    }
}

impl<T, S> OutputSocket for LazyOutputSocket<T, S>
where
    T: Fn() -> IoResult<EntryMeta> + Send,
    S: FnMut(&EntryMeta, Option<&EntryMeta>) -> IoResult<Box<dyn OutputStream>> + Send,
{
    fn target(&self) -> IoResult<EntryMeta> {
        (self.resolve)()
    }

    fn peer(&self) -> Option<&EntryMeta> {
        self.peer.as_ref()
    }

    fn bind(&mut self, peer: Option<EntryMeta>) {
        self.peer = peer;
    }

    fn stream(&mut self) -> IoResult<Box<dyn OutputStream>> {
        let target = (self.resolve)()?;
        (self.open)(&target, self.peer.as_ref())
    }
}
