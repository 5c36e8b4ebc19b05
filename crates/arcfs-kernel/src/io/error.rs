//! I/O core error types.

use std::io;
use thiserror::Error;

/// I/O core error type.
#[derive(Debug, Error)]
pub enum IoError {
    /// Entry does not exist in its container.
    #[error("not found: {0}")]
    NotFound(String),

    /// The socket does not provide this kind of access.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No back-end socket has been configured for this direction.
    #[error("no {0} socket configured")]
    NotConfigured(&'static str),

    /// A single-writer container already has a live writer.
    #[error("busy writing another entry, cannot open {0}")]
    Busy(String),

    /// The service has been closed.
    #[error("service is closed")]
    Closed,

    /// A buffer was released into a pool that did not allocate it.
    #[error("buffer {0} was not allocated by this pool")]
    ForeignBuffer(String),

    /// Reading from a source failed.
    #[error("input failed for {name}: {source}")]
    Input {
        name: String,
        #[source]
        source: Box<IoError>,
    },

    /// Writing to a destination failed.
    #[error("output failed for {name}: {source}")]
    Output {
        name: String,
        #[source]
        source: Box<IoError>,
    },

    /// Plain I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An error together with the warnings collected before it.
    #[error("{primary} (and {} earlier warnings)", .warnings.len())]
    Chained {
        primary: Box<IoError>,
        warnings: Vec<IoError>,
    },
}

impl IoError {
    /// Create a NotFound error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create an Unsupported error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Create a Busy error.
    pub fn busy(name: impl Into<String>) -> Self {
        Self::Busy(name.into())
    }

    /// Tag an error as an input-side failure.
    ///
    /// Errors that are already tagged are returned unchanged.
    pub fn input(name: impl Into<String>, source: impl Into<IoError>) -> Self {
        match source.into() {
            e @ (Self::Input { .. } | Self::Output { .. }) => e,
            e => Self::Input {
                name: name.into(),
                source: Box::new(e),
            },
        }
    }

    /// Tag an error as an output-side failure.
    ///
    /// Errors that are already tagged are returned unchanged.
    pub fn output(name: impl Into<String>, source: impl Into<IoError>) -> Self {
        match source.into() {
            e @ (Self::Input { .. } | Self::Output { .. }) => e,
            e => Self::Output {
                name: name.into(),
                source: Box::new(e),
            },
        }
    }

    /// Attach previously collected warnings to `primary`.
    pub fn chain(primary: IoError, warnings: Vec<IoError>) -> Self {
        if warnings.is_empty() {
            primary
        } else {
            Self::Chained {
                primary: Box::new(primary),
                warnings,
            }
        }
    }

    /// Returns true if the root cause is a missing entry.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            Self::Input { source, .. } | Self::Output { source, .. } => source.is_not_found(),
            Self::Chained { primary, .. } => primary.is_not_found(),
            _ => false,
        }
    }

    /// Returns true if the root cause is an unsupported access kind.
    pub fn is_unsupported(&self) -> bool {
        match self {
            Self::Unsupported(_) => true,
            Self::Input { source, .. } | Self::Output { source, .. } => source.is_unsupported(),
            Self::Chained { primary, .. } => primary.is_unsupported(),
            _ => false,
        }
    }

    /// Returns true for input-side failures.
    pub fn is_input(&self) -> bool {
        match self {
            Self::Input { .. } => true,
            Self::Chained { primary, .. } => primary.is_input(),
            _ => false,
        }
    }

    /// Returns true for output-side failures.
    pub fn is_output(&self) -> bool {
        match self {
            Self::Output { .. } => true,
            Self::Chained { primary, .. } => primary.is_output(),
            _ => false,
        }
    }

    /// Returns false only for failures a drain may skip over (input side).
    pub fn is_fatal(&self) -> bool {
        !self.is_input()
    }

    /// Warnings collected before this error, if any.
    pub fn warnings(&self) -> &[IoError] {
        match self {
            Self::Chained { warnings, .. } => warnings,
            _ => &[],
        }
    }
}

/// Convert IoError to std::io::Error for compatibility.
impl From<IoError> for io::Error {
    fn from(e: IoError) -> Self {
        match e {
            IoError::Io(e) => e,
            IoError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            IoError::Unsupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            IoError::Busy(msg) => io::Error::new(io::ErrorKind::ResourceBusy, msg),
            other => io::Error::other(other),
        }
    }
}

/// I/O core result type.
pub type IoResult<T> = Result<T, IoError>;

/// Collects non-fatal errors so an operation can keep going.
///
/// When a fatal error finally occurs, [`fail`](Self::fail) chains everything
/// collected so far onto it.
#[derive(Debug, Default)]
pub struct Warnings {
    collected: Vec<IoError>,
}

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a non-fatal error.
    pub fn warn(&mut self, error: IoError) {
        self.collected.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.collected.is_empty()
    }

    pub fn len(&self) -> usize {
        self.collected.len()
    }

    /// Chain the collected warnings onto a fatal error.
    pub fn fail(self, fatal: IoError) -> IoError {
        IoError::chain(fatal, self.collected)
    }

    /// `Ok` if nothing was collected, otherwise the first warning with the
    /// rest chained onto it.
    pub fn finish(self) -> IoResult<()> {
        let mut collected = self.collected.into_iter();
        match collected.next() {
            None => Ok(()),
            Some(first) => Err(IoError::chain(first, collected.collect())),
        }
    }
}
