use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes storage errors by what the host registry should do with them,
/// independent of the storage backend which produced them.
///
/// The host only distinguishes "the item is missing" from "the transfer
/// failed", so the data path produces exactly those two kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// The requested object does not exist, or a listing matched nothing.
    ///
    /// **Caller action:** trigger the host's generic "item missing" handling.
    NotFound,

    /// A read, write, stat, list or delete call failed (network, server,
    /// authorization, malformed response, local disk).
    ///
    /// **Caller action:** surface as a generic I/O failure. The driver has
    /// not retried the call.
    Io,

    /// The driver was configured with values it cannot use.
    ///
    /// Only produced while building a driver, never by data-path operations.
    InvalidRequest,
}

impl StorageErrorKind {
    /// Returns whether this error kind means the object is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageErrorKind::NotFound)
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace, controlled by `RUST_BACKTRACE`.
    backtrace: Backtrace,

    /// The tracing span context at the point where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Storage error with a semantic kind and the context of the failed operation.
///
/// This error type provides:
/// - **Semantic categorization** via [`StorageErrorKind`]
/// - **Operation context** (engine, bucket, path)
/// - **Error chain preservation** via `Box<dyn Error + Send + Sync>`
/// - **Backtrace and span trace capture** for debugging
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// fn stat() -> Result<u64, StorageError> {
///     let err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such key");
///     Err(StorageError::builder("qiniu", StorageErrorKind::NotFound, err)
///         .bucket("registry")
///         .path("images/abc/layer")
///         .build())
/// }
///
/// assert!(stat().unwrap_err().is_not_found());
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    ///
    /// For more control, use [`StorageError::builder`].
    #[track_caller]
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            bucket: None,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Shorthand for a [`StorageErrorKind::NotFound`] error about `path`.
    #[track_caller]
    pub fn not_found(engine: &'static str, path: impl Into<String>) -> Self {
        let path = path.into();
        StorageError::builder(
            engine,
            StorageErrorKind::NotFound,
            format!("{path} is not there"),
        )
        .path(path)
        .build()
    }

    /// Create a builder for constructing a storage error with full context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// Returns a boxed closure that creates a storage error from a downstream error.
    ///
    /// This is useful with `.map_err()` for simple error conversion.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn operation() -> Result<(), StorageError> {
    ///     std::fs::File::open("file.txt")
    ///         .map_err(StorageError::with("local", StorageErrorKind::Io))?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Attach the path this error concerns, replacing any previous value.
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns whether the object this error concerns is missing.
    pub fn is_not_found(&self) -> bool {
        self.kind.is_not_found()
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the bucket name, if available.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns the object path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing a [`StorageError`] with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = StorageError::builder("qiniu", StorageErrorKind::Io, "connection reset")
            .bucket("registry")
            .path("a/b")
            .context("stat")
            .build();

        assert_eq!(
            err.to_string(),
            "Storage error [I/O error] from qiniu (bucket: registry) (path: a/b) (stat): connection reset"
        );
        assert!(!err.is_not_found());
        assert_eq!(err.bucket(), Some("registry"));
    }

    #[test]
    fn not_found_shorthand() {
        let err = StorageError::not_found("memory", "x/y");
        assert!(err.is_not_found());
        assert_eq!(err.path(), Some("x/y"));
        assert_eq!(err.engine(), "memory");
    }

    #[test]
    fn with_closure_preserves_source() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk full"));
        let err = result
            .map_err(StorageError::with("local", StorageErrorKind::Io))
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Io);
        assert_eq!(StdError::source(&err).unwrap().to_string(), "disk full");
    }
}
