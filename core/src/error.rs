//! # Error Taxonomy
//!
//! Every failure that leaves the library is an [`Error`] carrying an
//! [`ErrorCode`]. The code decides the process exit status, so scripts and
//! supervisors wrapping `valkit` can branch on *why* a command failed without
//! scraping stderr.
//!
//! | Code                 | Exit | Typical cause                                  |
//! |----------------------|------|------------------------------------------------|
//! | `Success`            | 0    | -                                              |
//! | `GeneralError`       | 1    | Anything uncategorized, cancellation           |
//! | `InvalidArgs`        | 2    | Bad flags or missing required inputs           |
//! | `PreconditionFailed` | 3    | No cached snapshot, out of disk, missing files |
//! | `NetworkError`       | 4    | HTTP failure after retries, malformed RPC body |
//! | `ProcessError`       | 5    | Node subprocess failed                         |
//! | `ValidationError`    | 6    | Checksum mismatch, unsafe archive, bad JSON    |
//! | `SyncStuck`          | 42   | Node catching up with a frozen height          |
//!
//! Wrapping keeps the cause chain intact: `source()` returns the inner error,
//! and [`code_for_error`] reports the outermost code it finds.

use std::fmt;

/// Boxed cause carried by an [`Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds with their fixed process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    GeneralError,
    InvalidArgs,
    PreconditionFailed,
    NetworkError,
    ProcessError,
    ValidationError,
    SyncStuck,
}

impl ErrorCode {
    /// All kinds, in exit-code order.
    pub const ALL: [ErrorCode; 8] = [
        ErrorCode::Success,
        ErrorCode::GeneralError,
        ErrorCode::InvalidArgs,
        ErrorCode::PreconditionFailed,
        ErrorCode::NetworkError,
        ErrorCode::ProcessError,
        ErrorCode::ValidationError,
        ErrorCode::SyncStuck,
    ];

    /// The process exit code for this kind.
    pub const fn exit_code(self) -> i32 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::GeneralError => 1,
            ErrorCode::InvalidArgs => 2,
            ErrorCode::PreconditionFailed => 3,
            ErrorCode::NetworkError => 4,
            ErrorCode::ProcessError => 5,
            ErrorCode::ValidationError => 6,
            ErrorCode::SyncStuck => 42,
        }
    }

    /// Stable, human-readable name of the kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::GeneralError => "general error",
            ErrorCode::InvalidArgs => "invalid arguments",
            ErrorCode::PreconditionFailed => "precondition failed",
            ErrorCode::NetworkError => "network error",
            ErrorCode::ProcessError => "process error",
            ErrorCode::ValidationError => "validation error",
            ErrorCode::SyncStuck => "sync stuck",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded error: kind, human message, optional cause.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    /// Creates an error of the given kind with no underlying cause.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps `cause` under a new message and kind. The cause stays reachable
    /// through [`std::error::Error::source`].
    pub fn wrap<E>(code: ErrorCode, message: impl Into<String>, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            code,
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GeneralError, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgs, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PreconditionFailed, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProcessError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Local I/O failure, reported as a general error.
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        Self::wrap(ErrorCode::GeneralError, context, err)
    }

    /// The operation was cancelled before it finished.
    pub fn cancelled(what: &str) -> Self {
        Self::new(ErrorCode::GeneralError, format!("{what} cancelled"))
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when this error records a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::GeneralError && self.message.ends_with(" cancelled")
    }

    /// Renders the message followed by every cause, `outer: inner: innermost`.
    pub fn chain_string(&self) -> String {
        let mut out = self.message.clone();
        let mut next = std::error::Error::source(self);
        while let Some(cause) = next {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            next = cause.source();
        }
        out
    }
}

/// Returns the outermost [`ErrorCode`] found along the cause chain.
///
/// `None` means the command succeeded. An error chain without any coded
/// error maps to [`ErrorCode::GeneralError`].
pub fn code_for_error(err: Option<&(dyn std::error::Error + 'static)>) -> ErrorCode {
    let mut next = match err {
        None => return ErrorCode::Success,
        Some(e) => Some(e),
    };
    while let Some(current) = next {
        if let Some(coded) = current.downcast_ref::<Error>() {
            return coded.code();
        }
        next = current.source();
    }
    ErrorCode::GeneralError
}
