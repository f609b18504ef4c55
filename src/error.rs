use trackable::error::{ErrorKind as TrackableErrorKind, ErrorKindExt, Failure, TrackableError};

/// This crate specific `Error` type.
#[derive(Debug, Clone, trackable::TrackableError)]
pub struct Error(TrackableError<ErrorKind>);
impl From<Failure> for Error {
    fn from(f: Failure) -> Self {
        ErrorKind::Other.takes_over(f).into()
    }
}
impl From<std::io::Error> for Error {
    fn from(f: std::io::Error) -> Self {
        ErrorKind::Other.cause(f).into()
    }
}
impl From<serde_json::Error> for Error {
    fn from(f: serde_json::Error) -> Self {
        ErrorKind::Other.cause(f).into()
    }
}

/// Possible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The experiment configuration is malformed
    /// (e.g., unknown width ratio, length mismatch, index out of range).
    InvalidInput,

    /// Every path of the sampling space has already been drawn.
    Exhausted,

    /// A replica worker failed.
    Worker,

    /// Other errors (e.g., I/O).
    Other,
}
impl TrackableErrorKind for ErrorKind {}
