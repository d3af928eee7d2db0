use std::fmt;

/// A basic error type from this library.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A generic error message.
    Msg(String),

    /// The owning context has already been deleted.
    ContextGone,

    /// A caller-supplied buffer is smaller than the required minimum size.
    BufferTooSmall(usize),

    /// Error during parsing of a `geo:` URI for a LOC record.
    ParseGeo(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Msg(s) => write!(f, "{}", s),
            Error::ContextGone => write!(f, "the owning context was deleted"),
            Error::BufferTooSmall(n) => write!(f, "buffer too small, need at least {} bytes", n),
            Error::ParseGeo(s) => write!(f, "parsing of geo URI failed, reason: {}", s),
        }
    }
}

impl std::error::Error for Error {}

/// One and only `Result` type from this library crate.
pub type Result<T> = core::result::Result<T, Error>;
