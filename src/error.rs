use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

/// type alias for all operations in this crate that could fail with an [`AtmoError`]
pub type Result<T> = std::result::Result<T, AtmoError>;

/// Error variants used across the aggregation server, publisher and query client.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum AtmoError {
    /// variant for errors caused by std::io (connection refused/reset, read timeouts)
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// variant for errors caused during JSON serialization/deserialization
    #[error("serialization/deserialization error")]
    Serialization(#[from] serde_json::Error),

    /// variant for malformed HTTP: a bad request/status line, or an unparsable
    /// Content-Length or Lamport-Clock header value
    #[error("{}", .0)]
    Protocol(String),

    /// variant for a publisher feed file that violates the `key:value` line format
    #[error("invalid feed format: {}", .0)]
    InvalidFormat(String),

    /// variant for a record that is missing the mandatory `id` field
    #[error("missing required field: id")]
    MissingId,

    /// variant for errors when parsing strings to some other type
    #[error("{}", .0)]
    Parsing(String),

    /// variant for a response with a status code the caller does not accept
    #[error("server returned status code {}", .0)]
    Status(u16),

    /// a header value or body is an invalid UTF-8 sequence
    #[error("{}", .0)]
    Utf8(#[from] FromUtf8Error),

    /// variant for a poisoned store mutex
    #[error("{}", .0)]
    Locking(String),
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for AtmoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}
