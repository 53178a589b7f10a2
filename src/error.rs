//! A dedicated error for everything that can go wrong on the query path:
//! I/O, malformed DNS wire data, and configuration problems.
use std::io;
use std::net::AddrParseError;
use std::str;

#[derive(Debug)]
pub enum DNSError {
    Io(io::Error),
    Utf8(str::Utf8Error),
    Addr(AddrParseError),
    LoggerError(log::SetLoggerError),
    Config(String),
    Codec(CodecError),
}

/// Errors raised while decoding or rewriting a DNS message on the wire.
/// Any of these aborts the current query with a silent `Drop` (spec §4.1/§7);
/// none of them ever reach the packet cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    Truncated,
    BadCompression,
    BadName,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "message truncated"),
            CodecError::BadCompression => write!(f, "invalid compression pointer"),
            CodecError::BadName => write!(f, "malformed domain name"),
        }
    }
}

impl DNSError {
    // Helper function to create a new config error from a string
    pub fn config(s: impl Into<String>) -> Self {
        DNSError::Config(s.into())
    }
}

/// A specific custom `Result` for all functions on the query path.
pub type DNSResult<T> = Result<T, DNSError>;

// All conversions for internal errors for DNSError
impl From<io::Error> for DNSError {
    fn from(err: io::Error) -> Self {
        DNSError::Io(err)
    }
}

impl From<str::Utf8Error> for DNSError {
    fn from(err: str::Utf8Error) -> Self {
        DNSError::Utf8(err)
    }
}

impl From<AddrParseError> for DNSError {
    fn from(err: AddrParseError) -> Self {
        DNSError::Addr(err)
    }
}

impl From<log::SetLoggerError> for DNSError {
    fn from(err: log::SetLoggerError) -> Self {
        DNSError::LoggerError(err)
    }
}

impl From<CodecError> for DNSError {
    fn from(err: CodecError) -> Self {
        DNSError::Codec(err)
    }
}

impl std::fmt::Display for DNSError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DNSError::Io(e) => write!(f, "I/O error: {}", e),
            DNSError::Utf8(e) => write!(f, "UTF8 error: {}", e),
            DNSError::Addr(e) => write!(f, "address parse error: {}", e),
            DNSError::LoggerError(e) => write!(f, "logger error: {}", e),
            DNSError::Config(s) => write!(f, "configuration error: {}", s),
            DNSError::Codec(e) => write!(f, "codec error: {}", e),
        }
    }
}

impl std::error::Error for DNSError {}
