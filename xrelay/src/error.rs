//! Error types shared by every layer of the relay.

use std::io;
use std::time::Duration;

use crate::session::SessionState;

/// Coarse classification of an [`Error`], convenient for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid relay configuration.
    Configuration,
    /// The host refused the tunnel network settings.
    NetworkSettings,
    /// The transport did not reach `Connected` before the deadline.
    ConnectionTimeout,
    /// The transport connection attempt failed.
    ConnectionFailed,
    /// A frame header was shorter than four bytes.
    MalformedFrame,
    /// A frame declared a length above the configured maximum.
    FrameTooLarge,
    /// Underlying I/O failure.
    Io,
    /// The peer closed the stream.
    ConnectionClosed,
    /// The session was cancelled locally.
    Cancelled,
    /// Operation attempted while the session is not connected.
    NotConnected,
    /// Operation not valid in the current lifecycle state.
    InvalidState,
}

/// Relay error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid relay configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The host refused the tunnel network settings.
    #[error("failed to apply network settings: {0}")]
    NetworkSettings(String),

    /// The transport did not reach `Connected` in time.
    #[error("failed to connect to server within {0:?}")]
    ConnectionTimeout(Duration),

    /// The transport connection attempt failed.
    #[error("failed to connect to server {0}")]
    ConnectionFailed(String),

    /// Header shorter than the fixed header size.
    #[error("malformed frame: header has {actual} bytes, expected {expected}")]
    MalformedFrame {
        /// Bytes actually available.
        actual: usize,
        /// Bytes required.
        expected: usize,
    },

    /// Declared frame length above the limit.
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The session was cancelled locally.
    #[error("session cancelled")]
    Cancelled,

    /// Operation attempted outside the `Connected` state.
    #[error("session is {0}, not connected")]
    NotConnected(SessionState),

    /// Operation not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::NetworkSettings(_) => ErrorKind::NetworkSettings,
            Error::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::MalformedFrame { .. } => ErrorKind::MalformedFrame,
            Error::FrameTooLarge { .. } => ErrorKind::FrameTooLarge,
            Error::Io(_) => ErrorKind::Io,
            Error::ConnectionClosed => ErrorKind::ConnectionClosed,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::NotConnected(_) => ErrorKind::NotConnected,
            Error::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Returns true if the error ends a pump loop rather than being skipped.
    pub fn is_fatal_to_pump(&self) -> bool {
        !matches!(self.kind(), ErrorKind::MalformedFrame)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err.kind() {
            ErrorKind::ConnectionTimeout => io::ErrorKind::TimedOut,
            ErrorKind::ConnectionFailed => io::ErrorKind::ConnectionRefused,
            ErrorKind::MalformedFrame | ErrorKind::FrameTooLarge => io::ErrorKind::InvalidData,
            ErrorKind::ConnectionClosed => io::ErrorKind::UnexpectedEof,
            ErrorKind::NotConnected => io::ErrorKind::NotConnected,
            ErrorKind::Configuration => io::ErrorKind::InvalidInput,
            ErrorKind::Io => match &err {
                Error::Io(inner) => inner.kind(),
                _ => io::ErrorKind::Other,
            },
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::ConnectionClosed.kind(), ErrorKind::ConnectionClosed);
        assert_eq!(
            Error::ConnectionTimeout(Duration::from_secs(5)).kind(),
            ErrorKind::ConnectionTimeout
        );
        let io_err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(io_err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_malformed_frame_is_not_fatal() {
        let err = Error::MalformedFrame { actual: 2, expected: 4 };
        assert!(!err.is_fatal_to_pump());
        assert!(Error::ConnectionClosed.is_fatal_to_pump());
        assert!(Error::Cancelled.is_fatal_to_pump());
    }

    #[test]
    fn test_into_io_error_keeps_kind() {
        let err: io::Error = Error::ConnectionClosed.into();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let inner = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: io::Error = Error::Io(inner).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
