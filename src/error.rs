//! Unified error types for rtmp-relay
//!
//! "Need more bytes" is deliberately absent from this taxonomy: parsers
//! signal it through their return types and the session loop schedules
//! another read. Everything here is either fatal to the connection or
//! reportable to the peer via `onStatus`.

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all RTMP operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network operations
    Io(io::Error),
    /// RTMP protocol violation
    Protocol(ProtocolError),
    /// AMF encoding/decoding error
    Amf(AmfError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// Connection rejected by peer or handler
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Connection was closed
    ConnectionClosed,
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Rejected(msg) => write!(f, "Connection rejected: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

/// Protocol-level errors, all fatal to the connection
#[derive(Debug)]
pub enum ProtocolError {
    InvalidChunkHeader,
    /// Set Chunk Size with the high bit set or a zero size
    InvalidChunkSize(u32),
    MessageTooLarge { size: u32, max: u32 },
    InvalidChunkStreamId(u32),
    UnexpectedMessage(String),
    InvalidCommand(String),
    StreamNotFound(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidChunkHeader => write!(f, "Invalid chunk header"),
            ProtocolError::InvalidChunkSize(s) => write!(f, "Invalid chunk size: {}", s),
            ProtocolError::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            ProtocolError::InvalidChunkStreamId(id) => write!(f, "Invalid chunk stream ID: {}", id),
            ProtocolError::UnexpectedMessage(msg) => write!(f, "Unexpected message: {}", msg),
            ProtocolError::InvalidCommand(cmd) => write!(f, "Invalid command: {}", cmd),
            ProtocolError::StreamNotFound(id) => write!(f, "Stream not found: {}", id),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// AMF encoding/decoding errors
#[derive(Debug)]
pub enum AmfError {
    UnknownMarker(u8),
    UnexpectedEof,
    InvalidUtf8,
    InvalidReference(u16),
    NestingTooDeep,
    InvalidObjectEnd,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnknownMarker(m) => write!(f, "Unknown AMF marker: 0x{:02x}", m),
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::InvalidReference(idx) => write!(f, "Invalid AMF reference: {}", idx),
            AmfError::NestingTooDeep => write!(f, "AMF nesting too deep"),
            AmfError::InvalidObjectEnd => write!(f, "Invalid object end marker"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Handshake-specific errors
#[derive(Debug)]
pub enum HandshakeError {
    InvalidVersion(u8),
    InvalidState,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidVersion(v) => write!(f, "Invalid RTMP version: {}", v),
            HandshakeError::InvalidState => write!(f, "Invalid handshake state"),
        }
    }
}

impl std::error::Error for HandshakeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;
    use std::io;

    #[test]
    fn test_error_display() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let err = Error::Io(io_err);
        assert!(err.to_string().contains("I/O error"));

        let err = Error::Protocol(ProtocolError::InvalidChunkHeader);
        assert!(err.to_string().contains("Protocol error"));
        assert!(err.to_string().contains("Invalid chunk header"));

        let err = Error::Protocol(ProtocolError::InvalidChunkSize(0x8000_0001));
        assert!(err.to_string().contains("chunk size"));

        let err = Error::Amf(AmfError::UnknownMarker(0xFF));
        assert!(err.to_string().contains("AMF error"));
        assert!(err.to_string().contains("0xff"));

        let err = Error::Handshake(HandshakeError::InvalidVersion(5));
        assert!(err.to_string().contains("Handshake error"));
        assert!(err.to_string().contains("5"));

        let err = Error::Rejected("stream key invalid".into());
        assert!(err.to_string().contains("stream key invalid"));

        assert!(Error::Timeout.to_string().contains("timed out"));
        assert!(Error::ConnectionClosed.to_string().contains("closed"));
    }

    #[test]
    fn test_error_source() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err = Error::Io(io_err);
        assert!(StdError::source(&err).is_some());

        let err = Error::Protocol(ProtocolError::InvalidChunkHeader);
        assert!(StdError::source(&err).is_none());
    }

    #[test]
    fn test_from_conversions() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));

        let err: Error = ProtocolError::MessageTooLarge { size: 100, max: 50 }.into();
        assert!(matches!(err, Error::Protocol(_)));

        let err: Error = AmfError::UnexpectedEof.into();
        assert!(matches!(err, Error::Amf(_)));

        let err: Error = HandshakeError::InvalidVersion(0).into();
        assert!(matches!(err, Error::Handshake(_)));
    }
}
