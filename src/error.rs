use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeakError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Info hash mismatch")]
    InfoHashMismatch,

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Piece error: {0}")]
    PieceError(String),

    #[error("IO error: {0}")]
    IoError(std::io::Error),
}

impl From<std::io::Error> for LeakError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => LeakError::ConnectionClosed,
            _ => LeakError::IoError(err),
        }
    }
}

impl From<tokio::time::error::Elapsed> for LeakError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        LeakError::Timeout
    }
}

pub type Result<T> = std::result::Result<T, LeakError>;
