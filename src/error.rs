//! Error types shared across the peer transport.

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::SigningError;
use crate::handshake::HandshakeError;
use crate::onion::ControllerError;
use crate::store::StoreError;
use crate::transport::SocksError;
use crate::wire::WireError;

/// Errors that can occur while moving frames between peers.
#[derive(Error, Debug)]
pub enum PeerError {
    /// Malformed frame or header.
    #[error("Format error: {0}")]
    Format(String),

    /// Payload was not valid UTF-8 JSON.
    #[error("Payload error: {0}")]
    Payload(String),

    /// Socket-level failure (refused, reset, proxy failure).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Peer closed the socket before the declared byte count arrived.
    #[error("Connection closed after {received} of {expected} bytes")]
    ConnectionClosed {
        /// Bytes the frame declared.
        expected: usize,
        /// Bytes actually read before EOF.
        received: usize,
    },

    /// Envelope did not have its exact key set.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Detached signature did not verify.
    #[error("Authenticity error: {0}")]
    Authenticity(String),

    /// Response nonce was never issued by this node.
    #[error("Replay error: nonce {0} was never issued")]
    Replay(String),

    /// Tor control-protocol failure.
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    /// Key agent failure.
    #[error("Key error: {0}")]
    Key(#[from] SigningError),

    /// Nonce history failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration could not be loaded or saved.
    #[error("Config error: {0}")]
    Config(String),

    /// A lifecycle manager was started twice.
    #[error("{0} is already running")]
    AlreadyStarted(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireError> for PeerError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Payload(msg) => PeerError::Payload(msg),
            other => PeerError::Format(other.to_string()),
        }
    }
}

impl From<HandshakeError> for PeerError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Authenticity(msg) => PeerError::Authenticity(msg),
            HandshakeError::Replay(nonce) => PeerError::Replay(nonce),
            other => PeerError::Validation(other.to_string()),
        }
    }
}

impl From<ConfigError> for PeerError {
    fn from(err: ConfigError) -> Self {
        PeerError::Config(err.to_string())
    }
}

impl From<SocksError> for PeerError {
    fn from(err: SocksError) -> Self {
        PeerError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_payload_maps_to_payload() {
        let err: PeerError = WireError::Payload("bad json".into()).into();
        assert!(matches!(err, PeerError::Payload(_)));
    }

    #[test]
    fn test_wire_header_maps_to_format() {
        let err: PeerError = WireError::ShortHeader(3).into();
        assert!(matches!(err, PeerError::Format(_)));
    }

    #[test]
    fn test_handshake_replay_maps_to_replay() {
        let err: PeerError = HandshakeError::Replay("abc".into()).into();
        assert!(matches!(err, PeerError::Replay(n) if n == "abc"));
    }

    #[test]
    fn test_connection_closed_message() {
        let err = PeerError::ConnectionClosed {
            expected: 7,
            received: 2,
        };
        assert_eq!(err.to_string(), "Connection closed after 2 of 7 bytes");
    }
}
