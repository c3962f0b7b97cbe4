use std::io::ErrorKind;

use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, error::ProtocolError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid config: {0}")]
    Config(String),

    /// Malformed client input. The connection is dropped without a reply.
    #[error("malformed client request: {0}")]
    Protocol(String),

    /// Client request refused; the refusal reply has already been written.
    #[error("client request rejected: {0}")]
    Rejected(String),

    #[error("tunnel dial failed after {attempts} attempt(s): {reason}")]
    Dial { attempts: usize, reason: String },

    /// `ERROR:` reply reported by the remote relay.
    #[error("{0}")]
    Remote(String),

    #[error("unexpected tunnel reply: {0}")]
    UnexpectedReply(String),

    #[error("ech: {0}")]
    Ech(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Peer hang-ups and orderly closes. These end a session like any other
    /// error but are only worth a debug line.
    pub fn is_normal_close(&self) -> bool {
        match self {
            Error::Io(e) => is_normal_io(e.kind()),
            Error::WebSocket(e) => match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
                tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
                tungstenite::Error::Io(io) => is_normal_io(io.kind()),
                _ => false,
            },
            _ => false,
        }
    }
}

fn is_normal_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_peer_hangups_as_normal() {
        let eof: Error = std::io::Error::from(ErrorKind::UnexpectedEof).into();
        assert!(eof.is_normal_close());

        let reset: Error = std::io::Error::from(ErrorKind::ConnectionReset).into();
        assert!(reset.is_normal_close());

        let closed: Error = tungstenite::Error::ConnectionClosed.into();
        assert!(closed.is_normal_close());
    }

    #[test]
    fn remote_failures_are_not_normal() {
        assert!(!Error::Remote("ERROR:upstream refused".into()).is_normal_close());
        assert!(!Error::UnexpectedReply("HELLO".into()).is_normal_close());

        let refused: Error = std::io::Error::from(ErrorKind::ConnectionRefused).into();
        assert!(!refused.is_normal_close());
    }
}
