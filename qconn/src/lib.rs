/// Host-side access to the QConn agent on a QNX target
///
/// Two protocols live here: the plain, telnet-escaped text protocol spoken by
/// the `qconn` service, and the framed secure-pairing handshake spoken by the
/// door service that unlocks it.

use thiserror::Error;

pub mod channel;
pub mod file;
pub mod frame;
pub mod reader;
pub mod secure;
pub mod transport;

pub use channel::{Endian, QConnChannel, DEFAULT_QCONN_PORT};
pub use file::{FileHandle, FileService, TargetFile};
pub use reader::DataReader;
pub use secure::pairing::{PairingConfig, PairingEvent, PairingState, SecurePairing, DEFAULT_DOOR_PORT};
pub use transport::{QTransport, TransportConfig};

/// Outcome codes of transport and frame operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Fail,
    Abort,
    InvalidData,
    InvalidFrameCode,
    BufferTooSmall,
    Timeout,
}

#[derive(Error, Debug)]
pub enum QConnError {
    #[error("{reason} ({status:?})")]
    Connection { reason: String, status: Status },
    #[error("Malformed data from target: {offending}")]
    ProtocolFormat { offending: String },
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },
    #[error("Command \"{command}\" finished with error: {message}")]
    Command { command: String, message: String },
    #[error("Crypto failure: {0}")]
    Crypto(String),
    #[error("Target connection is not authenticated")]
    NotAuthenticated,
}

impl QConnError {
    pub(crate) fn connection(reason: impl Into<String>, status: Status) -> Self {
        QConnError::Connection {
            reason: reason.into(),
            status,
        }
    }

    pub(crate) fn format(offending: impl Into<String>) -> Self {
        QConnError::ProtocolFormat {
            offending: offending.into(),
        }
    }

    pub(crate) fn authentication(reason: impl Into<String>) -> Self {
        QConnError::Authentication {
            reason: reason.into(),
        }
    }

    /// Status carried by a connection failure.
    pub fn status(&self) -> Option<Status> {
        match self {
            QConnError::Connection { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, QConnError>;
