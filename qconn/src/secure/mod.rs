//! Secure pairing with the door service
//!
//! The door listens on its own port and must unlock the target before the
//! `qconn` service accepts connections.

pub mod challenge;
pub mod crypto;
pub mod messages;
pub mod pairing;

pub use challenge::{DecryptedChallenge, EncryptionChallenge, PERMISSIONS, SUPPORTED_SIGNATURE_TYPE};
pub use crypto::{hash_password, open, seal, LocalKeys};
pub use messages::{AuthChallenge, Feedback, RequestCode, SecureResult, PROTOCOL_VERSION};
