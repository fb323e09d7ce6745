//! The target's encryption challenge and its answer.

use zeroize::Zeroizing;

use super::crypto::LocalKeys;
use crate::frame;
use crate::{QConnError, Result};

/// Bytes appended to the decrypted container before signing
pub const PERMISSIONS: [u8; 5] = [3, 4, 0x76, 0x83, 1];

/// PKCS#1 v1.5 with SHA-256
pub const SUPPORTED_SIGNATURE_TYPE: u16 = 1;

/// Container record that carries the transport key
const TRANSPORT_KEY_RECORD: u8 = 2;

const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionChallenge {
    pub length: u16,
    pub version: u16,
    pub source_name: String,
    pub session_key_length: u16,
    pub session_key_type: u16,
    pub container_primitive: u16,
    pub container_type: u16,
    pub expected_signature_length: u16,
    pub expected_signature_type: u16,
    pub container_key_version: u32,
    pub encrypted_blob: Vec<u8>,
}

impl EncryptionChallenge {
    /// Parse the little-endian challenge body.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(QConnError::format(format!("encryption challenge of {} bytes", data.len())));
        }

        let source_len = usize::from(frame::u16_le(data, 4)?);
        let container_len = usize::from(frame::u16_le(data, 10)?);
        let source = frame::slice(data, HEADER_LEN, source_len)?;

        Ok(Self {
            length: frame::u16_le(data, 0)?,
            version: frame::u16_le(data, 2)?,
            source_name: String::from_utf8_lossy(source).into_owned(),
            session_key_length: frame::u16_le(data, 6)?,
            session_key_type: frame::u16_le(data, 8)?,
            container_primitive: frame::u16_le(data, 12)?,
            container_type: frame::u16_le(data, 14)?,
            expected_signature_length: frame::u16_le(data, 16)?,
            expected_signature_type: frame::u16_le(data, 18)?,
            container_key_version: frame::u32_le(data, 20)?,
            encrypted_blob: frame::slice(data, HEADER_LEN + source_len, container_len)?.to_vec(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let source = self.source_name.as_bytes();
        let field = |len: usize| {
            u16::try_from(len).map_err(|_| QConnError::format(format!("challenge field of {} bytes", len)))
        };

        let mut data = Vec::with_capacity(HEADER_LEN + source.len() + self.encrypted_blob.len());
        data.extend_from_slice(&self.length.to_le_bytes());
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&field(source.len())?.to_le_bytes());
        data.extend_from_slice(&self.session_key_length.to_le_bytes());
        data.extend_from_slice(&self.session_key_type.to_le_bytes());
        data.extend_from_slice(&field(self.encrypted_blob.len())?.to_le_bytes());
        data.extend_from_slice(&self.container_primitive.to_le_bytes());
        data.extend_from_slice(&self.container_type.to_le_bytes());
        data.extend_from_slice(&self.expected_signature_length.to_le_bytes());
        data.extend_from_slice(&self.expected_signature_type.to_le_bytes());
        data.extend_from_slice(&self.container_key_version.to_le_bytes());
        data.extend_from_slice(source);
        data.extend_from_slice(&self.encrypted_blob);
        Ok(data)
    }

    /// Decrypt the container and sign it together with the permissions.
    pub fn decrypt(&self, keys: &LocalKeys) -> Result<DecryptedChallenge> {
        if self.expected_signature_type != SUPPORTED_SIGNATURE_TYPE {
            return Err(QConnError::Authentication {
                reason: format!("Unsupported signature type {}", self.expected_signature_type),
            });
        }

        let container = keys.decrypt(&self.encrypted_blob)?;
        let transport_key = challenge_item(&container, TRANSPORT_KEY_RECORD)
            .map(|key| Zeroizing::new(key.to_vec()))
            .ok_or_else(|| QConnError::format("challenge container carries no transport key"))?;

        let mut blob = Zeroizing::new(Vec::with_capacity(container.len() + PERMISSIONS.len()));
        blob.extend_from_slice(&container);
        blob.extend_from_slice(&PERMISSIONS);

        let signature = keys.sign(&blob)?;
        if signature.len() != usize::from(self.expected_signature_length) {
            return Err(QConnError::Authentication {
                reason: format!(
                    "Generated signature does not match expected signature length: {} instead of {}",
                    signature.len(),
                    self.expected_signature_length
                ),
            });
        }

        Ok(DecryptedChallenge {
            blob,
            signature,
            transport_key,
        })
    }
}

/// Answer material for one pairing attempt
pub struct DecryptedChallenge {
    pub blob: Zeroizing<Vec<u8>>,
    pub signature: Vec<u8>,
    pub transport_key: Zeroizing<Vec<u8>>,
}

/// Payload of the record with `id` in a `len | id | payload` list.
pub fn challenge_item(container: &[u8], id: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i + 1 < container.len() {
        let len = usize::from(container[i]);
        if container[i + 1] == id {
            return container.get(i + 2..i + 2 + len);
        }
        i += 2 + len;
    }
    None
}
