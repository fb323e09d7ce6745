//! Key material and primitives used by the pairing handshake.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use super::messages::AuthChallenge;
use crate::frame;
use crate::{QConnError, Result};

pub const DEFAULT_KEY_BITS: usize = 1024;
pub const PUBLIC_EXPONENT: u32 = 65537;
pub const SESSION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

fn crypto_error(context: &str, e: impl std::fmt::Display) -> QConnError {
    QConnError::Crypto(format!("{}: {}", context, e))
}

/// RSA key pair generated for one pairing
#[derive(Clone)]
pub struct LocalKeys {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl LocalKeys {
    pub fn generate(bits: usize) -> Result<Self> {
        log::debug!("Generating {}-bit RSA key pair", bits);
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| crypto_error("RSA key generation", e))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Big-endian modulus, as sent to the target.
    pub fn modulus(&self) -> Vec<u8> {
        self.public.n().to_bytes_be()
    }

    /// Signature length in bytes.
    pub fn size(&self) -> usize {
        self.public.size()
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| crypto_error("RSA decryption", e))
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = SigningKey::<Sha256>::new(self.private.clone());
        key.try_sign(data)
            .map(|signature| signature.to_vec())
            .map_err(|e| crypto_error("RSA signing", e))
    }
}

/// Public key of the host as the target rebuilds it from the modulus.
pub fn public_key_from_modulus(modulus: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::new(BigUint::from_bytes_be(modulus), BigUint::from(PUBLIC_EXPONENT))
        .map_err(|e| crypto_error("RSA public key", e))
}

pub fn encrypt_for(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
        .map_err(|e| crypto_error("RSA encryption", e))
}

pub fn verify_signature(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> Result<()> {
    let signature = Signature::try_from(signature).map_err(|e| crypto_error("RSA signature", e))?;
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(data, &signature)
        .map_err(|e| crypto_error("RSA signature", e))
}

pub fn generate_session_key() -> Zeroizing<Vec<u8>> {
    Zeroizing::new(Aes256Gcm::generate_key(OsRng).to_vec())
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    let digest = Zeroizing::new(Sha256::digest(key).to_vec());
    Aes256Gcm::new_from_slice(&digest).map_err(|e| crypto_error("AES key", e))
}

/// Encrypt under `key`: `u16 cipher_len | u16 plain_len | nonce | cipher`.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher(key)?
        .encrypt(&nonce, plaintext)
        .map_err(|e| crypto_error("AES encryption", e))?;

    let ct_len = u16::try_from(ciphertext.len()).map_err(|e| crypto_error("sealed payload", e))?;
    let pt_len = u16::try_from(plaintext.len()).map_err(|e| crypto_error("sealed payload", e))?;

    let mut sealed = Vec::with_capacity(4 + NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&ct_len.to_be_bytes());
    sealed.extend_from_slice(&pt_len.to_be_bytes());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Inverse of [`seal`].
pub fn open(key: &[u8], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let ct_len = usize::from(frame::u16_be(sealed, 0)?);
    let pt_len = usize::from(frame::u16_be(sealed, 2)?);
    let nonce = frame::slice(sealed, 4, NONCE_LEN)?;
    let ciphertext = frame::slice(sealed, 4 + NONCE_LEN, ct_len)?;

    let plaintext = cipher(key)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|e| crypto_error("AES decryption", e))?;

    if plaintext.len() != pt_len {
        return Err(QConnError::Crypto(format!(
            "sealed payload announced {} bytes, decrypted {}",
            pt_len,
            plaintext.len()
        )));
    }
    Ok(plaintext)
}

fn iterate<D: Digest>(password: &[u8], challenge: &AuthChallenge, iterations: u32) -> Zeroizing<Vec<u8>> {
    let mut hash = Zeroizing::new(password.to_vec());
    for i in 0..iterations {
        let next = D::new()
            .chain_update(i.to_le_bytes())
            .chain_update(&challenge.salt)
            .chain_update(hash.as_slice())
            .finalize();
        hash = Zeroizing::new(next.to_vec());
    }

    if !challenge.nonce.is_empty() {
        let mixed = D::new()
            .chain_update(&challenge.nonce)
            .chain_update(hash.as_slice())
            .finalize();
        hash = Zeroizing::new(mixed.to_vec());
    }
    hash
}

/// Derive the base64 password hash the target asked for.
pub fn hash_password(password: &str, challenge: &AuthChallenge) -> Result<Zeroizing<String>> {
    let iterations = challenge.iterations.max(1);
    let hash = match challenge.algorithm {
        0 => iterate::<Sha256>(password.as_bytes(), challenge, 1),
        1 => iterate::<Sha256>(password.as_bytes(), challenge, iterations),
        2 => iterate::<Sha512>(password.as_bytes(), challenge, iterations),
        other => {
            return Err(QConnError::Authentication {
                reason: format!("Unsupported password hash algorithm {}", other),
            })
        }
    };
    Ok(Zeroizing::new(STANDARD.encode(hash.as_slice())))
}
