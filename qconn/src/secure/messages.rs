//! Door protocol frames.
//!
//! Every frame starts with a big-endian header: total length, protocol
//! version and message code.

use crate::frame::{self, put_prefixed};
use crate::{QConnError, Result, Status};

pub const PROTOCOL_VERSION: u16 = 2;
pub const HEADER_LEN: usize = 6;

/// Codes of frames the host sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCode {
    Hello = 1,
    Challenge = 3,
    ChallengeResponse = 5,
    SshPublicKey = 7,
    AuthChallengeRequest = 8,
    Authenticate = 10,
    StartServices = 11,
    Close = 12,
    KeepAlive = 13,
}

impl RequestCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1 => RequestCode::Hello,
            3 => RequestCode::Challenge,
            5 => RequestCode::ChallengeResponse,
            7 => RequestCode::SshPublicKey,
            8 => RequestCode::AuthChallengeRequest,
            10 => RequestCode::Authenticate,
            11 => RequestCode::StartServices,
            12 => RequestCode::Close,
            13 => RequestCode::KeepAlive,
            _ => return None,
        })
    }
}

const RESULT_FEEDBACK: u16 = 2;
const RESULT_ENCRYPTED_CHALLENGE: u16 = 4;
const RESULT_AUTH_CHALLENGE: u16 = 9;

const FEEDBACK_OK: u16 = 0;
const FEEDBACK_VERSION_MISMATCH: u16 = 10;
const FEEDBACK_NO_PASSWORD: u16 = 21;

/// Status reply of the door
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Ok,
    VersionMismatch(String),
    NoPasswordRequired,
    Rejected { code: u16, reason: String },
}

impl Feedback {
    pub fn from_code(code: u16, text: String) -> Self {
        match code {
            FEEDBACK_OK => Feedback::Ok,
            FEEDBACK_VERSION_MISMATCH => Feedback::VersionMismatch(text),
            FEEDBACK_NO_PASSWORD => Feedback::NoPasswordRequired,
            code => Feedback::Rejected { code, reason: text },
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Feedback::Ok => FEEDBACK_OK,
            Feedback::VersionMismatch(_) => FEEDBACK_VERSION_MISMATCH,
            Feedback::NoPasswordRequired => FEEDBACK_NO_PASSWORD,
            Feedback::Rejected { code, .. } => *code,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Feedback::VersionMismatch(text) => text,
            Feedback::Rejected { reason, .. } => reason,
            _ => "",
        }
    }
}

/// Recipe for deriving the password hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub algorithm: u32,
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// A decoded door reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureResult {
    Feedback(Feedback),
    EncryptedChallenge(Vec<u8>),
    AuthChallenge(AuthChallenge),
}

fn frame_with(code: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let total = u16::try_from(HEADER_LEN + payload.len())
        .map_err(|_| QConnError::format(format!("frame payload of {} bytes is too long", payload.len())))?;

    let mut data = Vec::with_capacity(usize::from(total));
    data.extend_from_slice(&total.to_be_bytes());
    data.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    data.extend_from_slice(&code.to_be_bytes());
    data.extend_from_slice(payload);
    Ok(data)
}

/// Split a frame into its code and payload.
pub fn split_frame(data: &[u8]) -> Result<(u16, &[u8])> {
    let total = usize::from(frame::u16_be(data, 0)?);
    let code = frame::u16_be(data, 4)?;
    if total < HEADER_LEN || total > data.len() {
        return Err(QConnError::format(format!(
            "frame announces {} bytes, received {}",
            total,
            data.len()
        )));
    }
    Ok((code, &data[HEADER_LEN..total]))
}

pub fn encode_request(code: RequestCode, payload: &[u8]) -> Result<Vec<u8>> {
    frame_with(code as u16, payload)
}

pub fn decode_request(data: &[u8]) -> Result<(RequestCode, Vec<u8>)> {
    let (code, payload) = split_frame(data)?;
    let code = RequestCode::from_u16(code)
        .ok_or_else(|| QConnError::connection(format!("Unknown request code {}", code), Status::InvalidFrameCode))?;
    Ok((code, payload.to_vec()))
}

impl SecureResult {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let code = match self {
            SecureResult::Feedback(feedback) => {
                payload.extend_from_slice(&feedback.code().to_be_bytes());
                let mut text = feedback.text().as_bytes().to_vec();
                text.push(0);
                put_prefixed(&mut payload, &text)?;
                RESULT_FEEDBACK
            }
            SecureResult::EncryptedChallenge(challenge) => {
                payload.extend_from_slice(challenge);
                RESULT_ENCRYPTED_CHALLENGE
            }
            SecureResult::AuthChallenge(auth) => {
                payload.extend_from_slice(&auth.algorithm.to_be_bytes());
                payload.extend_from_slice(&auth.iterations.to_be_bytes());
                put_prefixed(&mut payload, &auth.salt)?;
                put_prefixed(&mut payload, &auth.nonce)?;
                RESULT_AUTH_CHALLENGE
            }
        };
        frame_with(code, &payload)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (code, payload) = split_frame(data)?;

        match code {
            RESULT_FEEDBACK => {
                let feedback = frame::u16_be(payload, 0)?;
                let len = usize::from(frame::u16_be(payload, 2)?);
                let raw = frame::slice(payload, 4, len)?;
                let text = raw.strip_suffix(&[0]).unwrap_or(raw);
                Ok(SecureResult::Feedback(Feedback::from_code(
                    feedback,
                    String::from_utf8_lossy(text).into_owned(),
                )))
            }
            RESULT_ENCRYPTED_CHALLENGE => Ok(SecureResult::EncryptedChallenge(payload.to_vec())),
            RESULT_AUTH_CHALLENGE => {
                let algorithm = frame::u32_be(payload, 0)?;
                let iterations = frame::u32_be(payload, 4)?;
                let salt_len = usize::from(frame::u16_be(payload, 8)?);
                let salt = frame::slice(payload, 10, salt_len)?.to_vec();
                let nonce_at = 10 + salt_len;
                let nonce_len = usize::from(frame::u16_be(payload, nonce_at)?);
                let nonce = frame::slice(payload, nonce_at + 2, nonce_len)?.to_vec();
                Ok(SecureResult::AuthChallenge(AuthChallenge {
                    algorithm,
                    iterations,
                    salt,
                    nonce,
                }))
            }
            other => Err(QConnError::connection(
                format!("The target returned an improper response code: {}", other),
                Status::InvalidFrameCode,
            )),
        }
    }

    /// Reject version mismatches and refusals; anything else passes.
    pub fn verify(self) -> Result<Self> {
        match self {
            SecureResult::Feedback(Feedback::VersionMismatch(message)) => Err(QConnError::connection(
                format!("Protocol version mismatch: {}", message),
                Status::Fail,
            )),
            SecureResult::Feedback(Feedback::Rejected { code, reason }) => Err(QConnError::authentication(
                format!("Connection refused ({}): {}", code, reason),
            )),
            other => Ok(other),
        }
    }
}
