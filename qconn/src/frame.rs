//! Byte-level helpers: telnet escape stripping and integer fields.

use crate::{QConnError, Result};

const IAC: u8 = 0xFF;
const DONT: u8 = 0xFE;
const DO: u8 = 0xFD;
const WONT: u8 = 0xFC;
const WILL: u8 = 0xFB;
const SB: u8 = 0xFA;
const SE: u8 = 0xF0;
const LF: u8 = 0x0A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Command,
    Option,
    Subnegotiation,
    SubnegotiationCommand,
}

/// Strip telnet negotiation and control bytes from one read.
///
/// Bytes map to chars one to one (Latin-1). Scanning stops at the first line
/// feed outside of a negotiation sequence.
pub fn decode(data: &[u8]) -> String {
    let mut text = String::with_capacity(data.len());
    let mut state = State::Normal;

    for &byte in data {
        state = match state {
            State::Normal => match byte {
                LF => break,
                IAC => State::Command,
                _ => {
                    let c = byte as char;
                    if !c.is_control() {
                        text.push(c);
                    }
                    State::Normal
                }
            },
            State::Command => match byte {
                IAC => {
                    text.push(IAC as char);
                    State::Normal
                }
                WILL | WONT | DO | DONT => State::Option,
                SB => State::Subnegotiation,
                _ => State::Normal,
            },
            State::Option => State::Normal,
            State::Subnegotiation => match byte {
                IAC => State::SubnegotiationCommand,
                _ => State::Subnegotiation,
            },
            State::SubnegotiationCommand => match byte {
                SE => State::Normal,
                _ => State::Subnegotiation,
            },
        };
    }

    text
}

/// A bare CRLF the target sends to keep the line open.
pub fn is_heartbeat(data: &[u8]) -> bool {
    data == b"\r\n"
}

fn field<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            QConnError::format(format!(
                "{}-byte field at offset {} exceeds {} bytes of data",
                N,
                offset,
                data.len()
            ))
        })
}

pub fn u16_be(data: &[u8], offset: usize) -> Result<u16> {
    field(data, offset).map(u16::from_be_bytes)
}

pub fn u32_be(data: &[u8], offset: usize) -> Result<u32> {
    field(data, offset).map(u32::from_be_bytes)
}

pub fn u16_le(data: &[u8], offset: usize) -> Result<u16> {
    field(data, offset).map(u16::from_le_bytes)
}

pub fn u32_le(data: &[u8], offset: usize) -> Result<u32> {
    field(data, offset).map(u32::from_le_bytes)
}

/// `len` bytes starting at `offset`.
pub fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    data.get(offset..offset + len).ok_or_else(|| {
        QConnError::format(format!(
            "{} bytes at offset {} exceed {} bytes of data",
            len,
            offset,
            data.len()
        ))
    })
}

/// Append a big-endian `u16` length followed by the bytes.
pub fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| QConnError::format(format!("{} bytes do not fit a u16 length", bytes.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_unchanged() {
        let text = "QCONN_VERSION=1.4 ENDIAN=le OS=nto";
        assert_eq!(decode(text.as_bytes()), text);
    }

    #[test]
    fn test_negotiation_stripped() {
        let data = [b'O', IAC, WILL, 0x01, b'K', IAC, DO, 0x03];
        assert_eq!(decode(&data), "OK");
    }

    #[test]
    fn test_escaped_iac_kept() {
        let data = [b'a', IAC, IAC, b'b'];
        assert_eq!(decode(&data), "a\u{ff}b");
    }

    #[test]
    fn test_subnegotiation_skipped() {
        let data = [b'x', IAC, SB, 0x18, 0x01, IAC, 0x00, b'q', IAC, SE, b'y'];
        assert_eq!(decode(&data), "xy");
    }

    #[test]
    fn test_stops_at_line_feed() {
        assert_eq!(decode(b"QCONN\r\nignored"), "QCONN");
        // a line feed inside an option sequence is consumed as the option byte
        assert_eq!(decode(&[IAC, WILL, LF, b'k']), "k");
    }

    #[test]
    fn test_heartbeat() {
        assert!(is_heartbeat(b"\r\n"));
        assert!(!is_heartbeat(b"\r\n\r\n"));
        assert!(!is_heartbeat(b"OK\r\n"));
    }

    #[test]
    fn test_integer_fields() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(u16_be(&data, 0).unwrap(), 0x0102);
        assert_eq!(u16_le(&data, 2).unwrap(), 0x0403);
        assert_eq!(u32_be(&data, 0).unwrap(), 0x0102_0304);
        assert_eq!(u32_le(&data, 0).unwrap(), 0x0403_0201);
        assert!(matches!(u16_be(&data, 3), Err(QConnError::ProtocolFormat { .. })));
        assert!(slice(&data, 2, 3).is_err());
    }
}
