/// Plain command/response protocol of the `qconn` service
///
/// Commands are CRLF-terminated text; every command is answered by exactly
/// one telnet-escaped text reply.

use std::collections::HashMap;

use crate::frame;
use crate::reader::DataReader;
use crate::transport::{QTransport, TransportConfig};
use crate::{QConnError, Result};

pub const DEFAULT_QCONN_PORT: u16 = 8000;

const GREETING: &str = "QCONN";
const ERROR_PREFIX: &str = "error ";
const SERVICES_PREFIX: &str = "services: ";

/// Byte order reported by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
    Unknown,
}

impl Endian {
    pub fn parse(text: &str) -> Self {
        if text.eq_ignore_ascii_case("le") {
            Endian::Little
        } else if text.eq_ignore_ascii_case("be") {
            Endian::Big
        } else {
            Endian::Unknown
        }
    }
}

pub struct QConnChannel {
    transport: QTransport,
    service: Option<String>,
    endian: Endian,
}

impl QConnChannel {
    /// Connect, check the greeting and optionally select a service.
    pub async fn open(host: &str, port: u16, config: TransportConfig, service: Option<&str>) -> Result<Self> {
        let transport = QTransport::connect(host, port, config).await?;
        Self::handshake(transport, service).await
    }

    /// Take over an already connected transport.
    pub async fn handshake(transport: QTransport, service: Option<&str>) -> Result<Self> {
        let mut channel = Self {
            transport,
            service: None,
            endian: Endian::Unknown,
        };

        let (greeting, length) = channel.read_reply().await?;
        if greeting != GREETING {
            channel.transport.close().await;
            return Err(QConnError::format(format!("Invalid service running on target: {:?}", greeting)));
        }

        // the greeting may arrive split from its control-only trailer
        if length < 10 {
            channel.read_reply().await?;
        }

        if let Some(service) = service {
            channel.send(&format!("service {}", service)).await?;
            channel.service = Some(service.to_string());
        }

        log::debug!("QConn channel open to {}", channel.transport.peer());
        Ok(channel)
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Byte order used for binary replies.
    pub fn byte_order(&self) -> Endian {
        self.endian
    }

    pub fn set_byte_order(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Next non-heartbeat reply, decoded, with its raw length.
    async fn read_reply(&mut self) -> Result<(String, usize)> {
        loop {
            let data = self.transport.receive(usize::MAX).await?;
            if frame::is_heartbeat(&data) {
                log::trace!("Heartbeat from {}", self.transport.peer());
                continue;
            }
            return Ok((frame::decode(&data), data.len()));
        }
    }

    fn frame_command(command: &str, data: &[u8]) -> Result<Vec<u8>> {
        if command.is_empty() {
            return Err(QConnError::format("empty command"));
        }

        let mut request = Vec::with_capacity(command.len() + 2 + data.len());
        request.extend_from_slice(command.as_bytes());
        request.extend_from_slice(b"\r\n");
        request.extend_from_slice(data);
        Ok(request)
    }

    pub async fn send(&mut self, command: &str) -> Result<String> {
        self.send_with_data(command, &[]).await
    }

    /// Send a command followed by a binary payload.
    pub async fn send_with_data(&mut self, command: &str, data: &[u8]) -> Result<String> {
        let request = Self::frame_command(command, data)?;

        log::debug!("SEND: {}", command);
        self.transport.send(&request).await?;

        let (reply, _) = self.read_reply().await?;
        log::debug!("RECV: {}", reply);

        if reply.is_empty() {
            return Err(QConnError::Command {
                command: command.to_string(),
                message: "unknown response".into(),
            });
        }
        let is_error = reply
            .get(..ERROR_PREFIX.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(ERROR_PREFIX));
        if is_error {
            return Err(QConnError::Command {
                command: command.to_string(),
                message: reply.get(ERROR_PREFIX.len()..).unwrap_or_default().to_string(),
            });
        }
        Ok(reply)
    }

    /// Send a command whose reply is a binary record in the channel's byte order.
    pub async fn request(&mut self, command: &str) -> Result<DataReader<'_>> {
        let request = Self::frame_command(command, &[])?;

        log::debug!("SEND: {} (raw reply, {:?})", command, self.endian);
        self.transport.send(&request).await?;
        DataReader::from_transport(&mut self.transport, self.endian, command).await
    }

    /// Target properties from `info`.
    pub async fn info(&mut self) -> Result<HashMap<String, String>> {
        let reply = self.send("info").await?;
        Ok(parse_properties(&reply))
    }

    /// Ask the target for its byte order and use it for binary replies.
    pub async fn endian(&mut self) -> Result<Endian> {
        let info = self.info().await?;
        self.endian = info.get("ENDIAN").map_or(Endian::Unknown, |e| Endian::parse(e));
        Ok(self.endian)
    }

    /// Names of the services the agent offers.
    pub async fn services(&mut self) -> Result<Vec<String>> {
        let reply = self.send("service ?").await?;
        let list = reply.strip_prefix(SERVICES_PREFIX).unwrap_or(&reply);
        Ok(list.split_whitespace().map(str::to_string).collect())
    }

    /// `(major, minor)` version of a service.
    pub async fn service_version(&mut self, name: &str) -> Result<(u8, u8)> {
        let reply = self.send(&format!("version {}", name)).await?;
        let number: u32 = reply
            .trim()
            .parse()
            .map_err(|_| QConnError::format(format!("Unable to parse version of \"{}\" service: {}", name, reply)))?;
        Ok((((number & 0xFF00) >> 8) as u8, (number & 0xFF) as u8))
    }

    pub async fn close(mut self) {
        self.transport.close().await;
    }
}

/// Space-separated `KEY=VALUE` pairs; tokens without `=` are ignored.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    text.split_whitespace()
        .filter_map(|item| item.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
