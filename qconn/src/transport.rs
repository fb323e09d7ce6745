/// Raw socket primitive shared by the plain and secure channels
///
/// Every operation is bounded by the configured timeouts; a failure is
/// reported with the [`Status`] of the step that failed and never retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::frame;
use crate::{QConnError, Result, Status};

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CHUNK_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    pub chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_TIMEOUT_MS,
            receive_timeout_ms: DEFAULT_TIMEOUT_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl TransportConfig {
    fn duration(ms: u64) -> Duration {
        Duration::from_millis(if ms == 0 { DEFAULT_TIMEOUT_MS } else { ms })
    }

    pub fn connect_timeout(&self) -> Duration {
        Self::duration(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Self::duration(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Self::duration(self.receive_timeout_ms)
    }

    pub fn chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }
}

pub struct QTransport {
    stream: Option<TcpStream>,
    peer: String,
    config: TransportConfig,
}

impl QTransport {
    pub async fn connect(host: &str, port: u16, config: TransportConfig) -> Result<Self> {
        let peer = format!("{}:{}", host, port);
        log::debug!("Connecting to {}", peer);

        let stream = match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::error!("Unable to establish connection to {}: {}", peer, e);
                return Err(QConnError::connection(
                    format!("Unable to connect to target {}: {}", peer, e),
                    Status::Fail,
                ));
            }
            Err(_) => {
                log::error!("Connection to {} timed out after {:?}", peer, config.connect_timeout());
                return Err(QConnError::connection(
                    format!("Unable to connect to target {}", peer),
                    Status::Timeout,
                ));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Unable to disable Nagle on {}: {}", peer, e);
        }

        Ok(Self {
            stream: Some(stream),
            peer,
            config,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| QConnError::connection("Attempt to use a closed connection", Status::Fail))
    }

    /// Discard whatever a previous exchange left unread.
    ///
    /// Fails when the target has already hung up.
    fn drain_stale(&mut self) -> Result<()> {
        let mut buffer = vec![0u8; self.config.chunk_size()];
        let stream = self.stream()?;
        loop {
            match stream.try_read(&mut buffer) {
                Ok(0) => return Err(QConnError::connection("Connection closed by target", Status::Abort)),
                Ok(n) => log::trace!("Dropped {} stale bytes", n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(QConnError::connection(format!("Failed to read data: {}", e), Status::Fail)),
            }
        }
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if let Err(e) = self.drain_stale() {
            self.close().await;
            return Err(e);
        }

        let timeout = self.config.send_timeout();
        let stream = self.stream()?;
        let result = tokio::time::timeout(timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await;

        let failure = match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => QConnError::connection(format!("Failed to send data: {}", e), Status::Fail),
            Err(_) => QConnError::connection("Timed out sending data", Status::Timeout),
        };
        log::error!("{}: {}", self.peer, failure);
        self.close().await;
        Err(failure)
    }

    /// Read at least once, then keep reading full chunks while more is ready.
    pub async fn receive(&mut self, max: usize) -> Result<Vec<u8>> {
        let chunk = self.config.chunk_size();
        let timeout = self.config.receive_timeout();
        let stream = self.stream()?;

        let mut buffer = vec![0u8; chunk];
        let mut data = Vec::new();

        let mut read = match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
            Ok(Ok(0)) => return Err(QConnError::connection("Connection closed by target", Status::Abort)),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(QConnError::connection(format!("Failed to read data: {}", e), Status::Fail)),
            Err(_) => return Err(QConnError::connection("No response received in expected time", Status::Timeout)),
        };

        loop {
            data.extend_from_slice(&buffer[..read]);
            if data.len() >= max || read != chunk {
                break;
            }
            read = match stream.try_read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(QConnError::connection(format!("Failed to read data: {}", e), Status::Fail)),
            };
        }

        log::trace!("RECV {} bytes from {}", data.len(), self.peer);
        Ok(data)
    }

    /// Read one length-prefixed packet of at most `capacity` bytes.
    pub async fn receive_packet(&mut self, capacity: usize) -> Result<Vec<u8>> {
        let mut data = self.receive(capacity).await?;
        while data.len() < 2 {
            let more = self.receive(capacity.saturating_sub(data.len())).await?;
            data.extend_from_slice(&more);
        }

        let announced = usize::from(frame::u16_be(&data, 0)?);
        if announced > capacity {
            log::warn!("Packet length larger than buffer, expected size: {}", announced);
            return Err(QConnError::connection(
                format!("Packet of {} bytes exceeds buffer of {}", announced, capacity),
                Status::BufferTooSmall,
            ));
        }

        while data.len() < announced {
            let more = self.receive(announced - data.len()).await?;
            data.extend_from_slice(&more);
        }
        data.truncate(announced.max(2));
        Ok(data)
    }

    /// Shut the socket down; closing twice is fine.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            log::debug!("Closing connection to {}", self.peer);
            if let Err(e) = stream.shutdown().await {
                log::debug!("Unable to shut down connection to {}: {}", self.peer, e);
            }
        }
    }
}
