//! Binary replies read in the target's byte order
//!
//! Some services answer with raw records instead of a text line. The reader
//! pulls more data from the connection whenever the buffered bytes run out,
//! so a record may span several reads.

use crate::channel::Endian;
use crate::frame;
use crate::transport::QTransport;
use crate::{QConnError, Result, Status};

const ERROR_PREFIX: &[u8] = b"error ";

pub struct DataReader<'a> {
    source: Option<&'a mut QTransport>,
    data: Vec<u8>,
    at: usize,
    endian: Endian,
}

impl<'a> DataReader<'a> {
    /// Reader over the reply that is about to arrive on `transport`.
    ///
    /// An `error ...` text reply in place of the record is reported as a
    /// command failure of `command`.
    pub async fn from_transport(transport: &'a mut QTransport, endian: Endian, command: &str) -> Result<Self> {
        let data = transport.receive(usize::MAX).await?;
        let is_error = data
            .get(..ERROR_PREFIX.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(ERROR_PREFIX));
        if is_error {
            let text = frame::decode(&data);
            return Err(QConnError::Command {
                command: command.to_string(),
                message: text.get(ERROR_PREFIX.len()..).unwrap_or_default().to_string(),
            });
        }

        Ok(Self {
            source: Some(transport),
            data,
            at: 0,
            endian,
        })
    }

    /// Reader over bytes already received in full.
    pub fn from_bytes(data: Vec<u8>, endian: Endian) -> Self {
        Self {
            source: None,
            data,
            at: 0,
            endian,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    fn remaining(&self) -> &[u8] {
        self.data.get(self.at..).unwrap_or_default()
    }

    async fn fill(&mut self) -> Result<()> {
        let Some(source) = self.source.as_mut() else {
            return Err(QConnError::connection("Failed to read all available data", Status::InvalidData));
        };
        let more = source.receive(usize::MAX).await?;
        self.data.drain(..self.at.min(self.data.len()));
        self.at = 0;
        self.data.extend_from_slice(&more);
        Ok(())
    }

    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        while self.remaining().len() < len {
            self.fill().await?;
        }
        let bytes = frame::slice(&self.data, self.at, len)?.to_vec();
        self.at += len;
        Ok(bytes)
    }

    pub async fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).await.map(|_| ())
    }

    /// Anything but a little-endian target is read big-endian.
    pub async fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4).await?;
        match self.endian {
            Endian::Little => frame::u32_le(&bytes, 0),
            Endian::Big | Endian::Unknown => frame::u32_be(&bytes, 0),
        }
    }

    pub async fn read_u64(&mut self) -> Result<u64> {
        let first = u64::from(self.read_u32().await?);
        let second = u64::from(self.read_u32().await?);
        Ok(match self.endian {
            Endian::Little => second << 32 | first,
            Endian::Big | Endian::Unknown => first << 32 | second,
        })
    }

    /// Text up to `terminator` (consumed) or `max` bytes, whichever comes first.
    pub async fn read_string(&mut self, max: usize, terminator: u8) -> Result<String> {
        let mut text = Vec::new();
        while text.len() < max {
            if self.remaining().is_empty() {
                self.fill().await?;
            }
            let byte = self.data[self.at];
            self.at += 1;
            if byte == terminator {
                break;
            }
            text.push(byte);
        }
        Ok(String::from_utf8_lossy(&text).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_fields() {
        tokio_test::block_on(async {
            let mut data = vec![0x78, 0x56, 0x34, 0x12];
            data.extend_from_slice(&[0x02, 0, 0, 0, 0x01, 0, 0, 0]);
            data.extend_from_slice(b"tmp\0rest");

            let mut reader = DataReader::from_bytes(data, Endian::Little);
            assert_eq!(reader.read_u32().await.unwrap(), 0x1234_5678);
            assert_eq!(reader.read_u64().await.unwrap(), 0x1_0000_0002);
            assert_eq!(reader.read_string(64, 0).await.unwrap(), "tmp");
            assert_eq!(reader.read_string(2, 0).await.unwrap(), "re");
            assert_eq!(reader.read_bytes(2).await.unwrap(), b"st");
        });
    }

    #[test]
    fn test_big_endian_fields() {
        tokio_test::block_on(async {
            let data = vec![0x12, 0x34, 0x56, 0x78, 0, 0, 0, 0x01, 0, 0, 0, 0x02];
            let mut reader = DataReader::from_bytes(data, Endian::Big);
            assert_eq!(reader.read_u32().await.unwrap(), 0x1234_5678);
            assert_eq!(reader.read_u64().await.unwrap(), 0x1_0000_0002);
        });
    }

    #[test]
    fn test_short_buffer_without_source_fails() {
        tokio_test::block_on(async {
            let mut reader = DataReader::from_bytes(vec![1, 2], Endian::Unknown);
            let err = reader.read_u32().await.unwrap_err();
            assert_eq!(err.status(), Some(Status::InvalidData));
        });
    }
}
