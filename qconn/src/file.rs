//! Target file system through the `file` service
//!
//! Paths are opened to obtain a handle; queries on a handle are answered with
//! binary records in the target's byte order.

use serde::Serialize;

use crate::channel::{Endian, QConnChannel};
use crate::transport::TransportConfig;
use crate::{QConnError, Result};

pub const SERVICE_NAME: &str = "file";

/// Largest block moved by a single read.
pub const CHUNK_SIZE: u32 = 0x8000;

pub const OPEN_NONE: u32 = 0;
pub const OPEN_READ_ONLY: u32 = 1;
pub const OPEN_WRITE_ONLY: u32 = 2;
pub const OPEN_READ_WRITE: u32 = OPEN_READ_ONLY | OPEN_WRITE_ONLY;

const TYPE_MASK: u32 = 0xF000;
const PERMISSIONS_MASK: u32 = 0xFFF;
const MAX_NAME: usize = 1024;

/// Metadata of one target path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFile {
    pub path: String,
    pub mode: u32,
    pub size: u64,
    pub flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub modified: u32,
}

impl TargetFile {
    pub fn name(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }

    pub fn permissions(&self) -> u32 {
        self.mode & PERMISSIONS_MASK
    }

    pub fn is_directory(&self) -> bool {
        self.mode & TYPE_MASK == 0x4000
    }

    /// `ls`-style type letter.
    pub fn type_char(&self) -> char {
        match self.mode & TYPE_MASK {
            0x2000 => 'c',
            0x4000 => 'd',
            0x5000 => 'p',
            0x6000 => 'b',
            0xA000 => 'l',
            0xC000 => 's',
            _ => '-',
        }
    }
}

/// Open target file; give it back with [`FileService::close_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub handle: String,
    pub path: String,
}

pub struct FileService {
    channel: QConnChannel,
}

impl FileService {
    /// Connect to the `file` service and learn the target's byte order.
    pub async fn open(host: &str, port: u16, config: TransportConfig) -> Result<Self> {
        let mut channel = QConnChannel::open(host, port, config, Some(SERVICE_NAME)).await?;
        let endian = channel.endian().await?;
        log::debug!("File service on {} uses {:?} byte order", host, endian);
        Ok(Self { channel })
    }

    /// Use a channel that already selected the `file` service.
    pub fn from_channel(channel: QConnChannel, endian: Endian) -> Self {
        let mut channel = channel;
        channel.set_byte_order(endian);
        Self { channel }
    }

    pub fn endian(&self) -> Endian {
        self.channel.byte_order()
    }

    pub async fn open_file(&mut self, path: &str, flags: u32, mode: u32) -> Result<FileHandle> {
        if path.is_empty() || path.contains('"') {
            return Err(QConnError::format(format!("Invalid target path {:?}", path)));
        }

        let reply = self
            .channel
            .send(&format!("o:\"{}\":{:x}:{:x}", path, flags, mode))
            .await?;
        let handle = reply
            .strip_prefix("o:")
            .map(str::trim)
            .filter(|handle| !handle.is_empty())
            .ok_or_else(|| QConnError::format(format!("Unexpected reply to open of {}: {}", path, reply)))?;

        Ok(FileHandle {
            handle: handle.to_string(),
            path: path.to_string(),
        })
    }

    pub async fn close_file(&mut self, file: FileHandle) -> Result<()> {
        self.channel.send(&format!("c:{}", file.handle)).await.map(|_| ())
    }

    /// Metadata of an open handle.
    pub async fn stat_handle(&mut self, file: &FileHandle) -> Result<TargetFile> {
        let mut reader = self.channel.request(&format!("s:{}", file.handle)).await?;
        let mode = reader.read_u32().await?;
        let size = reader.read_u64().await?;
        let flags = reader.read_u32().await?;
        let uid = reader.read_u32().await?;
        let gid = reader.read_u32().await?;
        let modified = reader.read_u32().await?;

        Ok(TargetFile {
            path: file.path.clone(),
            mode,
            size,
            flags,
            uid,
            gid,
            modified,
        })
    }

    /// Metadata of a path, without opening it for reading.
    pub async fn stat(&mut self, path: &str) -> Result<TargetFile> {
        let file = self.open_file(path, OPEN_NONE, 0).await?;
        let stat = self.stat_handle(&file).await;
        self.close_file(file).await?;
        stat
    }

    /// Entry names of a directory, in target order.
    pub async fn list(&mut self, path: &str) -> Result<Vec<String>> {
        let dir = self.open_file(path, OPEN_READ_ONLY, 0).await?;
        let names = self.list_handle(&dir).await;
        self.close_file(dir).await?;
        names
    }

    async fn list_handle(&mut self, dir: &FileHandle) -> Result<Vec<String>> {
        let mut reader = self.channel.request(&format!("l:{}", dir.handle)).await?;
        let count = reader.read_u32().await?;

        let mut names = Vec::new();
        for _ in 0..count {
            let name = reader.read_string(MAX_NAME, 0).await?;
            if name != "." && name != ".." {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Up to `len` bytes at `offset`; shorter only at end of file.
    pub async fn read(&mut self, file: &FileHandle, offset: u64, len: u32) -> Result<Vec<u8>> {
        let len = len.min(CHUNK_SIZE);
        let mut reader = self
            .channel
            .request(&format!("r:{}:{:x}:{:x}", file.handle, offset, len))
            .await?;

        let available = reader.read_u32().await?;
        if available > len {
            return Err(QConnError::format(format!(
                "Read of {} bytes answered with {}",
                len, available
            )));
        }
        reader.read_bytes(available as usize).await
    }

    /// Whole content of a target file.
    pub async fn download(&mut self, path: &str) -> Result<Vec<u8>> {
        let file = self.open_file(path, OPEN_READ_ONLY, 0).await?;
        let mut content = Vec::new();

        let result = loop {
            match self.read(&file, content.len() as u64, CHUNK_SIZE).await {
                Ok(block) if block.is_empty() => break Ok(()),
                Ok(block) => {
                    let done = block.len() < CHUNK_SIZE as usize;
                    content.extend_from_slice(&block);
                    if done {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };

        self.close_file(file).await?;
        result.map(|_| content)
    }

    pub async fn close(self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, mode: u32) -> TargetFile {
        TargetFile {
            path: path.into(),
            mode,
            size: 0,
            flags: 0,
            uid: 0,
            gid: 0,
            modified: 0,
        }
    }

    #[test]
    fn test_mode_bits() {
        let dir = file("/accounts/1000/shared/", 0x41ED);
        assert!(dir.is_directory());
        assert_eq!(dir.type_char(), 'd');
        assert_eq!(dir.permissions(), 0o755);
        assert_eq!(dir.name(), "shared");

        let link = file("/usr/lib/libc.so", 0xA1FF);
        assert!(!link.is_directory());
        assert_eq!(link.type_char(), 'l');
        assert_eq!(link.name(), "libc.so");
    }
}
