//! Deferred-add payload sources
//!
//! An add captures a [`DataSourceProxy`]: a stable descriptor that can
//! re-open its backing store at save time even if the working directory
//! changed in between. Paths are canonicalized at capture; in-memory
//! payloads are held as cheap reference-counted bytes.

use crate::{Error, Result};
use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// A realizable descriptor of a pending payload
#[derive(Debug, Clone)]
pub enum DataSourceProxy {
    /// Payload held in memory
    InMemory(Bytes),
    /// Payload backed by a file, canonicalized at capture time
    Path(PathBuf),
}

impl DataSourceProxy {
    /// Capture an in-memory payload
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        DataSourceProxy::InMemory(data.into())
    }

    /// Capture a file-backed payload
    ///
    /// The path is canonicalized immediately so later cwd changes cannot
    /// redirect the save.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let canonical = path.as_ref().canonicalize()?;
        Ok(DataSourceProxy::Path(canonical))
    }

    /// Open the backing store for reading
    pub fn realize(&self) -> Result<DataSource> {
        match self {
            DataSourceProxy::InMemory(bytes) => Ok(DataSource::Memory(bytes.clone())),
            DataSourceProxy::Path(path) => {
                let file = File::open(path)?;
                let len = file.metadata()?.len();
                Ok(DataSource::File { file, len })
            }
        }
    }
}

/// An opened payload source serving positional reads
#[derive(Debug)]
pub enum DataSource {
    /// In-memory payload
    Memory(Bytes),
    /// File-backed payload
    File {
        /// The opened backing file
        file: File,
        /// Cached length
        len: u64,
    },
}

impl DataSource {
    /// Payload length in bytes
    pub fn len(&self) -> u64 {
        match self {
            DataSource::Memory(bytes) => bytes.len() as u64,
            DataSource::File { len, .. } => *len,
        }
    }

    /// Check for an empty payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `buffer.len()` bytes at `offset`
    ///
    /// Short reads only happen at the end of the payload; the return value
    /// is the number of bytes actually copied.
    pub fn pread(&mut self, buffer: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            DataSource::Memory(bytes) => {
                if offset >= bytes.len() as u64 {
                    return Ok(0);
                }
                let start = offset as usize;
                let count = buffer.len().min(bytes.len() - start);
                buffer[..count].copy_from_slice(&bytes[start..start + count]);
                Ok(count)
            }
            DataSource::File { file, len } => {
                if offset >= *len {
                    return Ok(0);
                }
                file.seek(SeekFrom::Start(offset))?;
                let count = buffer.len().min((*len - offset) as usize);
                file.read_exact(&mut buffer[..count]).map_err(Error::Io)?;
                Ok(count)
            }
        }
    }

    /// Read the whole payload
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.len() as usize];
        let read = self.pread(&mut data, 0)?;
        data.truncate(read);
        Ok(data)
    }
}
