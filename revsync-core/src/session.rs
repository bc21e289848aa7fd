//! Session tokens
//!
//! A `SessionToken` describes a checked-out revision: the session id, the
//! revision version and the files of every source. It carries data across a
//! process or transport boundary and has no behavior of its own.
//!
//! Wire layout (big-endian, order-preserving):
//!
//! ```text
//! utf    id
//! utf    version
//! i32    source count
//!   utf    source name
//!   i32    file count
//!     utf    file name
//!     i64    file length
//! ```
//!
//! A `utf` string is a u16 byte length followed by that many UTF-8 bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ReplicationError, Result};
use crate::revision::{describe_source_files, Revision, RevisionFile, SourceFiles};

/// Upper bound on preallocation while decoding counts from the wire
const MAX_PREALLOCATE: usize = 1024;

/// Token for a replication session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub id: String,
    pub version: String,
    pub source_files: SourceFiles,
}

impl SessionToken {
    pub fn new(id: impl Into<String>, revision: &dyn Revision) -> Self {
        Self {
            id: id.into(),
            version: revision.version().to_string(),
            source_files: revision.source_files().clone(),
        }
    }

    /// Serialize to a writer
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        write_utf(out, &self.id)?;
        write_utf(out, &self.version)?;
        out.write_all(&encode_count(self.source_files.len())?.to_be_bytes())?;
        for (source, files) in &self.source_files {
            write_utf(out, source)?;
            out.write_all(&encode_count(files.len())?.to_be_bytes())?;
            for file in files {
                write_utf(out, &file.file_name)?;
                out.write_all(&encode_length(file.size)?.to_be_bytes())?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Deserialize from a reader
    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let id = read_utf(input)?;
        let version = read_utf(input)?;
        let source_count = decode_count(read_i32(input)?)?;
        let mut source_files = SourceFiles::new();
        for _ in 0..source_count {
            let source = read_utf(input)?;
            let file_count = decode_count(read_i32(input)?)?;
            let mut files = Vec::with_capacity(file_count.min(MAX_PREALLOCATE));
            for _ in 0..file_count {
                let file_name = read_utf(input)?;
                let size = decode_length(read_i64(input)?)?;
                files.push(RevisionFile { file_name, size });
            }
            source_files.insert(source, files);
        }
        Ok(Self {
            id,
            version,
            source_files,
        })
    }

    /// Serialize into a byte vector
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        Self::read_from(&mut cursor)
    }

    /// Serialize to an async writer, flushing once every field is written
    pub async fn write_to_async<W: AsyncWrite + Unpin>(&self, out: &mut W) -> Result<()> {
        write_utf_async(out, &self.id).await?;
        write_utf_async(out, &self.version).await?;
        out.write_i32(encode_count(self.source_files.len())?).await?;
        for (source, files) in &self.source_files {
            write_utf_async(out, source).await?;
            out.write_i32(encode_count(files.len())?).await?;
            for file in files {
                write_utf_async(out, &file.file_name).await?;
                out.write_i64(encode_length(file.size)?).await?;
            }
        }
        out.flush().await?;
        Ok(())
    }

    /// Deserialize from an async reader
    pub async fn read_from_async<R: AsyncRead + Unpin>(input: &mut R) -> Result<Self> {
        let id = read_utf_async(input).await?;
        let version = read_utf_async(input).await?;
        let source_count = decode_count(input.read_i32().await?)?;
        let mut source_files = SourceFiles::new();
        for _ in 0..source_count {
            let source = read_utf_async(input).await?;
            let file_count = decode_count(input.read_i32().await?)?;
            let mut files = Vec::with_capacity(file_count.min(MAX_PREALLOCATE));
            for _ in 0..file_count {
                let file_name = read_utf_async(input).await?;
                let size = decode_length(input.read_i64().await?)?;
                files.push(RevisionFile { file_name, size });
            }
            source_files.insert(source, files);
        }
        Ok(Self {
            id,
            version,
            source_files,
        })
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} version={} files={}",
            self.id,
            self.version,
            describe_source_files(&self.source_files)
        )
    }
}

fn encode_utf(value: &str) -> Result<u16> {
    u16::try_from(value.len()).map_err(|_| {
        ReplicationError::Codec(format!(
            "string of {} bytes exceeds the 65535 byte limit",
            value.len()
        ))
    })
}

fn decode_utf(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| ReplicationError::Codec(format!("invalid UTF-8: {}", e)))
}

fn encode_count(count: usize) -> Result<i32> {
    i32::try_from(count).map_err(|_| ReplicationError::Codec(format!("count {} too large", count)))
}

fn decode_count(count: i32) -> Result<usize> {
    usize::try_from(count).map_err(|_| ReplicationError::Codec(format!("negative count {}", count)))
}

fn encode_length(length: u64) -> Result<i64> {
    i64::try_from(length)
        .map_err(|_| ReplicationError::Codec(format!("file length {} too large", length)))
}

fn decode_length(length: i64) -> Result<u64> {
    u64::try_from(length)
        .map_err(|_| ReplicationError::Codec(format!("negative file length {}", length)))
}

fn write_utf<W: Write>(out: &mut W, value: &str) -> Result<()> {
    out.write_all(&encode_utf(value)?.to_be_bytes())?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

fn read_utf<R: Read>(input: &mut R) -> Result<String> {
    let mut len = [0u8; 2];
    input.read_exact(&mut len)?;
    let mut bytes = vec![0u8; u16::from_be_bytes(len) as usize];
    input.read_exact(&mut bytes)?;
    decode_utf(bytes)
}

fn read_i32<R: Read>(input: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_i64<R: Read>(input: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

async fn write_utf_async<W: AsyncWrite + Unpin>(out: &mut W, value: &str) -> Result<()> {
    out.write_u16(encode_utf(value)?).await?;
    out.write_all(value.as_bytes()).await?;
    Ok(())
}

async fn read_utf_async<R: AsyncRead + Unpin>(input: &mut R) -> Result<String> {
    let len = input.read_u16().await?;
    let mut bytes = vec![0u8; len as usize];
    input.read_exact(&mut bytes).await?;
    decode_utf(bytes)
}
