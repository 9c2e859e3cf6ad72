//! Random-access byte sources.
//!
//! The engine addresses a recording purely through [`ByteSource::read`],
//! so files, in-memory buffers and HTTP range-capable servers are
//! interchangeable. Reads must be cheap to issue; the engine performs
//! hundreds of small aligned reads during a sweep.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{ReadError, Result};

#[async_trait]
pub trait ByteSource: Send {
    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// Returning fewer bytes than requested is an error
    /// ([`ReadError::ShortRead`]); partial data never reaches the decoder.
    async fn read(&mut self, offset: u64, len: usize) -> Result<Bytes>;

    /// Total size in bytes, when the source knows it.
    fn len(&self) -> Option<u64>;
}

/// Local file source.
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self { file, size })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(ReadError::ShortRead {
                    expected: len,
                    got: filled,
                });
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }

    fn len(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// In-memory source over an owned byte buffer.
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(ReadError::ShortRead {
                expected: len,
                got: self.data.len().saturating_sub(start),
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// HTTP source issuing `Range` requests against a single URL.
///
/// One shared client is reused across reads. Servers replying `200 OK`
/// with the whole body are tolerated by slicing the requested window out
/// of the response.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
    size: Option<u64>,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            size: None,
        }
    }

    /// Probes the resource size with a `HEAD` request. Optional; sources
    /// without a known size still serve range reads.
    pub async fn probe_size(&mut self) -> Result<Option<u64>> {
        let resp = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| ReadError::Http(e.to_string()))?;
        self.size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Ok(self.size)
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn read(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);
        let resp = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, range)
            .send()
            .await
            .map_err(|e| ReadError::Http(e.to_string()))?;

        let status = resp.status();
        let whole_body = match status.as_u16() {
            206 => false,
            200 => true,
            _ => return Err(ReadError::Http(format!("{} for {}", status, self.url))),
        };

        let body = resp
            .bytes()
            .await
            .map_err(|e| ReadError::Http(e.to_string()))?;

        let window = if whole_body {
            let start = offset as usize;
            if body.len() < start + len {
                return Err(ReadError::ShortRead {
                    expected: len,
                    got: body.len().saturating_sub(start),
                });
            }
            body.slice(start..start + len)
        } else {
            if body.len() < len {
                return Err(ReadError::ShortRead {
                    expected: len,
                    got: body.len(),
                });
            }
            body.slice(..len)
        };
        Ok(window)
    }

    fn len(&self) -> Option<u64> {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_reads_exact_window() {
        let mut src = MemorySource::new(vec![0u8, 1, 2, 3, 4, 5, 6, 7]);
        let got = src.read(2, 3).await.unwrap();
        assert_eq!(&got[..], &[2, 3, 4]);
        assert_eq!(src.len(), Some(8));
    }

    #[tokio::test]
    async fn test_memory_source_short_read() {
        let mut src = MemorySource::new(vec![0u8; 4]);
        let err = src.read(2, 10).await.unwrap_err();
        assert!(matches!(
            err,
            ReadError::ShortRead {
                expected: 10,
                got: 2
            }
        ));
    }
}
