//! Fixed-size chunking of an async byte stream into leaf payloads

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default leaf size: 64 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Splits a reader into chunks of exactly `chunk_size` bytes, except the
/// last one which holds whatever remains.
pub struct Chunker<R> {
    reader: R,
    chunk_size: usize,
    bytes_read: u64,
    finished: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be greater than 0");
        Self {
            reader,
            chunk_size,
            bytes_read: 0,
            finished: false,
        }
    }

    /// Next chunk, or `None` once the reader is exhausted.
    ///
    /// A short read from the underlying reader does not end a chunk; only
    /// EOF does.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        let mut chunk = Vec::with_capacity(self.chunk_size);
        let read = (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut chunk)
            .await?;

        self.bytes_read += read as u64;
        if read < self.chunk_size {
            self.finished = true;
        }

        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }
}

impl<R> Chunker<R> {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total bytes consumed from the reader so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}
