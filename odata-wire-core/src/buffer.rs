//! Byte buffering for the batch reader.
//!
//! The reader state machines never touch the underlying stream themselves;
//! they inspect the bytes buffered here and report when they need more. The
//! blocking and async drivers refill the buffer with the helpers below.

use crate::error::{BatchError, Result};
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Bytes requested from the underlying stream per refill.
pub const READ_CHUNK_SIZE: usize = 8000;

/// Grow `buffer` so that `required` bytes fit after the first
/// `bytes_in_buffer` bytes.
///
/// The buffer grows by exactly the missing amount (never more) and existing
/// content is preserved.
pub fn ensure_array_size(buffer: &mut Vec<u8>, bytes_in_buffer: usize, required: usize) {
    let unused = buffer.len().saturating_sub(bytes_in_buffer);
    if required > unused {
        let missing = required - unused;
        buffer.resize(buffer.len() + missing, 0);
    }
}

/// Sliding window over bytes pulled from the batch input.
#[derive(Debug)]
pub(crate) struct BatchBuffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    total_read: u64,
    max_message_size: u64,
}

impl BatchBuffer {
    pub(crate) fn new(max_message_size: u64) -> Self {
        Self {
            data: Vec::new(),
            start: 0,
            end: 0,
            eof: false,
            total_read: 0,
            max_message_size,
        }
    }

    /// Unconsumed bytes.
    pub(crate) fn available(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub(crate) fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.end - self.start);
        self.start += count;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// True once the underlying stream reported end of input.
    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    /// Writable region of at least `min` bytes after the buffered data.
    fn spare(&mut self, min: usize) -> &mut [u8] {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        ensure_array_size(&mut self.data, self.end, min);
        &mut self.data[self.end..]
    }

    /// Record `count` freshly read bytes; zero marks end of input.
    fn commit(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            self.eof = true;
            return Ok(());
        }
        self.end += count;
        self.total_read += count as u64;
        if self.total_read > self.max_message_size {
            return Err(BatchError::MaxMessageSizeExceeded(self.max_message_size));
        }
        Ok(())
    }

    /// Refill from a blocking reader.
    pub(crate) fn fill_from<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        loop {
            match reader.read(self.spare(READ_CHUNK_SIZE)) {
                Ok(count) => return self.commit(count),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Refill from an async reader.
    pub(crate) async fn fill_from_async<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<()> {
        let count = reader.read(self.spare(READ_CHUNK_SIZE)).await?;
        self.commit(count)
    }

    /// Poll-based refill, used by async body streams.
    pub(crate) fn poll_fill_from<R: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut R,
    ) -> Poll<Result<()>> {
        let mut read_buf = ReadBuf::new(self.spare(READ_CHUNK_SIZE));
        ready!(Pin::new(reader).poll_read(cx, &mut read_buf))?;
        let count = read_buf.filled().len();
        Poll::Ready(self.commit(count))
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::new(u64::MAX);
        buffer.data = bytes.to_vec();
        buffer.end = bytes.len();
        buffer.eof = true;
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_array_size_grows_exactly() {
        let mut buffer = vec![1, 2, 3, 0];
        ensure_array_size(&mut buffer, 3, 5);
        assert_eq!(buffer.len(), 8);
        assert_eq!(&buffer[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_ensure_array_size_noop_when_room_left() {
        let mut buffer = vec![0; 16];
        ensure_array_size(&mut buffer, 4, 12);
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn test_fill_consume_cycle() {
        let mut input: &[u8] = b"hello world";
        let mut buffer = BatchBuffer::new(1024);
        buffer.fill_from(&mut input).unwrap();
        assert_eq!(buffer.available(), b"hello world");

        buffer.consume(6);
        assert_eq!(buffer.available(), b"world");

        buffer.fill_from(&mut input).unwrap();
        assert!(buffer.is_eof());
        assert_eq!(buffer.available(), b"world");
    }

    #[test]
    fn test_message_size_quota() {
        let mut input: &[u8] = b"0123456789";
        let mut buffer = BatchBuffer::new(4);
        assert!(matches!(
            buffer.fill_from(&mut input),
            Err(BatchError::MaxMessageSizeExceeded(4))
        ));
    }

    #[tokio::test]
    async fn test_async_fill() {
        let mut input: &[u8] = b"async bytes";
        let mut buffer = BatchBuffer::new(1024);
        buffer.fill_from_async(&mut input).await.unwrap();
        assert_eq!(buffer.available(), b"async bytes");
    }

    #[tokio::test]
    async fn test_async_fill_appends_chunks_until_eof() {
        let mut input = tokio_test::io::Builder::new()
            .read(b"async ")
            .read(b"bytes")
            .build();
        let mut buffer = BatchBuffer::new(1024);

        buffer.fill_from_async(&mut input).await.unwrap();
        assert_eq!(buffer.available(), b"async ");
        buffer.consume(2);

        buffer.fill_from_async(&mut input).await.unwrap();
        assert_eq!(buffer.available(), b"ync bytes");
        assert!(!buffer.is_eof());

        buffer.fill_from_async(&mut input).await.unwrap();
        assert!(buffer.is_eof());
        assert_eq!(buffer.available(), b"ync bytes");
    }
}
