//! Buffered I/O for the cache rectangle stream.
//!
//! Cache-aware rectangles are small, fixed-layout records: a 12-byte
//! rectangle header followed by either an 8-byte cache id or a 12-byte init
//! body and an encoded payload. The streams here are shaped around that
//! traffic. Every fixed-width read funnels through one const-generic field
//! reader backed by a bounded chunked refill, while payload-sized reads and
//! skips bypass the readahead buffer entirely, so the buffer never grows
//! past one chunk no matter how large an init payload is.
//!
//! All multi-byte values are network byte order (big-endian).
//!
//! # Examples
//!
//! ```no_run
//! use rfb_protocol::io::{RfbInStream, RfbOutStream};
//!
//! # async fn example<R, W>(reader: R, writer: W) -> std::io::Result<()>
//! # where R: tokio::io::AsyncRead + Unpin, W: tokio::io::AsyncWrite + Unpin {
//! let mut input = RfbInStream::new(reader);
//! let cache_id = input.read_u64().await?;
//!
//! let mut output = RfbOutStream::new(writer);
//! output.write_u64(cache_id);
//! output.flush().await?;
//! # Ok(())
//! # }
//! ```

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Readahead granted per refill. Cache rectangle fields are at most a dozen
/// bytes, so one chunk covers a long run of back-to-back frames.
const READ_CHUNK: usize = 4096;

/// Initial write buffer size. Reference and init bodies are tens of bytes;
/// the buffer only grows when a payload is staged alongside its header.
const WRITE_BUFFER_CAPACITY: usize = 512;

/// Buffered input stream for reading the cache rectangle stream.
///
/// Fixed-width fields are served from a readahead buffer refilled in
/// [`READ_CHUNK`] steps; bulk payload reads drain the buffer and then go
/// straight to the underlying reader.
pub struct RfbInStream<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> RfbInStream<R> {
    /// Create a new input stream with one chunk of readahead capacity.
    pub fn new(reader: R) -> Self {
        Self::with_capacity(reader, READ_CHUNK)
    }

    /// Create a new input stream with specified readahead capacity.
    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Refill the buffer until `needed` bytes are available.
    ///
    /// Whatever arrives beyond `needed` stays buffered for the following
    /// fields of the same frame.
    async fn refill_to(&mut self, needed: usize) -> std::io::Result<()> {
        while self.buffer.len() < needed {
            let shortfall = needed - self.buffer.len();
            self.buffer.reserve(shortfall.max(READ_CHUNK));
            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "stream ended {} bytes into a {}-byte field",
                        self.buffer.len(),
                        needed
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Read one fixed-width field.
    async fn read_field<const N: usize>(&mut self) -> std::io::Result<[u8; N]> {
        self.refill_to(N).await?;
        let mut field = [0u8; N];
        self.buffer.copy_to_slice(&mut field);
        Ok(field)
    }

    /// Read a single byte (u8).
    pub async fn read_u8(&mut self) -> std::io::Result<u8> {
        Ok(self.read_field::<1>().await?[0])
    }

    /// Read a 16-bit unsigned integer in network byte order.
    pub async fn read_u16(&mut self) -> std::io::Result<u16> {
        Ok(u16::from_be_bytes(self.read_field().await?))
    }

    /// Read a 32-bit unsigned integer in network byte order.
    pub async fn read_u32(&mut self) -> std::io::Result<u32> {
        Ok(u32::from_be_bytes(self.read_field().await?))
    }

    /// Read a 32-bit signed integer in network byte order.
    pub async fn read_i32(&mut self) -> std::io::Result<i32> {
        Ok(i32::from_be_bytes(self.read_field().await?))
    }

    /// Read a 64-bit unsigned integer in network byte order.
    ///
    /// Cache ids travel as u64; both cache protocols use this.
    pub async fn read_u64(&mut self) -> std::io::Result<u64> {
        Ok(u64::from_be_bytes(self.read_field().await?))
    }

    /// Read exactly `buf.len()` bytes into the provided buffer.
    ///
    /// Buffered readahead is drained first; the remainder is read straight
    /// into `buf`, so a payload-sized read never grows the internal buffer.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let buffered = self.buffer.len().min(buf.len());
        if buffered > 0 {
            self.buffer.copy_to_slice(&mut buf[..buffered]);
        }
        if buffered < buf.len() {
            self.reader.read_exact(&mut buf[buffered..]).await?;
        }
        Ok(())
    }

    /// Skip `n` bytes (padding, or a payload no decoder wants).
    ///
    /// Like [`read_bytes`](Self::read_bytes), this consumes the readahead
    /// first and then discards directly from the reader in scratch-sized
    /// steps.
    pub async fn skip(&mut self, n: usize) -> std::io::Result<()> {
        let buffered = n.min(self.buffer.len());
        self.buffer.advance(buffered);

        let mut remaining = n - buffered;
        let mut scratch = [0u8; 512];
        while remaining > 0 {
            let take = remaining.min(scratch.len());
            self.reader.read_exact(&mut scratch[..take]).await?;
            remaining -= take;
        }
        Ok(())
    }

    /// Number of bytes currently readable without performing I/O.
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    /// Get a mutable reference to the underlying reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consume the stream and return the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Buffered output stream for writing the cache rectangle stream.
///
/// Writes are staged in memory and only sent on [`flush()`](Self::flush);
/// dropping the stream without flushing loses staged data.
pub struct RfbOutStream<W> {
    writer: W,
    buffer: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> RfbOutStream<W> {
    /// Create a new output stream sized for typical cache frames.
    pub fn new(writer: W) -> Self {
        Self::with_capacity(writer, WRITE_BUFFER_CAPACITY)
    }

    /// Create a new output stream with specified initial capacity.
    pub fn with_capacity(writer: W, capacity: usize) -> Self {
        Self {
            writer,
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Write a single byte (u8).
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Write a 16-bit unsigned integer in network byte order.
    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a 32-bit unsigned integer in network byte order.
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a 32-bit signed integer in network byte order.
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a 64-bit unsigned integer in network byte order.
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a byte slice.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Send all staged data to the underlying writer and flush it.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            self.writer.write_all(&self.buffer).await?;
            self.buffer.clear();
        }
        self.writer.flush().await
    }

    /// Number of bytes currently staged.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Get a mutable reference to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Consume the stream and return the underlying writer.
    ///
    /// **Warning:** Any staged data is lost. Call [`flush()`](Self::flush)
    /// first if you need it sent.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
