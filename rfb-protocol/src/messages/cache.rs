//! Cache-aware rectangle message types.
//!
//! Both cache flavours substitute short reference messages for re-encoded
//! pixels once server and client agree on content:
//!
//! 1. **First time content appears**: the server sends an init rectangle
//!    ([`CachedRectInit`] / [`PersistentCachedRectInit`]) carrying the cache
//!    id, the inner encoding, and the encoded payload.
//! 2. **Content repeats**: the server sends a reference rectangle
//!    ([`CachedRect`] / [`PersistentCachedRect`]) carrying only the cache id -
//!    20 bytes on the wire including the rectangle header.
//!
//! The session and persistent protocols share the 64-bit id space on the
//! wire (the first 8 bytes of the 16-byte content hash); they differ only in
//! server-side lifetime semantics. This collapses two earlier divergent
//! framings into a single implementation.

use crate::io::{RfbInStream, RfbOutStream};
use crate::messages::types::is_cache_encoding;
use tokio::io::{AsyncRead, AsyncWrite};

/// Total wire bytes of a reference rectangle (12-byte header + 8-byte id).
pub const CACHE_REF_WIRE_BYTES: u64 = 20;

/// Wire overhead of an init rectangle before its payload
/// (12-byte header + 8-byte id + 4-byte inner encoding).
pub const CACHE_INIT_OVERHEAD_BYTES: u64 = 24;

fn read_cache_id_err() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "cache_id must be non-zero",
    )
}

async fn read_cache_id<R: AsyncRead + Unpin>(
    stream: &mut RfbInStream<R>,
) -> std::io::Result<u64> {
    let cache_id = stream.read_u64().await?;
    if cache_id == 0 {
        return Err(read_cache_id_err());
    }
    Ok(cache_id)
}

async fn read_inner_encoding<R: AsyncRead + Unpin>(
    stream: &mut RfbInStream<R>,
) -> std::io::Result<i32> {
    let encoding = stream.read_i32().await?;
    if is_cache_encoding(encoding) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("inner encoding cannot be a cache encoding, got {}", encoding),
        ));
    }
    Ok(encoding)
}

/// CachedRect - reference to session-cached content.
///
/// The server sends this when it believes the client already holds the
/// pixel data under this id. Only 8 bytes follow the rectangle header.
///
/// # Wire Format (after 12-byte Rectangle header)
///
/// - 8 bytes: cache_id (u64, big-endian, non-zero)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRect {
    /// Unique identifier for cached content, derived from the content hash.
    /// Must be non-zero (0 is reserved for errors).
    pub cache_id: u64,
}

impl CachedRect {
    /// Create a new CachedRect with the given cache ID.
    pub fn new(cache_id: u64) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        Self { cache_id }
    }

    /// Read the 8-byte body from an RFB input stream.
    ///
    /// The 12-byte rectangle header must be read separately.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            cache_id: read_cache_id(stream).await?,
        })
    }

    /// Write the 8-byte body to an RFB output stream.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.cache_id == 0 {
            return Err(read_cache_id_err());
        }
        stream.write_u64(self.cache_id);
        Ok(())
    }
}

/// CachedRectInit - initial transmission with cache id and encoded pixels.
///
/// Sent when content appears for the first time (or after a client-side
/// cache miss). The encoded payload follows and is read by the decoder
/// selected by `inner_encoding`.
///
/// # Wire Format (after 12-byte Rectangle header)
///
/// - 8 bytes: cache_id (u64, big-endian, non-zero)
/// - 4 bytes: inner_encoding (i32, big-endian; never a cache encoding)
/// - N bytes: encoded pixel data (owned by the inner decoder)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRectInit {
    /// Identifier the client stores the decoded pixels under.
    pub cache_id: u64,

    /// Encoding of the payload that follows. Must not itself be a cache
    /// encoding (no recursive caching).
    pub inner_encoding: i32,
}

impl CachedRectInit {
    /// Create a new CachedRectInit.
    pub fn new(cache_id: u64, inner_encoding: i32) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        debug_assert!(
            !is_cache_encoding(inner_encoding),
            "inner encoding cannot be a cache encoding"
        );
        Self {
            cache_id,
            inner_encoding,
        }
    }

    /// Read the 12-byte body (id + inner encoding) from an RFB input stream.
    ///
    /// The encoded payload must be read separately by the inner decoder.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let cache_id = read_cache_id(stream).await?;
        let inner_encoding = read_inner_encoding(stream).await?;
        Ok(Self {
            cache_id,
            inner_encoding,
        })
    }

    /// Write the 12-byte body to an RFB output stream.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.cache_id == 0 {
            return Err(read_cache_id_err());
        }
        if is_cache_encoding(self.inner_encoding) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "inner encoding cannot be a cache encoding, got {}",
                    self.inner_encoding
                ),
            ));
        }
        stream.write_u64(self.cache_id);
        stream.write_i32(self.inner_encoding);
        Ok(())
    }
}

/// PersistentCachedRect - reference into the persistent (cross-session) cache.
///
/// Identical framing to [`CachedRect`]; the id resolves against the
/// persistent index instead of the session cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentCachedRect {
    /// Unique identifier for cached content. Must be non-zero.
    pub cache_id: u64,
}

impl PersistentCachedRect {
    /// Create a new PersistentCachedRect with the given cache ID.
    pub fn new(cache_id: u64) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        Self { cache_id }
    }

    /// Read the 8-byte body from an RFB input stream.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            cache_id: read_cache_id(stream).await?,
        })
    }

    /// Write the 8-byte body to an RFB output stream.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.cache_id == 0 {
            return Err(read_cache_id_err());
        }
        stream.write_u64(self.cache_id);
        Ok(())
    }
}

/// PersistentCachedRectInit - persistent-cache initial transmission.
///
/// Identical framing to [`CachedRectInit`]; on receipt the client both
/// decodes the payload and seeds its persistent cache under the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentCachedRectInit {
    /// Identifier the client stores the decoded pixels under.
    pub cache_id: u64,

    /// Encoding of the payload that follows; never a cache encoding.
    pub inner_encoding: i32,
}

impl PersistentCachedRectInit {
    /// Create a new PersistentCachedRectInit.
    pub fn new(cache_id: u64, inner_encoding: i32) -> Self {
        debug_assert_ne!(cache_id, 0, "cache id must be non-zero");
        debug_assert!(
            !is_cache_encoding(inner_encoding),
            "inner encoding cannot be a cache encoding"
        );
        Self {
            cache_id,
            inner_encoding,
        }
    }

    /// Read the 12-byte body from an RFB input stream.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        let cache_id = read_cache_id(stream).await?;
        let inner_encoding = read_inner_encoding(stream).await?;
        Ok(Self {
            cache_id,
            inner_encoding,
        })
    }

    /// Write the 12-byte body to an RFB output stream.
    pub fn write_to<W: AsyncWrite + Unpin>(
        &self,
        stream: &mut RfbOutStream<W>,
    ) -> std::io::Result<()> {
        if self.cache_id == 0 {
            return Err(read_cache_id_err());
        }
        if is_cache_encoding(self.inner_encoding) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "inner encoding cannot be a cache encoding, got {}",
                    self.inner_encoding
                ),
            ));
        }
        stream.write_u64(self.cache_id);
        stream.write_i32(self.inner_encoding);
        Ok(())
    }
}
