//! Core RFB rectangle-stream types.
//!
//! This module defines the rectangle header shared by every framebuffer
//! update and the encoding-code constants, including the four cache-aware
//! rectangle encodings and the pseudo-encodings used to negotiate them.

use crate::io::{RfbInStream, RfbOutStream};
use tokio::io::{AsyncRead, AsyncWrite};

/// Rectangle header for framebuffer updates.
///
/// Describes a rectangular region of the screen along with the encoding
/// type used for its pixel data.
///
/// # Wire Format
///
/// Rectangle header is 12 bytes:
/// - 2 bytes: x position
/// - 2 bytes: y position
/// - 2 bytes: width
/// - 2 bytes: height
/// - 4 bytes: encoding type (signed i32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

impl Rectangle {
    /// Read a Rectangle header from an RFB input stream.
    ///
    /// **Note**: This only reads the 12-byte header. The encoding-specific
    /// payload that follows must be handled separately.
    pub async fn read_from<R: AsyncRead + Unpin>(
        stream: &mut RfbInStream<R>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            x: stream.read_u16().await?,
            y: stream.read_u16().await?,
            width: stream.read_u16().await?,
            height: stream.read_u16().await?,
            encoding: stream.read_i32().await?,
        })
    }

    /// Write a Rectangle header to an RFB output stream.
    pub fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut RfbOutStream<W>) {
        stream.write_u16(self.x);
        stream.write_u16(self.y);
        stream.write_u16(self.width);
        stream.write_u16(self.height);
        stream.write_i32(self.encoding);
    }
}

/// Byte size of the rectangle header on the wire.
pub const RECT_HEADER_BYTES: u64 = 12;

//
// Standard encoding type constants
//

/// Raw encoding - uncompressed pixel data.
pub const ENCODING_RAW: i32 = 0;

/// CopyRect encoding - copy from another screen region.
pub const ENCODING_COPYRECT: i32 = 1;

/// RRE (Rise-and-Run-length Encoding).
pub const ENCODING_RRE: i32 = 2;

/// Hextile encoding - 16x16 tile-based compression.
pub const ENCODING_HEXTILE: i32 = 5;

/// Tight encoding - JPEG and zlib compression.
pub const ENCODING_TIGHT: i32 = 7;

/// ZRLE (Zlib Run-Length Encoding).
pub const ENCODING_ZRLE: i32 = 16;

//
// Cache encoding types
//

/// CachedRect encoding: reference to session-cached content (cache_id only).
pub const ENCODING_CACHED_RECT: i32 = 100;

/// CachedRectInit encoding: initial transmission with cache id, inner
/// encoding and payload.
pub const ENCODING_CACHED_RECT_INIT: i32 = 101;

/// PersistentCachedRect encoding: reference into the persistent cache.
pub const ENCODING_PERSISTENT_CACHED_RECT: i32 = 102;

/// PersistentCachedRectInit encoding: persistent-cache initial transmission.
pub const ENCODING_PERSISTENT_CACHED_RECT_INIT: i32 = 103;

/// True for any of the four cache-aware rectangle encodings.
pub const fn is_cache_encoding(encoding: i32) -> bool {
    matches!(
        encoding,
        ENCODING_CACHED_RECT
            | ENCODING_CACHED_RECT_INIT
            | ENCODING_PERSISTENT_CACHED_RECT
            | ENCODING_PERSISTENT_CACHED_RECT_INIT
    )
}

//
// Pseudo-encodings (for capability negotiation)
//

/// Pseudo-encoding advertising session (ContentCache) support.
pub const PSEUDO_ENCODING_CONTENT_CACHE: i32 = -496; // 0xFFFFFE10

/// Pseudo-encoding advertising persistent cache support.
pub const PSEUDO_ENCODING_PERSISTENT_CACHE: i32 = -495; // 0xFFFFFE11
