//! Content hashing seam.
//!
//! The cache subsystem consumes hashes, it does not produce them: the actual
//! digest over canonicalised pixel rows is supplied by a collaborator behind
//! the [`RectHasher`] trait. What this module pins down is the shape of the
//! result: a 16-byte digest whose first 8 bytes form the compact cache id
//! used on the wire by both cache flavours.

use rfb_common::Rect;
use rfb_pixelbuffer::PixelBuffer;

/// An opaque 16-byte digest of a rectangle's pixel content.
///
/// Same rectangle geometry plus same pixel content always yields the same
/// hash; collisions are assumed cryptographically negligible. The all-zero
/// digest is degenerate and never refers to cached content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// Wrap a raw 16-byte digest.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The compact 64-bit cache id: the first 8 digest bytes, big-endian.
    pub fn cache_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(id)
    }

    /// True for the all-zero digest (and therefore a zero cache id).
    pub fn is_degenerate(&self) -> bool {
        self.0 == [0u8; 16] || self.cache_id() == 0
    }
}

/// Computes content hashes over framebuffer rectangles.
///
/// Implementations canonicalise the pixel rows of `rect` (stride removed,
/// native byte order) and digest them. Returns `None` when the rectangle
/// cannot be read from the buffer; the caller treats that as NotCacheable.
pub trait RectHasher {
    fn hash_rect(&self, rect: Rect, pb: &dyn PixelBuffer) -> Option<ContentHash>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_id_is_first_eight_bytes() {
        let hash = ContentHash::from_bytes([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
            0xFF, 0x00, 0x11,
        ]);
        assert_eq!(hash.cache_id(), 0x0102030405060708);
    }

    #[test]
    fn test_degenerate_hashes() {
        assert!(ContentHash::from_bytes([0u8; 16]).is_degenerate());

        // A zero id is degenerate even with trailing entropy.
        let mut bytes = [0u8; 16];
        bytes[12] = 0x7F;
        assert!(ContentHash::from_bytes(bytes).is_degenerate());

        let mut ok = [0u8; 16];
        ok[0] = 1;
        assert!(!ContentHash::from_bytes(ok).is_degenerate());
    }
}
