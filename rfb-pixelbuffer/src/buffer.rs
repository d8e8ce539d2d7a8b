//! Pixel buffer access traits.
//!
//! The cache subsystem only ever *reads* framebuffer content: the tile
//! classifier hashes pixel regions, it never renders. [`PixelBuffer`] is the
//! read-only seam between the encoder pipeline and the framebuffer owner.
//!
//! # Critical: Stride is in Pixels, Not Bytes!
//!
//! All stride values in this API are measured in **pixels**, not bytes.
//!
//! To calculate byte offsets:
//! ```text
//! byte_offset = (y * stride + x) * bytes_per_pixel
//! byte_length = height * stride * bytes_per_pixel
//! ```

use crate::PixelFormat;
use rfb_common::Rect;

/// Read-only pixel buffer access.
///
/// Implementations must guarantee that pixel data remains valid and unchanged
/// during read access. Buffers are borrowed by the cache analysis for the
/// duration of one call; the subsystem never retains them.
pub trait PixelBuffer {
    /// Buffer dimensions as (width, height) in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// The pixel format of the stored data.
    fn pixel_format(&self) -> &PixelFormat;

    /// Borrow the pixel data covering `rect`.
    ///
    /// On success, `stride` is set to the row stride **in pixels** and the
    /// returned slice starts at the first pixel of `rect` and spans at least
    /// `(rect.height() - 1) * stride + rect.width()` pixels.
    ///
    /// Returns `None` if `rect` is empty or falls outside the buffer.
    fn get_buffer(&self, rect: Rect, stride: &mut usize) -> Option<&[u8]>;
}
