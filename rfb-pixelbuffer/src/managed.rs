//! Heap-backed pixel buffer.

use crate::{PixelBuffer, PixelFormat};
use anyhow::Result;
use rfb_common::Rect;

/// A pixel buffer that owns its storage.
///
/// Used by the server's framebuffer shadow and by tests; rows are stored
/// contiguously so the stride equals the buffer width (in pixels).
#[derive(Debug, Clone)]
pub struct ManagedPixelBuffer {
    format: PixelFormat,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl ManagedPixelBuffer {
    /// Allocate a zero-filled buffer of the given dimensions.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let bpp = format.bytes_per_pixel() as usize;
        let data = vec![0u8; width as usize * height as usize * bpp];
        Self {
            format,
            width,
            height,
            data,
        }
    }

    /// Overwrite the pixels covering `rect` from `pixels`.
    ///
    /// `src_stride` is in pixels.
    pub fn write_rect(&mut self, rect: Rect, pixels: &[u8], src_stride: usize) -> Result<()> {
        let bounds = Rect::new(0, 0, self.width as i32, self.height as i32);
        if rect.is_empty() || !bounds.contains_rect(&rect) {
            anyhow::bail!(
                "rect {:?} outside {}x{} buffer",
                rect,
                self.width,
                self.height
            );
        }
        let bpp = self.format.bytes_per_pixel() as usize;
        let w = rect.width() as usize;
        let h = rect.height() as usize;
        let needed = ((h - 1) * src_stride + w) * bpp;
        if pixels.len() < needed {
            anyhow::bail!("source has {} bytes, rect needs {}", pixels.len(), needed);
        }
        let dst_stride = self.width as usize;
        for row in 0..h {
            let src_off = row * src_stride * bpp;
            let dst_off =
                ((rect.tl.y as usize + row) * dst_stride + rect.tl.x as usize) * bpp;
            self.data[dst_off..dst_off + w * bpp]
                .copy_from_slice(&pixels[src_off..src_off + w * bpp]);
        }
        Ok(())
    }

    /// Fill the whole buffer with a repeating pixel value.
    pub fn fill(&mut self, pixel: &[u8]) {
        let bpp = self.format.bytes_per_pixel() as usize;
        assert_eq!(pixel.len(), bpp);
        for chunk in self.data.chunks_exact_mut(bpp) {
            chunk.copy_from_slice(pixel);
        }
    }
}

impl PixelBuffer for ManagedPixelBuffer {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn pixel_format(&self) -> &PixelFormat {
        &self.format
    }

    fn get_buffer(&self, rect: Rect, stride: &mut usize) -> Option<&[u8]> {
        let bounds = Rect::new(0, 0, self.width as i32, self.height as i32);
        if rect.is_empty() || !bounds.contains_rect(&rect) {
            return None;
        }
        let bpp = self.format.bytes_per_pixel() as usize;
        *stride = self.width as usize;
        let start = (rect.tl.y as usize * self.width as usize + rect.tl.x as usize) * bpp;
        Some(&self.data[start..])
    }
}
