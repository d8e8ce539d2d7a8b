//! RFB pixel buffer types and utilities.
//!
//! This crate provides pixel format descriptions and read-only buffer access
//! for the RFB/VNC cache subsystem.

pub mod buffer;
pub mod format;
pub mod managed;

pub use buffer::PixelBuffer;
pub use format::PixelFormat;
pub use managed::ManagedPixelBuffer;
