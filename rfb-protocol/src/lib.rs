//! RFB (Remote Framebuffer) rectangle-stream protocol layer.
//!
//! This crate provides the wire-facing pieces of the cache subsystem:
//! buffered big-endian I/O streams, the rectangle header, the cache-aware
//! rectangle messages, and the batching helper for aggregate messages.
//!
//! # Modules
//!
//! - [`io`] - Buffered input/output streams over tokio async I/O
//! - [`messages`] - Rectangle header and cache rectangle variants
//! - [`batch`] - Bounded batching for aggregate messages

pub mod batch;
pub mod io;
pub mod messages;

pub use io::{RfbInStream, RfbOutStream};
pub use messages::Rectangle;
