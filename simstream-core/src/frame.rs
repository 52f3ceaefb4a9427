//! Shared frame types for the capture/encode pipeline.
//!
//! These are internal representations passed between pipeline stages.
//! [`EncodedFrame`] is what the MJPEG server frames onto the wire.

use std::time::SystemTime;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of a captured display surface.
///
/// Simulator framebuffers are delivered as premultiplied BGRA; other
/// layouts are listed for completeness of the conversion code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (premultiplied).
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
        }
    }
}

// ── EncodedFrame ─────────────────────────────────────────────────

/// One complete JPEG image, container-free, plus the wall-clock time
/// at which it was produced. Immutable after creation.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// JPEG bytes, starting with SOI (`FF D8`) and ending with EOI
    /// (`FF D9`).
    pub data: Vec<u8>,
    /// Wall-clock production time.
    pub timestamp: SystemTime,
    /// Source frame width in pixels.
    pub width: u32,
    /// Source frame height in pixels.
    pub height: u32,
}

impl EncodedFrame {
    /// Wrap freshly encoded JPEG bytes, stamping the current time.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            timestamp: SystemTime::now(),
            width,
            height,
        }
    }

    /// Byte size of the JPEG payload.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty (never true for a real frame).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
