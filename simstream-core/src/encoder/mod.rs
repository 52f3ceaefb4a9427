//! Per-frame JPEG encoder.
//!
//! An encoder is constructed for one exact surface geometry and never
//! reconfigures itself; the pipeline replaces it when dimensions
//! change. On macOS a hardware compression session is tried first and
//! any per-frame timeout or codec failure falls through to the CPU
//! path for that frame. Elsewhere (and under the test hook) only the
//! CPU path exists, so the full stream pipeline runs on any host.

#[cfg(target_os = "macos")]
mod videotoolbox;

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::debug;
#[cfg(target_os = "macos")]
use tracing::{info, warn};

use crate::error::ServerError;
use crate::frame::PixelFormat;
use crate::surface::DisplaySurface;

/// Frames between diagnostic counter log lines.
const COUNTER_LOG_INTERVAL: u64 = 60;

// ── Counters ─────────────────────────────────────────────────────

/// Running totals for diagnostic logging. The encoder has a single
/// caller, so plain fields suffice.
#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    frames_in: u64,
    hardware_ok: u64,
    software_fallback: u64,
    bytes_out: u64,
}

// ── FrameEncoder ─────────────────────────────────────────────────

/// JPEG encoder sized to one surface geometry.
pub struct FrameEncoder {
    width: u32,
    height: u32,
    quality: f32,
    #[cfg(target_os = "macos")]
    hardware: Option<videotoolbox::Session>,
    counters: Counters,
}

impl FrameEncoder {
    /// Construct an encoder, preferring the hardware session where the
    /// platform has one. A session that cannot be created is logged
    /// and the encoder runs on the CPU path permanently.
    pub fn new(width: u32, height: u32, quality: f32) -> Self {
        #[cfg(target_os = "macos")]
        {
            let hardware = match videotoolbox::Session::new(width, height, quality) {
                Ok(session) => {
                    info!("hardware JPEG session ready ({width}x{height}, q={quality})");
                    Some(session)
                }
                Err(e) => {
                    warn!("hardware JPEG session unavailable ({e}); using software path");
                    None
                }
            };
            Self {
                width,
                height,
                quality,
                hardware,
                counters: Counters::default(),
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            debug!("no hardware codec on this platform; using software path");
            Self {
                width,
                height,
                quality,
                counters: Counters::default(),
            }
        }
    }

    /// Construct an encoder that never touches the hardware session.
    /// Used by tests and by callers that want deterministic output.
    pub fn software_only(width: u32, height: u32, quality: f32) -> Self {
        Self {
            width,
            height,
            quality,
            #[cfg(target_os = "macos")]
            hardware: None,
            counters: Counters::default(),
        }
    }

    /// Width this encoder was sized for.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height this encoder was sized for.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Whether the hardware session is live.
    pub fn has_hardware(&self) -> bool {
        #[cfg(target_os = "macos")]
        {
            self.hardware.is_some()
        }
        #[cfg(not(target_os = "macos"))]
        {
            false
        }
    }

    /// Compress one surface to bare JPEG bytes.
    ///
    /// The surface must match the construction geometry exactly; the
    /// pipeline owns geometry-change detection.
    pub fn encode(&mut self, surface: &DisplaySurface) -> Result<Vec<u8>, ServerError> {
        if surface.width() != self.width || surface.height() != self.height {
            return Err(ServerError::EncodeFailure(format!(
                "surface {}x{} does not match encoder {}x{}",
                surface.width(),
                surface.height(),
                self.width,
                self.height
            )));
        }

        self.counters.frames_in += 1;

        #[cfg(target_os = "macos")]
        if let Some(session) = &mut self.hardware {
            match session.encode(surface) {
                Ok(bytes) => {
                    self.counters.hardware_ok += 1;
                    self.counters.bytes_out += bytes.len() as u64;
                    self.maybe_log_counters();
                    return Ok(bytes);
                }
                Err(e) => {
                    warn!("hardware encode failed ({e}); falling back to software");
                }
            }
        }

        let bytes = self.encode_software(surface)?;
        self.counters.software_fallback += 1;
        self.counters.bytes_out += bytes.len() as u64;
        self.maybe_log_counters();
        Ok(bytes)
    }

    /// CPU path: lock the surface, pack rows tightly, JPEG-encode.
    fn encode_software(&self, surface: &DisplaySurface) -> Result<Vec<u8>, ServerError> {
        let guard = surface.lock_readonly()?;

        let bpp = surface.format().bytes_per_pixel();
        let stride = surface.stride() as usize;
        let width = self.width as usize;
        let height = self.height as usize;

        // BGRA (possibly padded rows) to tight RGB.
        let mut rgb = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            let row = &guard[y * stride..y * stride + width * bpp];
            for px in row.chunks_exact(bpp) {
                match surface.format() {
                    PixelFormat::Bgra8 => rgb.extend_from_slice(&[px[2], px[1], px[0]]),
                    PixelFormat::Rgba8 => rgb.extend_from_slice(&[px[0], px[1], px[2]]),
                }
            }
        }
        drop(guard);

        let mut out = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut out, jpeg_quality(self.quality))
            .encode(&rgb, self.width, self.height, ExtendedColorType::Rgb8)
            .map_err(|e| ServerError::EncodeFailure(e.to_string()))?;
        Ok(out.into_inner())
    }

    fn maybe_log_counters(&self) {
        if self.counters.frames_in % COUNTER_LOG_INTERVAL == 0 {
            let c = self.counters;
            debug!(
                "encoder {}x{}: {} in, {} hw, {} sw, {} bytes out",
                self.width, self.height, c.frames_in, c.hardware_ok, c.software_fallback, c.bytes_out
            );
        }
    }
}

/// Map the 0.1..=1.0 session quality onto the JPEG encoder's 1..=100.
fn jpeg_quality(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_surface(width: u32, height: u32, bgra: [u8; 4]) -> DisplaySurface {
        let data: Vec<u8> = bgra
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        DisplaySurface::from_bgra(width, height, data)
    }

    #[test]
    fn software_output_is_jpeg() {
        let mut enc = FrameEncoder::software_only(32, 24, 0.7);
        let surface = solid_surface(32, 24, [0x20, 0x40, 0x80, 0xFF]);
        let bytes = enc.encode(&surface).unwrap();

        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "missing SOI");
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9], "missing EOI");
    }

    #[test]
    fn geometry_mismatch_rejected() {
        let mut enc = FrameEncoder::software_only(32, 24, 0.7);
        let surface = solid_surface(16, 16, [0, 0, 0, 0xFF]);
        assert!(matches!(
            enc.encode(&surface),
            Err(ServerError::EncodeFailure(_))
        ));
    }

    #[test]
    fn quality_changes_output_size() {
        let noisy: Vec<u8> = (0..64u32 * 64 * 4)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let surface = DisplaySurface::from_bgra(64, 64, noisy);

        let low = FrameEncoder::software_only(64, 64, 0.1)
            .encode(&surface)
            .unwrap();
        let high = FrameEncoder::software_only(64, 64, 1.0)
            .encode(&surface)
            .unwrap();
        assert!(high.len() > low.len());
    }

    #[test]
    fn quality_mapping() {
        assert_eq!(jpeg_quality(0.1), 10);
        assert_eq!(jpeg_quality(0.7), 70);
        assert_eq!(jpeg_quality(1.0), 100);
    }

    #[test]
    fn software_only_reports_no_hardware() {
        let enc = FrameEncoder::software_only(8, 8, 0.5);
        assert!(!enc.has_hardware());
        assert_eq!(enc.width(), 8);
        assert_eq!(enc.height(), 8);
    }
}
