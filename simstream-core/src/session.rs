//! Session parameters, fixed at startup.
//!
//! One process serves exactly one device. Everything here is clamped
//! into its documented range at construction and never changes while
//! the process runs.

use serde::Serialize;

/// Lowest accepted frame rate.
pub const MIN_FPS: u32 = 1;
/// Highest accepted frame rate.
pub const MAX_FPS: u32 = 120;
/// Lowest accepted JPEG quality.
pub const MIN_QUALITY: f32 = 0.1;
/// Highest accepted JPEG quality.
pub const MAX_QUALITY: f32 = 1.0;

/// Immutable per-process configuration.
#[derive(Debug, Clone, Serialize)]
pub struct SessionParams {
    /// UDID of the simulator this process is bound to.
    pub udid: String,
    /// Target frames per second, clamped to 1..=120.
    pub fps: u32,
    /// JPEG quality, clamped to 0.1..=1.0.
    pub quality: f32,
    /// Requested HTTP port; 0 asks the OS for an ephemeral port.
    pub port: u16,
}

impl SessionParams {
    /// Build parameters from raw CLI values, clamping out-of-range
    /// numbers rather than rejecting them.
    pub fn new(udid: String, fps: Option<u32>, quality: Option<f32>, port: Option<u16>) -> Self {
        Self {
            udid,
            fps: fps.unwrap_or(60).clamp(MIN_FPS, MAX_FPS),
            quality: quality.unwrap_or(0.7).clamp(MIN_QUALITY, MAX_QUALITY),
            port: port.unwrap_or(0),
        }
    }

    /// Interval between frames at the target rate.
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.fps as f64)
    }
}
