//! The `fps_report` stdout payload.
//!
//! Emitted at ~1 Hz while reporting is enabled. The line format is
//! part of the machine contract: `fps_report ` followed by one JSON
//! object with integer `frame_count` and `encoded_frames`, `fps` to
//! one decimal and `elapsed` seconds to two decimals.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct FpsReport {
    /// Surfaces received from the bridge since startup.
    pub frame_count: u64,
    /// Frames encoded and submitted since startup.
    pub encoded_frames: u64,
    /// Encode rate over the last reporting window.
    pub fps: f64,
    /// Seconds since the stream came up.
    pub elapsed: f64,
}

impl FpsReport {
    /// Build a report, rounding the floats to their contract widths.
    pub fn new(frame_count: u64, encoded_frames: u64, fps: f64, elapsed: f64) -> Self {
        Self {
            frame_count,
            encoded_frames,
            fps: (fps * 10.0).round() / 10.0,
            elapsed: (elapsed * 100.0).round() / 100.0,
        }
    }

    /// The complete stdout line, without trailing newline.
    pub fn to_line(&self) -> String {
        let json = serde_json::to_string(self).expect("report serialization cannot fail");
        format!("fps_report {json}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_contract_widths() {
        let r = FpsReport::new(100, 98, 59.9468, 2.0071);
        assert_eq!(r.fps, 59.9);
        assert_eq!(r.elapsed, 2.01);
    }

    #[test]
    fn line_shape() {
        let line = FpsReport::new(10, 9, 60.0, 1.0).to_line();
        assert!(line.starts_with("fps_report {"));

        let json: serde_json::Value =
            serde_json::from_str(line.strip_prefix("fps_report ").unwrap()).unwrap();
        assert_eq!(json["frame_count"], 10);
        assert_eq!(json["encoded_frames"], 9);
        assert!(json["fps"].is_f64());
        assert!(json["elapsed"].is_f64());
    }
}
