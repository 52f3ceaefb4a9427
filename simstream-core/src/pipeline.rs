//! Surface-dispatch pipeline: the single consumer of captured
//! surfaces.
//!
//! One task owns the encoder slot and is the only submitter to the
//! frame ring, so frames reach clients in capture order. Geometry
//! changes are detected here, between frames: the old encoder is
//! dropped and a fresh one is built for the new dimensions before the
//! next frame is compressed. The encoder itself never reconfigures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::encoder::FrameEncoder;
use crate::frame::EncodedFrame;
use crate::server::MjpegServer;
use crate::surface::DisplaySurface;

/// Depth of the surface channel between the bridge and the pipeline.
/// The ring behind the server is the real elasticity; this only
/// absorbs scheduling jitter.
pub const SURFACE_CHANNEL_DEPTH: usize = 4;

// ── Stats ────────────────────────────────────────────────────────

/// Counters shared with the FPS reporter.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Surfaces received from the bridge.
    pub frames_in: AtomicU64,
    /// Frames successfully encoded and submitted.
    pub encoded: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(frames_in, encoded)` at this instant.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.frames_in.load(Ordering::Relaxed),
            self.encoded.load(Ordering::Relaxed),
        )
    }
}

// ── Pipeline loop ────────────────────────────────────────────────

/// Consume surfaces until the channel closes.
///
/// `hardware_enabled` is the test hook from the encoder contract:
/// `false` forces the CPU path for every frame.
pub async fn run_pipeline(
    mut surfaces: mpsc::Receiver<DisplaySurface>,
    server: Arc<MjpegServer>,
    quality: f32,
    stats: Arc<PipelineStats>,
    hardware_enabled: bool,
) {
    let mut encoder: Option<FrameEncoder> = None;

    while let Some(surface) = surfaces.recv().await {
        stats.frames_in.fetch_add(1, Ordering::Relaxed);

        let (width, height) = (surface.width(), surface.height());
        if width == 0 || height == 0 {
            warn!("ignoring degenerate surface {width}x{height}");
            continue;
        }

        let stale = encoder
            .as_ref()
            .map_or(true, |e| e.width() != width || e.height() != height);
        if stale {
            if encoder.is_some() {
                info!("display geometry changed to {width}x{height}; rebuilding encoder");
            }
            encoder = Some(if hardware_enabled {
                FrameEncoder::new(width, height, quality)
            } else {
                FrameEncoder::software_only(width, height, quality)
            });
        }

        let encoder = encoder.as_mut().expect("encoder built above");
        match encoder.encode(&surface) {
            Ok(bytes) => {
                stats.encoded.fetch_add(1, Ordering::Relaxed);
                server.submit(EncodedFrame::new(bytes, width, height));
            }
            Err(e) => warn!("frame encode failed: {e}"),
        }
    }

    debug!("surface channel closed; pipeline exiting");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::FrameRing;

    fn surface(width: u32, height: u32) -> DisplaySurface {
        DisplaySurface::from_bgra(width, height, vec![0x7F; (width * height * 4) as usize])
    }

    async fn pipeline_fixture() -> (
        mpsc::Sender<DisplaySurface>,
        Arc<MjpegServer>,
        Arc<FrameRing>,
        Arc<PipelineStats>,
        tokio::task::JoinHandle<()>,
    ) {
        let ring = Arc::new(FrameRing::new(5));
        let server = Arc::new(MjpegServer::start(0, Arc::clone(&ring)).await.unwrap());
        let stats = PipelineStats::new();
        let (tx, rx) = mpsc::channel(SURFACE_CHANNEL_DEPTH);
        let handle = tokio::spawn(run_pipeline(
            rx,
            Arc::clone(&server),
            0.7,
            Arc::clone(&stats),
            false,
        ));
        (tx, server, ring, stats, handle)
    }

    #[tokio::test]
    async fn surfaces_become_ring_frames() {
        let (tx, server, ring, stats, handle) = pipeline_fixture().await;

        for _ in 0..3 {
            tx.send(surface(16, 16)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(ring.latest_index(), 3);
        let (frames, _) = ring.snapshot();
        for f in &frames {
            assert_eq!(&f.data[..2], &[0xFF, 0xD8]);
            assert_eq!(f.width, 16);
        }
        assert_eq!(stats.snapshot(), (3, 3));
        server.stop();
    }

    #[tokio::test]
    async fn geometry_change_rebuilds_and_tags_dimensions() {
        let (tx, server, ring, _stats, handle) = pipeline_fixture().await;

        tx.send(surface(16, 16)).await.unwrap();
        tx.send(surface(32, 8)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let (frames, _) = ring.snapshot();
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].width, frames[0].height), (16, 16));
        assert_eq!((frames[1].width, frames[1].height), (32, 8));
        server.stop();
    }

    #[tokio::test]
    async fn degenerate_surfaces_are_skipped() {
        let (tx, server, ring, stats, handle) = pipeline_fixture().await;

        tx.send(DisplaySurface::from_bgra(0, 0, Vec::new()))
            .await
            .unwrap();
        tx.send(surface(8, 8)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(ring.latest_index(), 1);
        assert_eq!(stats.snapshot(), (2, 1));
        server.stop();
    }
}
