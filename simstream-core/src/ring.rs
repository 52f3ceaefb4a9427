//! Bounded frame ring shared between the encoder side and clients.
//!
//! A fixed-capacity FIFO of encoded frames with overwrite-oldest
//! semantics. One writer (the surface-dispatch task) appends; many
//! readers (client tasks) consume by cursor. Readers that fall behind
//! silently lose evicted frames: liveness over completeness.
//!
//! Every append bumps a monotone `latest` index. A reader holding
//! cursor `c` receives exactly the retained frames with index > `c`,
//! in append order, and its cursor moves to `latest`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::frame::EncodedFrame;

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 5;

/// Concurrently shared ring of encoded frames.
///
/// The single mutex is held only for pointer-sized pushes, pops and
/// `Arc` clones; frame bytes are never copied under the lock.
#[derive(Debug)]
pub struct FrameRing {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    frames: VecDeque<Arc<EncodedFrame>>,
    /// Total frames ever appended; index of the newest retained frame.
    latest: u64,
    /// Frames evicted before any reader saw them, for diagnostics.
    evicted: u64,
}

impl FrameRing {
    /// Create a ring holding at most `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                latest: 0,
                evicted: 0,
            }),
        }
    }

    /// Append a frame, evicting the oldest when full.
    pub fn push(&self, frame: Arc<EncodedFrame>) {
        let mut inner = self.inner.lock().expect("ring lock poisoned");
        if inner.frames.len() == self.capacity {
            inner.frames.pop_front();
            inner.evicted += 1;
        }
        inner.frames.push_back(frame);
        inner.latest += 1;
    }

    /// Index of the newest frame ever appended (0 when empty).
    pub fn latest_index(&self) -> u64 {
        self.inner.lock().expect("ring lock poisoned").latest
    }

    /// Snapshot of everything currently retained, plus the cursor a
    /// reader should continue from. Used for the per-client warm-up.
    pub fn snapshot(&self) -> (Vec<Arc<EncodedFrame>>, u64) {
        let inner = self.inner.lock().expect("ring lock poisoned");
        (inner.frames.iter().cloned().collect(), inner.latest)
    }

    /// Frames appended after `cursor` that are still retained, oldest
    /// first, plus the advanced cursor. Frames the reader missed to
    /// eviction are skipped, never duplicated.
    pub fn since(&self, cursor: u64) -> (Vec<Arc<EncodedFrame>>, u64) {
        let inner = self.inner.lock().expect("ring lock poisoned");
        if cursor >= inner.latest {
            return (Vec::new(), inner.latest);
        }
        let available = (inner.latest - cursor) as usize;
        let take = available.min(inner.frames.len());
        let skip = inner.frames.len() - take;
        (
            inner.frames.iter().skip(skip).cloned().collect(),
            inner.latest,
        )
    }

    /// Number of frames currently retained.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring lock poisoned").frames.len()
    }

    /// Whether nothing has been retained yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames evicted so far.
    pub fn evicted(&self) -> u64 {
        self.inner.lock().expect("ring lock poisoned").evicted
    }
}
