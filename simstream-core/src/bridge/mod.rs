//! Device bridge: resolves one simulator by UDID and feeds its
//! display surfaces into the pipeline.
//!
//! The bridge prefers the descriptor's surface-change callback,
//! registered under a per-process subscription UUID and delivered on a
//! dedicated serial queue. Hosts whose descriptor lacks the
//! registration entry point fall back to a poller that reads the
//! current surface at the session frame rate. Exactly one mode is
//! active; the choice is logged once at startup.
//!
//! # Platform
//!
//! CoreSimulator only exists on macOS. On other platforms the type is
//! still defined but `start` fails at runtime; tests drive the
//! pipeline through its surface channel directly instead.

#[cfg(target_os = "macos")]
pub(crate) mod sim;

use tokio::sync::mpsc;

use crate::error::ServerError;
use crate::surface::DisplaySurface;

// ── Delivery mode ────────────────────────────────────────────────

/// How surface updates reach the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The descriptor invokes our registered callback on change.
    Callback,
    /// A repeating timer reads the current surface.
    Poller,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Callback => write!(f, "callback"),
            DeliveryMode::Poller => write!(f, "poller"),
        }
    }
}

// ── DeviceBridge ─────────────────────────────────────────────────

/// Owns the resolved device, its display descriptor and the active
/// surface subscription for the life of the process.
#[derive(Debug)]
pub struct DeviceBridge {
    mode: DeliveryMode,
    #[cfg(target_os = "macos")]
    inner: platform::Inner,
}

impl DeviceBridge {
    /// The active delivery mode.
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }
}

// ── macOS implementation ─────────────────────────────────────────

#[cfg(target_os = "macos")]
mod platform {
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use block2::RcBlock;
    use dispatch2::{DispatchQueue, DispatchQueueAttr};
    use tracing::{debug, info, trace, warn};
    use uuid::Uuid;

    use super::{mpsc, sim, DeliveryMode, DeviceBridge, DisplaySurface, ServerError};

    #[derive(Debug)]
    pub struct Inner {
        /// Kept alive for the process lifetime; owns descriptor + HID.
        _device: sim::SimObject,
        descriptor: Arc<sim::DisplayDescriptor>,
        subscription_id: Uuid,
        current: Arc<Mutex<Option<DisplaySurface>>>,
        stop: Arc<AtomicBool>,
        poller: Option<std::thread::JoinHandle<()>>,
    }

    impl DeviceBridge {
        /// Resolve `udid`, select its main display and begin surface
        /// delivery into `surfaces`. All failures here are fatal.
        pub fn start(
            udid: &str,
            fps: u32,
            surfaces: mpsc::Sender<DisplaySurface>,
        ) -> Result<Self, ServerError> {
            sim::load_frameworks()?;
            let device = sim::resolve_device(udid)?;
            let descriptor = Arc::new(sim::main_display(&device, udid)?);
            let subscription_id = Uuid::new_v4();
            let current: Arc<Mutex<Option<DisplaySurface>>> = Arc::new(Mutex::new(None));
            let stop = Arc::new(AtomicBool::new(false));

            // Prime the slot so `current()` works before the first
            // change notification.
            *current.lock().expect("current slot poisoned") = descriptor.current_surface();

            let queue = DispatchQueue::new("simstream.surface-dispatch", DispatchQueueAttr::SERIAL);
            let deliver = {
                let current = Arc::clone(&current);
                move |surface: DisplaySurface| {
                    *current.lock().expect("current slot poisoned") = Some(surface.clone());
                    // A full channel means the pipeline is still
                    // encoding; dropping the update is the ring
                    // semantics one level earlier.
                    if let Err(mpsc::error::TrySendError::Closed(_)) = surfaces.try_send(surface) {
                        trace!("surface channel closed");
                    }
                }
            };

            let callback_registered = {
                let descriptor = Arc::clone(&descriptor);
                let deliver = deliver.clone();
                let block = RcBlock::new(move |raw: *mut c_void| {
                    // Retain before hopping queues; raw pointers are
                    // only valid inside the notification.
                    let surface = DisplaySurface::from_iosurface(raw)
                        .or_else(|| descriptor.current_surface());
                    let Some(surface) = surface else {
                        debug!("surface notification carried no surface; ignored");
                        return;
                    };
                    let deliver = deliver.clone();
                    queue.exec_async(move || deliver(surface));
                });
                descriptor.register_callback(&subscription_id, block)
            };

            let (mode, poller) = if callback_registered {
                (DeliveryMode::Callback, None)
            } else {
                let handle = spawn_poller(
                    Arc::clone(&descriptor),
                    deliver,
                    Arc::clone(&stop),
                    fps,
                );
                (DeliveryMode::Poller, Some(handle))
            };
            info!("surface delivery mode: {mode}");

            Ok(DeviceBridge {
                mode,
                inner: Inner {
                    _device: device,
                    descriptor,
                    subscription_id,
                    current,
                    stop,
                    poller,
                },
            })
        }

        /// Most recently observed surface, if any.
        pub fn current(&self) -> Option<DisplaySurface> {
            self.inner
                .current
                .lock()
                .expect("current slot poisoned")
                .clone()
        }

        /// Unregister the subscription and cancel the poller.
        /// Synchronous; safe to call more than once.
        pub fn stop(&mut self) {
            self.inner.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = self.inner.poller.take() {
                let _ = handle.join();
            }
            self.inner
                .descriptor
                .unregister_callback(&self.inner.subscription_id);
            debug!("bridge stopped");
        }
    }

    fn spawn_poller(
        descriptor: Arc<sim::DisplayDescriptor>,
        deliver: impl Fn(DisplaySurface) + Send + 'static,
        stop: Arc<AtomicBool>,
        fps: u32,
    ) -> std::thread::JoinHandle<()> {
        let period = Duration::from_millis((1000 / fps.max(1)).max(1) as u64);
        std::thread::Builder::new()
            .name("surface-poller".into())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match descriptor.current_surface() {
                        Some(surface) => deliver(surface),
                        None => warn!("descriptor returned a nil surface; skipping tick"),
                    }
                    std::thread::sleep(period);
                }
            })
            .expect("failed to spawn surface poller")
    }

    impl Drop for DeviceBridge {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

// ── Non-macOS stub ───────────────────────────────────────────────

#[cfg(not(target_os = "macos"))]
impl DeviceBridge {
    /// CoreSimulator only exists on macOS.
    pub fn start(
        _udid: &str,
        _fps: u32,
        _surfaces: mpsc::Sender<DisplaySurface>,
    ) -> Result<Self, ServerError> {
        Err(ServerError::FrameworkMissing(
            "CoreSimulator bridge is only available on macOS".into(),
        ))
    }

    pub fn current(&self) -> Option<DisplaySurface> {
        None
    }

    pub fn stop(&mut self) {}
}
