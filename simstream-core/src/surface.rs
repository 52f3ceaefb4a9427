//! Display surface: one framebuffer image.
//!
//! A surface describes width, height, row stride and BGRA pixel data.
//! On macOS the backing is a retained `IOSurfaceRef` owned by the host
//! OS; the bridge's current slot and any encode in flight each hold
//! their own reference, and the last drop releases it. Off macOS (and
//! in tests) the backing is plain owned memory, so the whole pipeline
//! downstream of the bridge runs on any host.

use std::ops::Deref;
use std::sync::Arc;

use crate::error::ServerError;
use crate::frame::PixelFormat;

// ── DisplaySurface ───────────────────────────────────────────────

/// A reference-counted framebuffer image.
///
/// Cloning is cheap: memory backings share an `Arc`, IOSurface
/// backings take another OS-level retain.
#[derive(Debug, Clone)]
pub struct DisplaySurface {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    backing: Backing,
}

#[derive(Debug, Clone)]
enum Backing {
    /// Owned pixel rows, `stride * height` bytes.
    Memory(Arc<Vec<u8>>),
    /// Retained IOSurface owned by the host OS.
    #[cfg(target_os = "macos")]
    Io(iosurface::IoSurface),
}

impl DisplaySurface {
    /// Wrap owned BGRA pixels with a tight stride.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not exactly `width * height * 4` bytes.
    pub fn from_bgra(width: u32, height: u32, data: Vec<u8>) -> Self {
        let stride = width * 4;
        assert_eq!(
            data.len(),
            (stride * height) as usize,
            "BGRA buffer must be width * height * 4 bytes"
        );
        Self {
            width,
            height,
            stride,
            format: PixelFormat::Bgra8,
            backing: Backing::Memory(Arc::new(data)),
        }
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row pitch in bytes. May exceed `width * 4` for GPU alignment.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Pixel layout.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Lock the surface for CPU reads.
    ///
    /// IOSurface backings take the OS read lock; the guard releases it
    /// on every exit path. Memory backings borrow directly.
    pub fn lock_readonly(&self) -> Result<SurfaceReadGuard<'_>, ServerError> {
        match &self.backing {
            Backing::Memory(data) => Ok(SurfaceReadGuard {
                bytes: data.as_slice(),
                #[cfg(target_os = "macos")]
                locked: None,
            }),
            #[cfg(target_os = "macos")]
            Backing::Io(surface) => surface.lock_readonly(self.stride, self.height),
        }
    }

    /// Retain an IOSurface delivered by the host and read its
    /// geometry. Returns `None` for a nil surface.
    #[cfg(target_os = "macos")]
    pub(crate) fn from_iosurface(raw: iosurface::IOSurfaceRef) -> Option<Self> {
        let surface = iosurface::IoSurface::retain(raw)?;
        let (width, height, stride) = surface.geometry();
        Some(Self {
            width,
            height,
            stride,
            format: PixelFormat::Bgra8,
            backing: Backing::Io(surface),
        })
    }

    /// Raw IOSurface handle for the hardware codec, when backed by one.
    #[cfg(target_os = "macos")]
    pub(crate) fn iosurface_ref(&self) -> Option<iosurface::IOSurfaceRef> {
        match &self.backing {
            Backing::Io(surface) => Some(surface.as_ref_ptr()),
            Backing::Memory(_) => None,
        }
    }
}

// ── SurfaceReadGuard ─────────────────────────────────────────────

/// RAII view over a locked surface's bytes (`stride * height` long).
pub struct SurfaceReadGuard<'a> {
    bytes: &'a [u8],
    #[cfg(target_os = "macos")]
    locked: Option<iosurface::IOSurfaceRef>,
}

impl Deref for SurfaceReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

#[cfg(target_os = "macos")]
impl Drop for SurfaceReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(raw) = self.locked {
            unsafe {
                iosurface::IOSurfaceUnlock(raw, iosurface::LOCK_READ_ONLY, std::ptr::null_mut());
            }
        }
    }
}

// ── IOSurface FFI (macOS) ────────────────────────────────────────

#[cfg(target_os = "macos")]
pub(crate) mod iosurface {
    //! Thin retain/release wrapper over the C IOSurface API.

    use std::ffi::c_void;

    use crate::error::ServerError;

    pub type IOSurfaceRef = *mut c_void;

    pub const LOCK_READ_ONLY: u32 = 0x0000_0001;

    #[link(name = "IOSurface", kind = "framework")]
    extern "C" {
        pub fn IOSurfaceGetWidth(surface: IOSurfaceRef) -> usize;
        pub fn IOSurfaceGetHeight(surface: IOSurfaceRef) -> usize;
        pub fn IOSurfaceGetBytesPerRow(surface: IOSurfaceRef) -> usize;
        pub fn IOSurfaceGetBaseAddress(surface: IOSurfaceRef) -> *mut c_void;
        pub fn IOSurfaceLock(surface: IOSurfaceRef, options: u32, seed: *mut u32) -> i32;
        pub fn IOSurfaceUnlock(surface: IOSurfaceRef, options: u32, seed: *mut u32) -> i32;
    }

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        fn CFRetain(cf: *const c_void) -> *const c_void;
        fn CFRelease(cf: *const c_void);
    }

    /// Owning reference to an IOSurface.
    #[derive(Debug)]
    pub struct IoSurface(IOSurfaceRef);

    // IOSurface objects are documented thread-safe; the lock API
    // serializes CPU access.
    unsafe impl Send for IoSurface {}
    unsafe impl Sync for IoSurface {}

    impl IoSurface {
        /// Retain `raw` and take ownership of that retain.
        pub fn retain(raw: IOSurfaceRef) -> Option<Self> {
            if raw.is_null() {
                return None;
            }
            unsafe { CFRetain(raw as *const c_void) };
            Some(Self(raw))
        }

        pub fn as_ref_ptr(&self) -> IOSurfaceRef {
            self.0
        }

        /// `(width, height, bytes_per_row)` as reported by the OS.
        pub fn geometry(&self) -> (u32, u32, u32) {
            unsafe {
                (
                    IOSurfaceGetWidth(self.0) as u32,
                    IOSurfaceGetHeight(self.0) as u32,
                    IOSurfaceGetBytesPerRow(self.0) as u32,
                )
            }
        }

        /// Lock for CPU reads and hand out the mapped bytes.
        pub fn lock_readonly(
            &self,
            stride: u32,
            height: u32,
        ) -> Result<super::SurfaceReadGuard<'_>, ServerError> {
            let status = unsafe { IOSurfaceLock(self.0, LOCK_READ_ONLY, std::ptr::null_mut()) };
            if status != 0 {
                return Err(ServerError::EncodeFailure(format!(
                    "IOSurfaceLock returned {status}"
                )));
            }
            let base = unsafe { IOSurfaceGetBaseAddress(self.0) };
            if base.is_null() {
                unsafe { IOSurfaceUnlock(self.0, LOCK_READ_ONLY, std::ptr::null_mut()) };
                return Err(ServerError::EncodeFailure(
                    "IOSurface has no base address".into(),
                ));
            }
            let len = stride as usize * height as usize;
            let bytes = unsafe { std::slice::from_raw_parts(base as *const u8, len) };
            Ok(super::SurfaceReadGuard {
                bytes,
                locked: Some(self.0),
            })
        }
    }

    impl Clone for IoSurface {
        fn clone(&self) -> Self {
            unsafe { CFRetain(self.0 as *const c_void) };
            Self(self.0)
        }
    }

    impl Drop for IoSurface {
        fn drop(&mut self) {
            unsafe { CFRelease(self.0 as *const c_void) };
        }
    }
}
