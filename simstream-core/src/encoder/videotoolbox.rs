//! Hardware JPEG compression via VideoToolbox.
//!
//! One `Session` wraps a `VTCompressionSession` configured for the
//! JPEG codec at a fixed geometry and quality. Each submitted frame is
//! completed synchronously and the output callback's bytes are handed
//! back under a 100 ms deadline; a miss surfaces as `EncodeTimeout`
//! and the caller falls through to the CPU path.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::error;

use crate::error::ServerError;
use crate::surface::DisplaySurface;

/// Per-frame completion deadline.
const ENCODE_TIMEOUT_MS: u64 = 100;

// ── Output mailbox ───────────────────────────────────────────────

/// Shared between the session and the C output callback.
struct Mailbox {
    queue: Mutex<VecDeque<Result<Vec<u8>, i32>>>,
    ready: Condvar,
}

// ── Session ──────────────────────────────────────────────────────

/// A live hardware compression session.
pub(super) struct Session {
    session: ffi::VTCompressionSessionRef,
    mailbox: Arc<Mailbox>,
    /// Raw `Arc<Mailbox>` handed to the callback; rebuilt in `Drop`.
    callback_context: *const c_void,
    frame_number: i64,
}

// The session pointer is only touched from the pipeline task; the
// callback context is freed after `VTCompressionSessionCompleteFrames`
// guarantees no callback is still running.
unsafe impl Send for Session {}

impl Session {
    /// Create a session for the given geometry and 0.1..=1.0 quality.
    pub(super) fn new(width: u32, height: u32, quality: f32) -> Result<Self, ServerError> {
        let mailbox = Arc::new(Mailbox {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        });
        let callback_context = Arc::into_raw(Arc::clone(&mailbox)) as *const c_void;

        let mut session: ffi::VTCompressionSessionRef = std::ptr::null_mut();
        let status = unsafe {
            ffi::VTCompressionSessionCreate(
                std::ptr::null(),
                width as i32,
                height as i32,
                ffi::K_CMVIDEO_CODEC_TYPE_JPEG,
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                compression_output_callback,
                callback_context as *mut c_void,
                &mut session,
            )
        };
        if status != ffi::NO_ERR || session.is_null() {
            unsafe { drop(Arc::from_raw(callback_context as *const Mailbox)) };
            return Err(ServerError::EncodeFailure(format!(
                "VTCompressionSessionCreate failed: {status}"
            )));
        }

        unsafe {
            // Quality is advisory for some encoders; a failure here is
            // not fatal to the session.
            let value = quality as f64;
            let number = ffi::CFNumberCreate(
                std::ptr::null(),
                ffi::K_CFNUMBER_DOUBLE_TYPE,
                &value as *const f64 as *const c_void,
            );
            let status = ffi::VTSessionSetProperty(
                session,
                ffi::kVTCompressionPropertyKey_Quality,
                number as *const c_void,
            );
            ffi::CFRelease(number as *const c_void);
            if status != ffi::NO_ERR {
                error!("failed to set JPEG quality: {status}");
            }

            let status = ffi::VTSessionSetProperty(
                session,
                ffi::kVTCompressionPropertyKey_RealTime,
                ffi::kCFBooleanTrue as *const c_void,
            );
            if status != ffi::NO_ERR {
                error!("failed to enable real-time encoding: {status}");
            }
        }

        Ok(Self {
            session,
            mailbox,
            callback_context,
            frame_number: 0,
        })
    }

    /// Compress one frame, waiting up to 100 ms for the callback.
    pub(super) fn encode(&mut self, surface: &DisplaySurface) -> Result<Vec<u8>, ServerError> {
        // A late callback from a timed-out frame may have landed since
        // the previous call; it belongs to a stale surface.
        self.mailbox
            .queue
            .lock()
            .expect("mailbox lock poisoned")
            .clear();

        // Keep the CPU view alive for the whole submit+wait when the
        // pixel buffer borrows surface memory.
        let (pixel_buffer, _guard) = self.pixel_buffer_for(surface)?;

        let pts = ffi::CMTime::new(self.frame_number, 600);
        self.frame_number += 1;

        let status = unsafe {
            ffi::VTCompressionSessionEncodeFrame(
                self.session,
                pixel_buffer,
                pts,
                ffi::CMTime::invalid(),
                std::ptr::null(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if status != ffi::NO_ERR {
            unsafe { ffi::CFRelease(pixel_buffer as *const c_void) };
            return Err(ServerError::EncodeFailure(format!(
                "VTCompressionSessionEncodeFrame failed: {status}"
            )));
        }

        unsafe {
            ffi::VTCompressionSessionCompleteFrames(self.session, ffi::CMTime::invalid());
            ffi::CFRelease(pixel_buffer as *const c_void);
        }

        // Wait for the output callback.
        let deadline = Duration::from_millis(ENCODE_TIMEOUT_MS);
        let mut queue = self.mailbox.queue.lock().expect("mailbox lock poisoned");
        while queue.is_empty() {
            let (next, timeout) = self
                .mailbox
                .ready
                .wait_timeout(queue, deadline)
                .expect("mailbox lock poisoned");
            queue = next;
            if timeout.timed_out() && queue.is_empty() {
                return Err(ServerError::EncodeTimeout(ENCODE_TIMEOUT_MS));
            }
        }
        match queue.pop_front().expect("checked non-empty") {
            Ok(bytes) => Ok(bytes),
            Err(status) => Err(ServerError::EncodeFailure(format!(
                "compression callback reported {status}"
            ))),
        }
    }

    /// Wrap the surface for the codec. IOSurface backings wrap
    /// zero-copy; memory backings borrow the locked bytes.
    fn pixel_buffer_for<'a>(
        &self,
        surface: &'a DisplaySurface,
    ) -> Result<
        (
            ffi::CVPixelBufferRef,
            Option<crate::surface::SurfaceReadGuard<'a>>,
        ),
        ServerError,
    > {
        let mut pixel_buffer: ffi::CVPixelBufferRef = std::ptr::null_mut();

        if let Some(io_surface) = surface.iosurface_ref() {
            let status = unsafe {
                ffi::CVPixelBufferCreateWithIOSurface(
                    std::ptr::null(),
                    io_surface,
                    std::ptr::null(),
                    &mut pixel_buffer,
                )
            };
            if status != ffi::NO_ERR || pixel_buffer.is_null() {
                return Err(ServerError::EncodeFailure(format!(
                    "CVPixelBufferCreateWithIOSurface failed: {status}"
                )));
            }
            return Ok((pixel_buffer, None));
        }

        let guard = surface.lock_readonly()?;
        let status = unsafe {
            ffi::CVPixelBufferCreateWithBytes(
                std::ptr::null(),
                surface.width() as usize,
                surface.height() as usize,
                ffi::K_CVPIXEL_FORMAT_32BGRA,
                guard.as_ptr() as *mut c_void,
                surface.stride() as usize,
                None,
                std::ptr::null_mut(),
                std::ptr::null(),
                &mut pixel_buffer,
            )
        };
        if status != ffi::NO_ERR || pixel_buffer.is_null() {
            return Err(ServerError::EncodeFailure(format!(
                "CVPixelBufferCreateWithBytes failed: {status}"
            )));
        }
        Ok((pixel_buffer, Some(guard)))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        unsafe {
            // Flush pending frames before invalidating so no callback
            // outlives the context it dereferences.
            ffi::VTCompressionSessionCompleteFrames(self.session, ffi::CMTime::invalid());
            ffi::VTCompressionSessionInvalidate(self.session);
            ffi::CFRelease(self.session as *const c_void);
            drop(Arc::from_raw(self.callback_context as *const Mailbox));
        }
    }
}

// ── Output callback ──────────────────────────────────────────────

/// Invoked by VideoToolbox when a frame finishes. Copies the
/// compressed run into the mailbox and wakes the waiting encode call.
extern "C" fn compression_output_callback(
    output_callback_ref_con: *mut c_void,
    _source_frame_ref_con: *mut c_void,
    status: ffi::OSStatus,
    _info_flags: u32,
    sample_buffer: ffi::CMSampleBufferRef,
) {
    // The pointer is an `Arc<Mailbox>` kept alive until `Drop` has
    // flushed all pending frames.
    let mailbox = unsafe { &*(output_callback_ref_con as *const Mailbox) };

    let result = if status != ffi::NO_ERR {
        Err(status)
    } else if sample_buffer.is_null() {
        Err(-1)
    } else {
        unsafe {
            let block = ffi::CMSampleBufferGetDataBuffer(sample_buffer);
            if block.is_null() {
                Err(-1)
            } else {
                let len = ffi::CMBlockBufferGetDataLength(block);
                let mut data = vec![0u8; len];
                let copy = ffi::CMBlockBufferCopyDataBytes(block, 0, len, data.as_mut_ptr());
                if copy != ffi::NO_ERR {
                    Err(copy)
                } else {
                    Ok(data)
                }
            }
        }
    };

    if let Ok(mut queue) = mailbox.queue.lock() {
        queue.push_back(result);
        mailbox.ready.notify_one();
    }
}

// ── FFI ──────────────────────────────────────────────────────────

/// VideoToolbox, CoreMedia and CoreFoundation declarations used by the
/// session. Every signature lives here and nowhere else.
mod ffi {
    use std::ffi::c_void;

    pub type OSStatus = i32;
    pub type VTCompressionSessionRef = *mut c_void;
    pub type CVPixelBufferRef = *mut c_void;
    pub type CMSampleBufferRef = *mut c_void;
    pub type CMBlockBufferRef = *mut c_void;
    pub type CFStringRef = *const c_void;
    pub type CFNumberRef = *const c_void;
    pub type CFBooleanRef = *const c_void;
    pub type CVPixelBufferReleaseBytesCallback =
        Option<extern "C" fn(release_ref_con: *mut c_void, base_address: *const c_void)>;

    pub const NO_ERR: OSStatus = 0;
    /// FourCC `'jpeg'`.
    pub const K_CMVIDEO_CODEC_TYPE_JPEG: u32 = 0x6A70_6567;
    /// FourCC `'BGRA'` (kCVPixelFormatType_32BGRA).
    pub const K_CVPIXEL_FORMAT_32BGRA: u32 = 0x4247_5241;
    /// kCFNumberDoubleType.
    pub const K_CFNUMBER_DOUBLE_TYPE: i32 = 13;

    #[repr(C)]
    pub struct CMTime {
        pub value: i64,
        pub timescale: i32,
        pub flags: u32,
        pub epoch: i64,
    }

    impl CMTime {
        pub fn new(value: i64, timescale: i32) -> Self {
            Self {
                value,
                timescale,
                flags: 1, // kCMTimeFlags_Valid
                epoch: 0,
            }
        }

        pub fn invalid() -> Self {
            Self {
                value: 0,
                timescale: 0,
                flags: 0,
                epoch: 0,
            }
        }
    }

    pub type VTCompressionOutputCallback = extern "C" fn(
        output_callback_ref_con: *mut c_void,
        source_frame_ref_con: *mut c_void,
        status: OSStatus,
        info_flags: u32,
        sample_buffer: CMSampleBufferRef,
    );

    #[link(name = "VideoToolbox", kind = "framework")]
    extern "C" {
        pub fn VTCompressionSessionCreate(
            allocator: *const c_void,
            width: i32,
            height: i32,
            codec_type: u32,
            encoder_specification: *const c_void,
            source_image_buffer_attributes: *const c_void,
            compressed_data_allocator: *const c_void,
            output_callback: VTCompressionOutputCallback,
            output_callback_ref_con: *mut c_void,
            compression_session_out: *mut VTCompressionSessionRef,
        ) -> OSStatus;

        pub fn VTCompressionSessionEncodeFrame(
            session: VTCompressionSessionRef,
            image_buffer: CVPixelBufferRef,
            presentation_time_stamp: CMTime,
            duration: CMTime,
            frame_properties: *const c_void,
            source_frame_ref_con: *mut c_void,
            info_flags_out: *mut u32,
        ) -> OSStatus;

        pub fn VTCompressionSessionCompleteFrames(
            session: VTCompressionSessionRef,
            complete_until_presentation_time_stamp: CMTime,
        ) -> OSStatus;

        pub fn VTCompressionSessionInvalidate(session: VTCompressionSessionRef);

        pub fn VTSessionSetProperty(
            session: VTCompressionSessionRef,
            property_key: CFStringRef,
            property_value: *const c_void,
        ) -> OSStatus;

        pub static kVTCompressionPropertyKey_Quality: CFStringRef;
        pub static kVTCompressionPropertyKey_RealTime: CFStringRef;
    }

    #[link(name = "CoreMedia", kind = "framework")]
    extern "C" {
        pub fn CMSampleBufferGetDataBuffer(sbuf: CMSampleBufferRef) -> CMBlockBufferRef;

        pub fn CMBlockBufferGetDataLength(the_buffer: CMBlockBufferRef) -> usize;

        pub fn CMBlockBufferCopyDataBytes(
            the_buffer: CMBlockBufferRef,
            offset_to_data: usize,
            data_length: usize,
            destination: *mut u8,
        ) -> OSStatus;
    }

    #[link(name = "CoreVideo", kind = "framework")]
    extern "C" {
        pub fn CVPixelBufferCreateWithIOSurface(
            allocator: *const c_void,
            surface: *mut c_void,
            pixel_buffer_attributes: *const c_void,
            pixel_buffer_out: *mut CVPixelBufferRef,
        ) -> OSStatus;

        pub fn CVPixelBufferCreateWithBytes(
            allocator: *const c_void,
            width: usize,
            height: usize,
            pixel_format_type: u32,
            base_address: *mut c_void,
            bytes_per_row: usize,
            release_callback: CVPixelBufferReleaseBytesCallback,
            release_ref_con: *mut c_void,
            pixel_buffer_attributes: *const c_void,
            pixel_buffer_out: *mut CVPixelBufferRef,
        ) -> OSStatus;
    }

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        pub fn CFNumberCreate(
            allocator: *const c_void,
            the_type: i32,
            value_ptr: *const c_void,
        ) -> CFNumberRef;

        pub fn CFRelease(cf: *const c_void);

        pub static kCFBooleanTrue: CFBooleanRef;
    }
}
