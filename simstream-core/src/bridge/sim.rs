//! CoreSimulator runtime dispatch.
//!
//! None of the simulator classes used here appear in a public header,
//! so every class is looked up by name at runtime and every call goes
//! through a selector resolved here. This module is the single place
//! that knows any private selector's signature; callers get typed
//! wrappers. An untyped call site outside this file is a bug.
//!
//! Classes touched: `SimServiceContext`, `SimDeviceSet`, `SimDevice`,
//! the device IO server and its port descriptors, and
//! `SimDeviceLegacyHIDClient`.

use std::ffi::{c_void, CStr};
use std::ptr::null_mut;
use std::sync::OnceLock;

use libloading::Library;
use objc2::rc::Retained;
use objc2::runtime::{AnyClass, AnyObject, Sel};
use objc2::{msg_send, sel, AllocAnyThread};
use objc2_foundation::{NSSize, NSString, NSUUID};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ServerError;
use crate::hid::message::HidMessage;
use crate::surface::DisplaySurface;

// ── Object handle ────────────────────────────────────────────────

/// A retained private-framework object.
pub struct SimObject(Retained<AnyObject>);

// CoreSimulator device, IO and HID objects are served by XPC proxies
// that are safe to message from any thread; each component here only
// ever messages a handle from one task at a time.
unsafe impl Send for SimObject {}
unsafe impl Sync for SimObject {}

impl SimObject {
    fn retain(ptr: *mut AnyObject) -> Option<Self> {
        unsafe { Retained::retain(ptr).map(Self) }
    }

    fn as_ref(&self) -> &AnyObject {
        &self.0
    }
}

fn responds(obj: &AnyObject, selector: Sel) -> bool {
    unsafe { msg_send![obj, respondsToSelector: selector] }
}

// ── Framework loading ────────────────────────────────────────────

/// CoreSimulator ships with the host OS.
const CORE_SIMULATOR_PATH: &str =
    "/Library/Developer/PrivateFrameworks/CoreSimulator.framework/CoreSimulator";

static FRAMEWORKS: OnceLock<(Library, Library)> = OnceLock::new();

/// Active developer directory, honoring `DEVELOPER_DIR`.
pub fn developer_dir() -> String {
    std::env::var("DEVELOPER_DIR")
        .unwrap_or_else(|_| "/Applications/Xcode.app/Contents/Developer".to_string())
}

/// Load the private display and HID framework bundles. Fatal when
/// either is absent; idempotent afterwards.
pub fn load_frameworks() -> Result<(), ServerError> {
    if FRAMEWORKS.get().is_some() {
        return Ok(());
    }

    let simulator_kit_path = format!(
        "{}/Library/PrivateFrameworks/SimulatorKit.framework/SimulatorKit",
        developer_dir()
    );

    let core_simulator = unsafe { Library::new(CORE_SIMULATOR_PATH) }
        .map_err(|e| ServerError::FrameworkMissing(format!("CoreSimulator: {e}")))?;
    let simulator_kit = unsafe { Library::new(&simulator_kit_path) }
        .map_err(|e| ServerError::FrameworkMissing(format!("SimulatorKit: {e}")))?;

    debug!("loaded CoreSimulator and SimulatorKit bundles");
    let _ = FRAMEWORKS.set((core_simulator, simulator_kit));
    Ok(())
}

fn class(name: &'static CStr) -> Result<&'static AnyClass, ServerError> {
    AnyClass::get(name).ok_or_else(|| {
        ServerError::FrameworkMissing(format!("class {} not registered", name.to_string_lossy()))
    })
}

// ── Device resolution ────────────────────────────────────────────

/// UDID string in canonical form for comparison.
fn canonical_udid(udid: &str) -> String {
    match Uuid::parse_str(udid.trim()) {
        Ok(parsed) => parsed.hyphenated().to_string(),
        Err(_) => udid.trim().to_ascii_lowercase(),
    }
}

/// Walk the default device set for the device matching `udid`.
pub fn resolve_device(udid: &str) -> Result<SimObject, ServerError> {
    let context_class = class(c"SimServiceContext")?;
    let dev_dir = NSString::from_str(&developer_dir());
    let mut error: *mut AnyObject = null_mut();

    let context: *mut AnyObject = unsafe {
        msg_send![
            context_class,
            sharedServiceContextForDeveloperDir: &*dev_dir,
            error: &mut error
        ]
    };
    if context.is_null() {
        return Err(ServerError::FrameworkMissing(
            "SimServiceContext refused the developer directory".into(),
        ));
    }

    let device_set: *mut AnyObject =
        unsafe { msg_send![context, defaultDeviceSetWithError: &mut error] };
    if device_set.is_null() {
        return Err(ServerError::FrameworkMissing(
            "no default simulator device set".into(),
        ));
    }

    let wanted = canonical_udid(udid);
    let devices: *mut AnyObject = unsafe { msg_send![device_set, devices] };
    let count: usize = unsafe { msg_send![devices, count] };

    for index in 0..count {
        let device: *mut AnyObject = unsafe { msg_send![devices, objectAtIndex: index] };
        if device.is_null() {
            continue;
        }
        let device_uuid: *mut AnyObject = unsafe { msg_send![device, UDID] };
        if device_uuid.is_null() {
            continue;
        }
        let uuid_string: Retained<NSString> = unsafe { msg_send![device_uuid, UUIDString] };
        if canonical_udid(&uuid_string.to_string()) == wanted {
            debug!("resolved simulator device {wanted}");
            return SimObject::retain(device)
                .ok_or_else(|| ServerError::DeviceNotFound(udid.to_string()));
        }
    }

    Err(ServerError::DeviceNotFound(udid.to_string()))
}

// ── Display selection ────────────────────────────────────────────

/// The retained port descriptor the stream reads surfaces from.
pub struct DisplayDescriptor {
    descriptor: SimObject,
}

impl DisplayDescriptor {
    /// Read the descriptor's current surface, if any.
    pub fn current_surface(&self) -> Option<DisplaySurface> {
        copy_surface(self.descriptor.as_ref())
    }

    /// Register a surface-change callback keyed by `subscription_id`.
    /// Returns false when the descriptor has no registration entry
    /// point (older hosts), in which case the caller must poll.
    pub fn register_callback(
        &self,
        subscription_id: &Uuid,
        callback: block2::RcBlock<dyn Fn(*mut c_void)>,
    ) -> bool {
        let descriptor = self.descriptor.as_ref();
        if !responds(descriptor, sel!(registerCallbackWithUUID:ioSurfaceChangeCallback:)) {
            return false;
        }
        let key = ns_uuid(subscription_id);
        unsafe {
            let _: () = msg_send![
                descriptor,
                registerCallbackWithUUID: &*key,
                ioSurfaceChangeCallback: &*callback
            ];
        }
        true
    }

    /// Drop the registration made under `subscription_id`.
    pub fn unregister_callback(&self, subscription_id: &Uuid) {
        let descriptor = self.descriptor.as_ref();
        if !responds(descriptor, sel!(unregisterCallbackWithUUID:)) {
            return;
        }
        let key = ns_uuid(subscription_id);
        unsafe {
            let _: () = msg_send![descriptor, unregisterCallbackWithUUID: &*key];
        }
    }
}

/// Probe the two known surface accessors, framebuffer first.
fn copy_surface(descriptor: &AnyObject) -> Option<DisplaySurface> {
    let raw: *mut AnyObject = if responds(descriptor, sel!(framebufferSurface)) {
        unsafe { msg_send![descriptor, framebufferSurface] }
    } else if responds(descriptor, sel!(ioSurface)) {
        unsafe { msg_send![descriptor, ioSurface] }
    } else {
        null_mut()
    };
    DisplaySurface::from_iosurface(raw as *mut c_void)
}

/// Display class reported by the descriptor's state; 0 is the main
/// display.
fn display_class(descriptor: &AnyObject) -> Option<i64> {
    if !responds(descriptor, sel!(state)) {
        return None;
    }
    let state: *mut AnyObject = unsafe { msg_send![descriptor, state] };
    if state.is_null() {
        return None;
    }
    let state_ref = unsafe { &*state };
    if !responds(state_ref, sel!(displayClass)) {
        return None;
    }
    Some(unsafe { msg_send![state_ref, displayClass] })
}

/// Enumerate the device's IO ports and pick its main display: a port
/// whose descriptor reports display-class 0, else the port with the
/// largest readable surface.
pub fn main_display(device: &SimObject, udid: &str) -> Result<DisplayDescriptor, ServerError> {
    let io: *mut AnyObject = unsafe { msg_send![device.as_ref(), io] };
    if io.is_null() {
        return Err(ServerError::NoDisplaySurface(udid.to_string()));
    }

    let io_ref = unsafe { &*io };
    let ports: *mut AnyObject = if responds(io_ref, sel!(ioPorts)) {
        unsafe { msg_send![io_ref, ioPorts] }
    } else {
        let mut error: *mut AnyObject = null_mut();
        unsafe { msg_send![io_ref, ioPortsWithError: &mut error] }
    };
    if ports.is_null() {
        return Err(ServerError::NoDisplaySurface(udid.to_string()));
    }

    let count: usize = unsafe { msg_send![ports, count] };
    let mut best: Option<(DisplayDescriptor, u64)> = None;

    for index in 0..count {
        let port: *mut AnyObject = unsafe { msg_send![ports, objectAtIndex: index] };
        if port.is_null() {
            continue;
        }
        let port_ref = unsafe { &*port };
        if !responds(port_ref, sel!(descriptor)) {
            continue;
        }
        let descriptor: *mut AnyObject = unsafe { msg_send![port_ref, descriptor] };
        if descriptor.is_null() {
            continue;
        }
        let descriptor_ref = unsafe { &*descriptor };

        let Some(surface) = copy_surface(descriptor_ref) else {
            continue;
        };
        let area = surface.width() as u64 * surface.height() as u64;

        let Some(retained) = SimObject::retain(descriptor) else {
            continue;
        };
        let candidate = DisplayDescriptor {
            descriptor: retained,
        };

        if display_class(descriptor_ref) == Some(0) {
            debug!(
                "selected main display port (class 0, {}x{})",
                surface.width(),
                surface.height()
            );
            return Ok(candidate);
        }
        if best.as_ref().map_or(true, |(_, best_area)| area > *best_area) {
            best = Some((candidate, area));
        }
    }

    match best {
        Some((descriptor, _)) => {
            debug!("no class-0 display port; using the largest surface");
            Ok(descriptor)
        }
        None => Err(ServerError::NoDisplaySurface(udid.to_string())),
    }
}

// ── HID client ───────────────────────────────────────────────────

/// The device's legacy HID endpoint.
pub struct HidClient {
    client: SimObject,
}

impl HidClient {
    /// Construct the legacy client bound to `device`.
    pub fn new(device: &SimObject) -> Result<Self, ServerError> {
        let hid_class = class(c"SimDeviceLegacyHIDClient")?;
        let allocated: *mut AnyObject = unsafe { msg_send![hid_class, alloc] };
        let client: *mut AnyObject =
            unsafe { msg_send![allocated, initWithDevice: device.as_ref()] };
        if client.is_null() {
            return Err(ServerError::FrameworkMissing(
                "SimDeviceLegacyHIDClient init returned nil".into(),
            ));
        }
        // init hands back an owned reference.
        let client = unsafe { Retained::from_raw(client) }.map(SimObject).ok_or_else(|| {
            ServerError::FrameworkMissing("SimDeviceLegacyHIDClient init returned nil".into())
        })?;
        Ok(Self { client })
    }

    /// Submit one message, preferring the asynchronous entry point
    /// that takes ownership of the buffer and frees it when done.
    pub fn send(&self, message: &HidMessage) -> Result<(), ServerError> {
        let client = self.client.as_ref();

        if responds(client, sel!(sendMessageAsync:freeWhenDone:completionHandler:)) {
            // Ownership of the allocation transfers to the client.
            let owned = Box::into_raw(Box::new(*message)) as *mut c_void;
            let completion = block2::RcBlock::new(|error: *mut AnyObject| {
                if !error.is_null() {
                    warn!("async HID send reported an error");
                }
            });
            unsafe {
                let _: () = msg_send![
                    client,
                    sendMessageAsync: owned,
                    freeWhenDone: true,
                    completionHandler: &*completion
                ];
            }
            return Ok(());
        }

        if responds(client, sel!(sendMessage:)) {
            let owned = Box::into_raw(Box::new(*message)) as *mut c_void;
            unsafe {
                let _: () = msg_send![client, sendMessage: owned];
                drop(Box::from_raw(owned as *mut HidMessage));
            }
            return Ok(());
        }

        Err(ServerError::HidSend(
            "HID client exposes no known send entry point".into(),
        ))
    }
}

// ── Screen metrics ───────────────────────────────────────────────

/// `(width, height, scale)` of the device's main screen, for logging.
pub fn main_screen_metrics(device: &SimObject) -> Option<(f64, f64, f64)> {
    let device = device.as_ref();
    if !responds(device, sel!(mainScreenSize)) || !responds(device, sel!(mainScreenScale)) {
        return None;
    }
    let size: NSSize = unsafe { msg_send![device, mainScreenSize] };
    let scale: f64 = unsafe { msg_send![device, mainScreenScale] };
    Some((size.width, size.height, scale))
}

fn ns_uuid(id: &Uuid) -> Retained<NSUUID> {
    let text = NSString::from_str(&id.hyphenated().to_string());
    unsafe { msg_send![NSUUID::alloc(), initWithUUIDString: &*text] }
}
