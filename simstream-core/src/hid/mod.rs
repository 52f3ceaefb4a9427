//! HID injection into the simulator.
//!
//! The injector owns a legacy HID client bound to the resolved device
//! and turns parsed `touch` / `button` / `key` commands into the
//! private binary messages in [`message`]. Injection is best-effort:
//! a failed send is logged and dropped, never reported upstream.
//!
//! # Platform
//!
//! The HID client only exists on macOS. Elsewhere `start` fails at
//! runtime; message construction stays portable and fully tested.

pub mod message;

#[cfg(target_os = "macos")]
use tracing::debug;
use tracing::warn;

use crate::command::{ButtonName, Direction, TouchPhase, TouchPoint};
use crate::error::ServerError;
use message::HidMessage;

/// Injects touch, button and key events through the device's legacy
/// HID endpoint.
pub struct HidInjector {
    #[cfg(target_os = "macos")]
    client: crate::bridge::sim::HidClient,
}

#[cfg(target_os = "macos")]
impl HidInjector {
    /// Resolve the device for `udid` and bind its HID client.
    ///
    /// Resolution reuses the bridge's lookup path; the screen size and
    /// scale are read once for the log line.
    pub fn start(udid: &str) -> Result<Self, ServerError> {
        use crate::bridge::sim;

        sim::load_frameworks()?;
        let device = sim::resolve_device(udid)?;
        let client = sim::HidClient::new(&device)?;

        match sim::main_screen_metrics(&device) {
            Some((width, height, scale)) => {
                debug!("hid client ready; main screen {width}x{height} @ {scale}x");
            }
            None => debug!("hid client ready; screen metrics unavailable"),
        }

        Ok(Self { client })
    }

    fn submit(&self, message: &HidMessage, what: &str) {
        if let Err(e) = self.client.send(message) {
            warn!("{what} injection failed: {e}");
        }
    }
}

#[cfg(not(target_os = "macos"))]
impl HidInjector {
    /// The simulator HID client is only available on macOS.
    pub fn start(_udid: &str) -> Result<Self, ServerError> {
        Err(ServerError::FrameworkMissing(
            "simulator HID client is only available on macOS".into(),
        ))
    }

    fn submit(&self, _message: &HidMessage, what: &str) {
        warn!("{what} injection unavailable on this platform");
    }
}

impl HidInjector {
    /// Synthesize one message per point for a touch phase.
    pub fn send_touch(&self, phase: TouchPhase, points: &[TouchPoint]) {
        for point in points {
            let msg = HidMessage::touch(phase, *point, message::now_timestamp());
            self.submit(&msg, "touch");
        }
    }

    /// Press or release a hardware button.
    pub fn send_button(&self, name: ButtonName, direction: Direction) {
        let msg = HidMessage::button(name, direction, message::now_timestamp());
        self.submit(&msg, "button");
    }

    /// Press or release a key by USB HID code.
    pub fn send_key(&self, code: u32, direction: Direction) {
        let msg = HidMessage::key(code, direction, message::now_timestamp());
        self.submit(&msg, "key");
    }
}
