//! Binary layout of the simulator's private HID input message.
//!
//! The layout is observed from the host's own tooling, not documented.
//! It must be treated as a fixed-size opaque struct: a mach message
//! header, an inner size, a one-byte event kind, then an event payload
//! followed by a byte-identical duplicate whose two leading fields are
//! set to 0x00000001 / 0x00000002. The duplication is part of the
//! on-the-wire contract. Fields whose meaning is unknown keep opaque
//! `fieldN` names; do not guess semantics for them. Memory is
//! zero-filled before assignment and unused fields stay zero.

use crate::command::{ButtonName, Direction, TouchPhase, TouchPoint};

/// Event kind byte: hardware button or key.
pub const EVENT_KIND_BUTTON: u8 = 1;
/// Event kind byte: touch.
pub const EVENT_KIND_TOUCH: u8 = 2;

/// Leading field of the duplicated payload.
pub const DUPLICATE_FIELD_A: u32 = 0x0000_0001;
/// Second field of the duplicated payload.
pub const DUPLICATE_FIELD_B: u32 = 0x0000_0002;

/// USB HID usage page for keyboard events.
const USAGE_PAGE_KEYBOARD: u32 = 0x07;

// ── Wire structs ─────────────────────────────────────────────────

/// Mach message header slot. Only `size` is meaningful to us.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub field0: u32,
    /// Total message size in bytes.
    pub size: u32,
    pub field1: u32,
    pub field2: u32,
    pub field3: u32,
    pub field4: i32,
}

/// One event payload. Appears twice per message; the second copy
/// carries the two discriminator fields.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventPayload {
    pub field0: u32,
    pub field1: u32,
    /// 64-bit mach-absolute timestamp.
    pub timestamp: u64,
    pub field2: u32,
    pub field3: u32,
    /// HID usage page for button/key events; zero for touches.
    pub usage_page: u32,
    /// Button index or key code for button/key events; zero for touches.
    pub usage: u32,
    /// Normalized horizontal position in [0, 1].
    pub x_ratio: f64,
    /// Normalized vertical position in [0, 1].
    pub y_ratio: f64,
    /// Paired down flags; (1, 1) while touching, (0, 0) on release.
    pub down: u32,
    pub down2: u32,
    pub field4: u32,
    pub field5: u32,
}

/// The complete fixed-size message submitted to the HID port.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HidMessage {
    pub header: MessageHeader,
    /// Size of everything after the mach header.
    pub inner_size: u32,
    /// [`EVENT_KIND_BUTTON`] or [`EVENT_KIND_TOUCH`].
    pub event_kind: u8,
    pub field0: [u8; 3],
    pub payload: EventPayload,
    pub duplicate: EventPayload,
}

// ── Construction ─────────────────────────────────────────────────

impl HidMessage {
    /// A fully zero-filled message with only the size fields set.
    fn zeroed(event_kind: u8) -> Self {
        // All fields are plain integers and floats; an all-zero bit
        // pattern is a valid value for every one of them.
        let mut msg: HidMessage = unsafe { std::mem::zeroed() };
        msg.header.size = std::mem::size_of::<HidMessage>() as u32;
        msg.inner_size =
            (std::mem::size_of::<HidMessage>() - std::mem::size_of::<MessageHeader>()) as u32;
        msg.event_kind = event_kind;
        msg
    }

    /// Duplicate the payload and stamp the discriminator fields.
    fn seal(mut self) -> Self {
        self.duplicate = self.payload;
        self.duplicate.field0 = DUPLICATE_FIELD_A;
        self.duplicate.field1 = DUPLICATE_FIELD_B;
        self
    }

    /// Build a touch message for one point.
    ///
    /// `began` and `moved` keep both down flags set; `moved` only
    /// updates the ratios. `ended` clears both flags.
    pub fn touch(phase: TouchPhase, point: TouchPoint, timestamp: u64) -> Self {
        let down = match phase {
            TouchPhase::Began | TouchPhase::Moved => 1,
            TouchPhase::Ended => 0,
        };
        let mut msg = Self::zeroed(EVENT_KIND_TOUCH);
        msg.payload.timestamp = timestamp;
        msg.payload.x_ratio = point.x;
        msg.payload.y_ratio = point.y;
        msg.payload.down = down;
        msg.payload.down2 = down;
        msg.seal()
    }

    /// Build a hardware-button message.
    pub fn button(name: ButtonName, direction: Direction, timestamp: u64) -> Self {
        let mut msg = Self::zeroed(EVENT_KIND_BUTTON);
        msg.payload.timestamp = timestamp;
        msg.payload.usage = button_usage(name);
        let down = match direction {
            Direction::Down => 1,
            Direction::Up => 0,
        };
        msg.payload.down = down;
        msg.payload.down2 = down;
        msg.seal()
    }

    /// Build a keyboard message for a USB HID key code.
    pub fn key(code: u32, direction: Direction, timestamp: u64) -> Self {
        let mut msg = Self::zeroed(EVENT_KIND_BUTTON);
        msg.payload.timestamp = timestamp;
        msg.payload.usage_page = USAGE_PAGE_KEYBOARD;
        msg.payload.usage = code;
        let down = match direction {
            Direction::Down => 1,
            Direction::Up => 0,
        };
        msg.payload.down = down;
        msg.payload.down2 = down;
        msg.seal()
    }

    /// The message as raw bytes for submission.
    pub fn as_bytes(&self) -> &[u8] {
        // Plain repr(C) struct with no padding requirements beyond
        // what the layout already provides.
        unsafe {
            std::slice::from_raw_parts(
                self as *const HidMessage as *const u8,
                std::mem::size_of::<HidMessage>(),
            )
        }
    }
}

/// Simulator button index for a named hardware button.
fn button_usage(name: ButtonName) -> u32 {
    match name {
        ButtonName::Home => 1,
        ButtonName::Lock => 2,
        ButtonName::Side => 3,
    }
}

// ── Timestamps ───────────────────────────────────────────────────

/// Current mach-absolute time, as embedded in every message.
#[cfg(target_os = "macos")]
pub fn now_timestamp() -> u64 {
    #[link(name = "CoreServices", kind = "framework")]
    extern "C" {
        fn mach_absolute_time() -> u64;
    }
    unsafe { mach_absolute_time() }
}

/// Monotonic nanosecond stand-in for hosts without mach time.
#[cfg(not(target_os = "macos"))]
pub fn now_timestamp() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_began_sets_both_down_flags() {
        let msg = HidMessage::touch(
            TouchPhase::Began,
            TouchPoint { x: 0.5, y: 0.5 },
            1234,
        );
        assert_eq!(msg.event_kind, EVENT_KIND_TOUCH);
        assert_eq!(msg.payload.x_ratio, 0.5);
        assert_eq!(msg.payload.y_ratio, 0.5);
        assert_eq!((msg.payload.down, msg.payload.down2), (1, 1));
        assert_eq!(msg.payload.timestamp, 1234);
    }

    #[test]
    fn touch_ended_clears_both_down_flags() {
        let msg = HidMessage::touch(
            TouchPhase::Ended,
            TouchPoint { x: 0.5, y: 0.5 },
            1,
        );
        assert_eq!((msg.payload.down, msg.payload.down2), (0, 0));
        assert_eq!(msg.payload.x_ratio, 0.5);
    }

    #[test]
    fn moved_keeps_down_and_updates_ratios() {
        let msg = HidMessage::touch(
            TouchPhase::Moved,
            TouchPoint { x: 0.25, y: 0.75 },
            1,
        );
        assert_eq!((msg.payload.down, msg.payload.down2), (1, 1));
        assert_eq!(msg.payload.x_ratio, 0.25);
        assert_eq!(msg.payload.y_ratio, 0.75);
    }

    #[test]
    fn duplicate_payload_carries_discriminators() {
        let msg = HidMessage::touch(
            TouchPhase::Began,
            TouchPoint { x: 0.1, y: 0.9 },
            42,
        );
        assert_eq!(msg.duplicate.field0, DUPLICATE_FIELD_A);
        assert_eq!(msg.duplicate.field1, DUPLICATE_FIELD_B);
        // Everything else mirrors the first payload.
        assert_eq!(msg.duplicate.x_ratio, msg.payload.x_ratio);
        assert_eq!(msg.duplicate.y_ratio, msg.payload.y_ratio);
        assert_eq!(msg.duplicate.down, msg.payload.down);
        assert_eq!(msg.duplicate.timestamp, msg.payload.timestamp);
        // The first payload's leading fields stay zero.
        assert_eq!((msg.payload.field0, msg.payload.field1), (0, 0));
    }

    #[test]
    fn button_message_kind_and_usage() {
        let msg = HidMessage::button(ButtonName::Home, Direction::Down, 7);
        assert_eq!(msg.event_kind, EVENT_KIND_BUTTON);
        assert_eq!(msg.payload.usage, 1);
        assert_eq!((msg.payload.down, msg.payload.down2), (1, 1));

        let msg = HidMessage::button(ButtonName::Side, Direction::Up, 7);
        assert_eq!(msg.payload.usage, 3);
        assert_eq!((msg.payload.down, msg.payload.down2), (0, 0));
    }

    #[test]
    fn key_message_uses_keyboard_page() {
        let msg = HidMessage::key(40, Direction::Down, 7);
        assert_eq!(msg.event_kind, EVENT_KIND_BUTTON);
        assert_eq!(msg.payload.usage_page, 0x07);
        assert_eq!(msg.payload.usage, 40);
    }

    #[test]
    fn sizes_are_stamped() {
        let msg = HidMessage::touch(
            TouchPhase::Began,
            TouchPoint { x: 0.0, y: 0.0 },
            0,
        );
        assert_eq!(msg.header.size as usize, std::mem::size_of::<HidMessage>());
        assert_eq!(
            msg.inner_size as usize,
            std::mem::size_of::<HidMessage>() - std::mem::size_of::<MessageHeader>()
        );
        assert_eq!(msg.as_bytes().len(), std::mem::size_of::<HidMessage>());
    }

    #[test]
    fn unused_fields_stay_zero() {
        let msg = HidMessage::touch(
            TouchPhase::Began,
            TouchPoint { x: 0.5, y: 0.5 },
            1,
        );
        assert_eq!(msg.field0, [0u8; 3]);
        assert_eq!(msg.payload.field2, 0);
        assert_eq!(msg.payload.field3, 0);
        assert_eq!(msg.payload.field4, 0);
        assert_eq!(msg.payload.field5, 0);
        assert_eq!(msg.payload.usage_page, 0);
        assert_eq!(msg.payload.usage, 0);
    }

    #[test]
    fn timestamps_advance() {
        let a = now_timestamp();
        let b = now_timestamp();
        assert!(b >= a);
    }
}
