//! Core pipeline of the simulator streaming server.
//!
//! One process attaches to one running iOS simulator, captures its
//! framebuffer, compresses frames to JPEG and serves them as an MJPEG
//! stream on loopback, while accepting touch / button / key / control
//! commands on standard input.
//!
//! Component map:
//!
//! ```text
//! bridge ──surfaces──► pipeline ──jpeg──► ring ──► server ──► clients
//!                          ▲
//! stdin ──► command ───────┴──► hid injector ──► simulator
//! ```

pub mod bridge;
pub mod command;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod hid;
pub mod pipeline;
pub mod ring;
pub mod server;
pub mod session;
pub mod surface;

pub use bridge::{DeliveryMode, DeviceBridge};
pub use command::{Command, CommandReader, TouchPhase, TouchPoint};
pub use encoder::FrameEncoder;
pub use error::ServerError;
pub use frame::EncodedFrame;
pub use hid::HidInjector;
pub use pipeline::{run_pipeline, PipelineStats, SURFACE_CHANNEL_DEPTH};
pub use ring::FrameRing;
pub use server::MjpegServer;
pub use session::SessionParams;
pub use surface::DisplaySurface;
