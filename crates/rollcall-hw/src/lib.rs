//! rollcall-hw: Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access behind the [`FrameSource`] trait,
//! delivering full-resolution RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, PixelFormat};
pub use frame::{Frame, FrameSource};
