//! rollcall-hw — Camera hardware abstraction.
//!
//! V4L2 capture with YUYV/GREY negotiation and the `FrameSource` pull trait
//! the session loop consumes.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::FrameSource;
