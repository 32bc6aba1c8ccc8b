use crate::camera::CameraError;
use crate::frame::Frame;

/// Pull-based frame supply for the session loop.
///
/// `Ok(None)` is a clean end of stream (finite sources, e.g. test fixtures);
/// a live camera either yields a frame or fails, and a failure ends the
/// session. Cancellation is checked by the caller between pulls.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}
