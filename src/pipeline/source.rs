use crate::{error::CaptureError, types::FrameHandle};

/// Read-only view onto a live video feed.
pub trait FrameSource {
    /// Latest decodable frame. `Ok(None)` while nothing has been captured yet
    /// or after the source was stopped; `Err` once the device is gone.
    fn current_frame(&mut self) -> Result<Option<FrameHandle>, CaptureError>;

    /// Stops the underlying capture tracks.
    fn stop(&mut self) {}
}
