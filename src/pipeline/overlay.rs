use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use super::{
    dispatch::{Emission, Sink},
    skeleton,
};
use crate::{error::SinkError, types::FrameTimestamp};

/// A frame with the pose drawn on top, at the frame's own dimensions.
#[derive(Clone, Debug)]
pub struct OverlayFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: FrameTimestamp,
    pub has_pose: bool,
}

/// Renders every dispatched cycle into a single-slot channel. A frame the
/// consumer has not picked up yet is replaced, never queued.
pub struct OverlaySink {
    tx: Sender<OverlayFrame>,
    // Kept so a stale frame can be evicted when the consumer lags.
    rx: Receiver<OverlayFrame>,
}

impl OverlaySink {
    pub fn new() -> (Self, Receiver<OverlayFrame>) {
        let (tx, rx) = bounded(1);
        (Self { tx, rx: rx.clone() }, rx)
    }
}

pub fn compose(emission: &Emission<'_>) -> Result<OverlayFrame, SinkError> {
    let frame = emission.frame;
    let expected = frame.width as usize * frame.height as usize * 4;
    if frame.rgba.len() != expected {
        return Err(SinkError::FrameSize {
            width: frame.width,
            height: frame.height,
        });
    }

    let mut rgba = frame.rgba.clone();
    if let Some(pose) = emission.pose {
        skeleton::draw_pose(&mut rgba, frame.width, frame.height, pose);
    }

    Ok(OverlayFrame {
        rgba,
        width: frame.width,
        height: frame.height,
        timestamp: emission.timestamp,
        has_pose: emission.pose.is_some(),
    })
}

impl Sink for OverlaySink {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn send(&mut self, emission: &Emission<'_>) -> Result<(), SinkError> {
        let overlay = compose(emission)?;
        match self.tx.try_send(overlay) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(overlay)) => {
                let _ = self.rx.try_recv();
                let _ = self.tx.try_send(overlay);
                Ok(())
            }
            // Nobody is watching; rendering is best effort.
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }
}
