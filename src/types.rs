use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

/// Monotonic capture time in microseconds since the capture stream started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameTimestamp(u64);

impl FrameTimestamp {
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    pub fn from_elapsed(elapsed: Duration) -> Self {
        Self(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.0 as f64 / 1_000.0)
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: FrameTimestamp,
}

/// Shared, read-only view of a captured frame.
pub type FrameHandle = Arc<Frame>;

/// One tracked point in detection-engine space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Landmarks of one subject in one frame. Index `i` always names the same
/// anatomical point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoseResult {
    landmarks: Vec<Landmark>,
}

impl PoseResult {
    pub fn new(landmarks: Vec<Landmark>) -> Self {
        Self { landmarks }
    }

    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }
}

impl From<Vec<Landmark>> for PoseResult {
    fn from(landmarks: Vec<Landmark>) -> Self {
        Self::new(landmarks)
    }
}

/// BlazePose body landmark indices (33 total).
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum BodyLandmark {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

impl BodyLandmark {
    pub const COUNT: usize = 33;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_order_by_capture_time() {
        let a = FrameTimestamp::from_millis(10);
        let b = FrameTimestamp::from_elapsed(Duration::from_micros(10_001));
        assert!(a < b);
        assert_eq!(a.as_micros(), 10_000);
        assert_eq!(a.to_string(), "10.000ms");
    }

    #[test]
    fn pose_result_serializes_as_plain_landmark_list() {
        let pose = PoseResult::new(vec![Landmark::new(0.5, 0.25, -0.1)]);
        let bytes = bincode::serialize(&pose).unwrap();
        let landmarks: Vec<Landmark> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(landmarks, pose.landmarks());
    }
}
