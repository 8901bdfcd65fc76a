#[cfg(feature = "camera-nokhwa")]
pub mod camera;
pub mod detector;
pub mod dispatch;
pub mod overlay;
#[cfg(feature = "camera-nokhwa")]
pub mod rgba_converter;
pub mod scheduler;
pub mod skeleton;
pub mod smoothing;
pub mod source;

// Re-exports for convenience
#[cfg(feature = "camera-nokhwa")]
pub use camera::{CameraSource, available_cameras};
pub use detector::WorkerEngine;
pub use dispatch::Dispatcher;
pub use overlay::{OverlayFrame, OverlaySink};
pub use scheduler::{PipelineEvent, PipelineHandle};
