use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("camera disconnected: {0}")]
    Disconnected(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("detection engine failed to initialize: {0}")]
    Init(String),
    #[error("failed to spawn detection worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Rejection of a `detect` call. Never fatal on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DetectError {
    #[error("a detection is already in flight")]
    Busy,
    #[error("detection engine has stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    Disconnected,
    #[error("outbound queue is full")]
    Backpressure,
    #[error("transport has been shut down")]
    Closed,
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message codec error: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("frame buffer does not match {width}x{height}")]
    FrameSize { width: u32, height: u32 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors that end a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("detection engine stopped unexpectedly")]
    EngineStopped,
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("pipeline thread panicked")]
    Panicked,
}
