use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{
        ApiBackend, CameraIndex, CameraInfo, FrameFormat, RequestedFormat, RequestedFormatType,
    },
};

use super::{rgba_converter, source::FrameSource};
use crate::{
    error::CaptureError,
    types::{Frame, FrameHandle, FrameTimestamp},
};

/// Consecutive failed reads after which the device counts as disconnected.
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 30;

/// How long `stop` waits for a read stuck on a stalled device.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Decodable formats in the order they are offered to the device. Raw layouts
/// come first since they skip a decode on the capture thread.
const DECODABLE_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

/// Negotiation attempts, best first. The last ones let the backend pick any
/// format it can decode itself.
fn negotiation_plan() -> Vec<RequestedFormat<'static>> {
    let mut plan: Vec<_> = [
        RequestedFormatType::AbsoluteHighestFrameRate,
        RequestedFormatType::AbsoluteHighestResolution,
    ]
    .into_iter()
    .map(|strategy| RequestedFormat::with_formats(strategy, DECODABLE_FORMATS))
    .collect();
    plan.push(RequestedFormat::new::<RgbFormat>(
        RequestedFormatType::AbsoluteHighestFrameRate,
    ));
    plan.push(RequestedFormat::new::<RgbFormat>(RequestedFormatType::None));
    plan
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: CameraIndex,
    pub name: String,
}

impl CameraDevice {
    fn from_info(info: &CameraInfo) -> Self {
        Self {
            index: info.index().clone(),
            name: info.human_name(),
        }
    }

    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.index)
    }
}

pub fn available_cameras() -> Result<Vec<CameraDevice>> {
    Ok(query(ApiBackend::Auto)?
        .iter()
        .map(CameraDevice::from_info)
        .collect())
}

/// Opens `index` with the first format in [`negotiation_plan`] the device
/// accepts and starts streaming.
fn open_stream(index: &CameraIndex) -> Result<Camera> {
    let mut failures = Vec::new();

    for requested in negotiation_plan() {
        let attempt = Camera::new(index.clone(), requested).and_then(|mut camera| {
            camera.open_stream()?;
            Ok(camera)
        });
        match attempt {
            Ok(camera) => {
                log::info!(
                    "camera {index} streaming {} ({})",
                    camera.camera_format(),
                    camera.info().human_name()
                );
                return Ok(camera);
            }
            Err(err) => {
                log::debug!("camera {index} rejected format request: {err}");
                failures.push(err.to_string());
            }
        }
    }

    Err(anyhow!(
        "no usable stream format for camera {index}: {}",
        failures.join("; ")
    ))
}

#[derive(Default)]
struct SharedState {
    latest: Mutex<Option<FrameHandle>>,
    failure: Mutex<Option<String>>,
}

/// Live camera feed captured on its own thread into a latest-frame slot.
#[derive(Debug)]
pub struct CameraSource {
    shared: Arc<SharedState>,
    stop: Arc<AtomicBool>,
    exited_rx: Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState").finish_non_exhaustive()
    }
}

impl CameraSource {
    pub fn open(index: u32) -> Result<Self, CaptureError> {
        let index = CameraIndex::Index(index);

        // Probe synchronously so a missing or denied device fails the caller;
        // the capture thread reopens it because the handle is not `Send`.
        open_stream(&index).map_err(|err| CaptureError::Unavailable(format!("{err:#}")))?;

        let shared = Arc::new(SharedState::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = bounded::<()>(0);

        let thread_shared = shared.clone();
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                // Dropped on exit, which is what `shutdown` waits for.
                let _exited = exited_tx;
                capture_loop(index, &thread_shared, &stop_flag);
            })
            .map_err(|err| {
                CaptureError::Unavailable(format!("failed to spawn capture thread: {err}"))
            })?;

        Ok(Self {
            shared,
            stop,
            exited_rx,
            handle: Some(handle),
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if await_exit(&self.exited_rx, SHUTDOWN_GRACE) {
            let _ = handle.join();
        } else {
            log::warn!("camera capture still blocked after {SHUTDOWN_GRACE:?}, detaching it");
        }
    }
}

fn capture_loop(index: CameraIndex, shared: &SharedState, stop: &AtomicBool) {
    let mut camera = match open_stream(&index) {
        Ok(camera) => camera,
        Err(err) => {
            log::error!("camera reopen failed: {err:#}");
            set_failure(shared, format!("{err:#}"));
            return;
        }
    };

    let epoch = Instant::now();
    let mut last_timestamp: Option<FrameTimestamp> = None;
    let mut consecutive_failures = 0u32;

    while !stop.load(Ordering::Relaxed) {
        let buffer = match camera.frame() {
            Ok(buffer) => buffer,
            Err(err) => {
                consecutive_failures += 1;
                if consecutive_failures == 1 {
                    log::warn!("camera frame read failed: {err}");
                } else {
                    log::debug!(
                        "camera frame read failed ({consecutive_failures} in a row): {err}"
                    );
                }
                if consecutive_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                    set_failure(
                        shared,
                        format!("{consecutive_failures} consecutive read failures, last: {err}"),
                    );
                    break;
                }
                continue;
            }
        };
        consecutive_failures = 0;

        let converted = rgba_converter::convert_camera_frame(&buffer).inspect_err(|err| {
            log::warn!(
                "dropping undecodable {:?} frame: {err:#}",
                buffer.source_frame_format()
            );
        });
        let Ok(converted) = converted else {
            continue;
        };

        // Keep timestamps strictly increasing even if two reads land in the same microsecond.
        let mut timestamp = FrameTimestamp::from_elapsed(epoch.elapsed());
        if let Some(last) = last_timestamp {
            if timestamp <= last {
                timestamp = FrameTimestamp::from_micros(last.as_micros() + 1);
            }
        }
        last_timestamp = Some(timestamp);

        let frame = Arc::new(Frame {
            rgba: converted.rgba,
            width: converted.width,
            height: converted.height,
            timestamp,
        });
        *shared.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    if let Err(err) = camera.stop_stream() {
        log::warn!("failed to stop camera stream: {err:?}");
    }
    log::info!("camera capture stopped");
}

/// Waits up to `grace` for the capture thread to drop its end of `exited`.
fn await_exit(exited: &Receiver<()>, grace: Duration) -> bool {
    match exited.recv_timeout(grace) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

fn set_failure(shared: &SharedState, reason: String) {
    *shared.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
}

impl FrameSource for CameraSource {
    fn current_frame(&mut self) -> Result<Option<FrameHandle>, CaptureError> {
        if let Some(reason) = self
            .shared
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(CaptureError::Disconnected(reason));
        }
        if self.handle.is_none() {
            return Ok(None);
        }
        Ok(self
            .shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn stop(&mut self) {
        self.shutdown();
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}
