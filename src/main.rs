mod config;
mod error;
mod pipeline;
mod transport;
mod types;

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};

use config::{CameraConfig, Config};
use pipeline::{
    Dispatcher, OverlayFrame, OverlaySink, PipelineEvent, PipelineHandle, WorkerEngine,
    detector::ort::OrtPoseEstimator,
};
use transport::{ServerMessage, TransportClient, TransportSink};

const DEFAULT_CONFIG_PATH: &str = "pose-stream.toml";
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);
const SINK_WARNING_INTERVAL: Duration = Duration::from_secs(5);
const INBOUND_CAPACITY: usize = 16;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load config {config_path}"))?;
    log::info!(
        "[config] camera={} fps={} smoothing={} (alpha {}) mode={:?} transport={}",
        config.camera.index,
        config.pipeline.effective_fps(),
        config.pipeline.smoothing_enabled,
        config.pipeline.smoothing_factor,
        config.pipeline.transport_mode,
        if config.transport.enabled {
            config.transport.addr.as_str()
        } else {
            "off"
        }
    );

    let engine_config = config.engine.clone();
    let engine = WorkerEngine::start("pose-detector", move || {
        OrtPoseEstimator::new(&engine_config)
    })
    .context("failed to start the detection engine")?;

    let source = open_camera(&config.camera)?;

    let mut dispatcher = Dispatcher::new();
    let inbound_logger = if config.transport.enabled {
        let (inbound_tx, inbound_rx) = bounded(INBOUND_CAPACITY);
        let client = TransportClient::connect(config.transport.addr.clone(), inbound_tx)
            .context("failed to start the transport")?;
        dispatcher.add_sink(TransportSink::new(
            client,
            config.pipeline.transport_mode,
            config.transport.jpeg_quality,
        ));
        Some(spawn_inbound_logger(inbound_rx)?)
    } else {
        None
    };
    let overlay_writer = if config.render.enabled {
        let (sink, overlays) = OverlaySink::new();
        dispatcher.add_sink(sink);
        Some(spawn_overlay_writer(overlays, config.render.snapshot_path.clone())?)
    } else {
        None
    };

    if dispatcher.is_empty() {
        log::warn!("transport and rendering are both disabled, detections go nowhere");
    } else {
        log::info!("dispatching to {} sink(s): {dispatcher:?}", dispatcher.len());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))?;
    }

    let mut pipeline = PipelineHandle::spawn(&config.pipeline, source, engine, dispatcher)?;
    wait_for_exit(&pipeline, &shutdown);

    log::info!("shutting down");
    // Stopping the pipeline drops its sinks, which closes the transport and
    // the overlay channel behind them.
    let outcome = pipeline.stop();
    for (name, handle) in [("inbound logger", inbound_logger), ("overlay writer", overlay_writer)] {
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("{name} thread panicked");
            }
        }
    }

    match outcome {
        Some(Ok(stats)) => {
            log::info!(
                "done: {} cycles, {} detections, {} dispatched",
                stats.ticks,
                stats.submitted,
                stats.dispatched
            );
            Ok(())
        }
        Some(Err(err)) => Err(err).context("pipeline stopped with an error"),
        None => Ok(()),
    }
}

/// Blocks until a signal arrives or the pipeline ends on its own.
fn wait_for_exit(pipeline: &PipelineHandle, shutdown: &AtomicBool) {
    let mut last_sink_warning: Option<Instant> = None;
    let mut suppressed = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        match pipeline.events().recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(PipelineEvent::CaptureLost(err)) => log::error!("camera lost, stopping: {err}"),
            Ok(PipelineEvent::EngineStopped) => log::error!("detection engine died, stopping"),
            Ok(PipelineEvent::SinkFailed { timestamp, failure }) => {
                if last_sink_warning.is_some_and(|at| at.elapsed() < SINK_WARNING_INTERVAL) {
                    suppressed += 1;
                    continue;
                }
                log::warn!(
                    "{} sink failed at {timestamp}: {} ({suppressed} similar failures suppressed)",
                    failure.sink,
                    failure.error
                );
                last_sink_warning = Some(Instant::now());
                suppressed = 0;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(feature = "camera-nokhwa")]
fn open_camera(camera: &CameraConfig) -> Result<pipeline::CameraSource> {
    match pipeline::available_cameras() {
        Ok(devices) => {
            for device in devices {
                log::info!("[camera] found {}", device.label());
            }
        }
        Err(err) => log::warn!("[camera] failed to enumerate devices: {err:#}"),
    }

    let source = pipeline::CameraSource::open(camera.index)
        .with_context(|| format!("failed to open camera {}", camera.index))?;
    log::info!("[camera] capturing from device {}", camera.index);
    Ok(source)
}

#[cfg(not(feature = "camera-nokhwa"))]
enum NoCamera {}

#[cfg(not(feature = "camera-nokhwa"))]
impl pipeline::source::FrameSource for NoCamera {
    fn current_frame(&mut self) -> Result<Option<types::FrameHandle>, error::CaptureError> {
        match *self {}
    }
}

#[cfg(not(feature = "camera-nokhwa"))]
fn open_camera(_camera: &CameraConfig) -> Result<NoCamera> {
    anyhow::bail!("built without camera support, enable the `camera-nokhwa` feature")
}

fn spawn_inbound_logger(messages: Receiver<ServerMessage>) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("inbound-log".to_string())
        .spawn(move || {
            for msg in messages.iter() {
                match msg {
                    ServerMessage::FrameResult {
                        classification,
                        timestamp_ns,
                        processing_time_s,
                    } => log::info!(
                        "[server] classification={classification:?} at {timestamp_ns}ns ({processing_time_s:.3}s)"
                    ),
                    ServerMessage::Error { message } => log::warn!("[server] error: {message}"),
                }
            }
        })?;
    Ok(handle)
}

fn spawn_overlay_writer(
    overlays: Receiver<OverlayFrame>,
    snapshot_path: Option<PathBuf>,
) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("overlay-writer".to_string())
        .spawn(move || {
            let mut last_write: Option<Instant> = None;
            let mut rendered = 0u64;

            for overlay in overlays.iter() {
                rendered += 1;
                let Some(path) = snapshot_path.as_deref() else {
                    continue;
                };
                if last_write.is_some_and(|at| at.elapsed() < SNAPSHOT_INTERVAL) {
                    continue;
                }
                last_write = Some(Instant::now());
                if let Err(err) = write_snapshot(path, overlay) {
                    log::warn!("[render] {err:#}");
                }
            }
            log::debug!("[render] overlay writer stopped after {rendered} frames");
        })?;
    Ok(handle)
}

fn write_snapshot(path: &Path, overlay: OverlayFrame) -> Result<()> {
    let image = image::RgbaImage::from_raw(overlay.width, overlay.height, overlay.rgba)
        .context("overlay buffer does not match its dimensions")?;
    image
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write overlay snapshot {}", path.display()))?;
    Ok(())
}
