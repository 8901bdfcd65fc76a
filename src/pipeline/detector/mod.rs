pub mod common;
pub mod ort;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded, select};

use crate::{
    error::{DetectError, EngineError},
    types::{Frame, FrameHandle, FrameTimestamp, PoseResult},
};

/// How long `shutdown` waits for a busy estimator before detaching it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Result of one accepted `detect` call.
#[derive(Debug)]
pub struct Detection {
    pub timestamp: FrameTimestamp,
    pub outcome: anyhow::Result<Vec<PoseResult>>,
}

/// Asynchronous pose detection with at most one call outstanding.
///
/// Every accepted [`detect`](DetectionEngine::detect) produces exactly one
/// [`Detection`] on the channel returned by
/// [`completions`](DetectionEngine::completions).
pub trait DetectionEngine {
    fn detect(&mut self, frame: FrameHandle, timestamp: FrameTimestamp) -> Result<(), DetectError>;

    fn completions(&self) -> Receiver<Detection>;

    fn shutdown(&mut self);
}

/// Blocking estimator run on the detection worker thread.
pub trait PoseEstimator: Send + 'static {
    fn estimate(
        &mut self,
        frame: &Frame,
        timestamp: FrameTimestamp,
    ) -> anyhow::Result<Vec<PoseResult>>;
}

struct DetectionRequest {
    frame: FrameHandle,
    timestamp: FrameTimestamp,
}

/// Runs a [`PoseEstimator`] on a dedicated thread behind a capacity-one
/// request slot.
///
/// The slot stays taken from an accepted `detect` until the worker hands
/// over its completion, so a second call in between is rejected as busy.
pub struct WorkerEngine {
    request_tx: Option<Sender<DetectionRequest>>,
    outstanding: Arc<AtomicBool>,
    completion_rx: Receiver<Detection>,
    exited_rx: Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerEngine {
    /// Spawns the worker and waits until `init` has built the estimator.
    pub fn start<E, F>(name: &str, init: F) -> Result<Self, EngineError>
    where
        E: PoseEstimator,
        F: FnOnce() -> anyhow::Result<E> + Send + 'static,
    {
        let (request_tx, request_rx) = bounded::<DetectionRequest>(1);
        let (completion_tx, completion_rx) = bounded::<Detection>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let (exited_tx, exited_rx) = bounded::<()>(0);
        let outstanding = Arc::new(AtomicBool::new(false));
        let worker_outstanding = outstanding.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // Held for the thread's lifetime; dropping it tells `shutdown` we are done.
                let _exited = exited_tx;

                let estimator = match init() {
                    Ok(estimator) => {
                        let _ = ready_tx.send(Ok(()));
                        estimator
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(format!("{err:#}")));
                        return;
                    }
                };

                run_worker_loop(estimator, request_rx, completion_tx, &worker_outstanding);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("detection engine {name} ready");
                Ok(Self {
                    request_tx: Some(request_tx),
                    outstanding,
                    completion_rx,
                    exited_rx,
                    handle: Some(handle),
                })
            }
            Ok(Err(reason)) => {
                let _ = handle.join();
                Err(EngineError::Init(reason))
            }
            Err(_) => {
                let _ = handle.join();
                Err(EngineError::Init("worker exited during initialization".to_string()))
            }
        }
    }
}

fn run_worker_loop<E: PoseEstimator>(
    mut estimator: E,
    request_rx: Receiver<DetectionRequest>,
    completion_tx: Sender<Detection>,
    outstanding: &AtomicBool,
) {
    while let Ok(request) = request_rx.recv() {
        let started = Instant::now();
        let outcome = estimator.estimate(&request.frame, request.timestamp);
        log::trace!(
            "estimate for frame {} took {:?}",
            request.timestamp,
            started.elapsed()
        );

        let detection = Detection {
            timestamp: request.timestamp,
            outcome,
        };
        // Released before the hand-over so a caller that has received the
        // completion always finds the slot free.
        outstanding.store(false, Ordering::Release);
        if completion_tx.send(detection).is_err() {
            break;
        }
    }
}

impl DetectionEngine for WorkerEngine {
    fn detect(&mut self, frame: FrameHandle, timestamp: FrameTimestamp) -> Result<(), DetectError> {
        let Some(tx) = self.request_tx.as_ref() else {
            return Err(DetectError::Stopped);
        };
        if self
            .outstanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A worker that died mid-call never releases the slot.
            if matches!(self.exited_rx.try_recv(), Err(TryRecvError::Disconnected)) {
                return Err(DetectError::Stopped);
            }
            return Err(DetectError::Busy);
        }

        tx.try_send(DetectionRequest { frame, timestamp })
            .map_err(|err| {
                self.outstanding.store(false, Ordering::Release);
                match err {
                    TrySendError::Full(_) => DetectError::Busy,
                    TrySendError::Disconnected(_) => DetectError::Stopped,
                }
            })
    }

    fn completions(&self) -> Receiver<Detection> {
        self.completion_rx.clone()
    }

    fn shutdown(&mut self) {
        if self.request_tx.take().is_none() && self.handle.is_none() {
            return;
        }

        // Completions are drained while waiting so a worker blocked on handing
        // one over can still reach its exit.
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(self.exited_rx) -> _ => break,
                recv(self.completion_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                }
                default(remaining) => {
                    log::warn!(
                        "detection worker still busy after {SHUTDOWN_GRACE:?}, detaching it"
                    );
                    self.handle.take();
                    return;
                }
            }
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
