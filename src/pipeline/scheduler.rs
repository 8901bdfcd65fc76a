use std::{
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select, tick};

use super::{
    detector::{Detection, DetectionEngine},
    dispatch::{Dispatcher, Emission, SinkFailure},
    smoothing::SmoothingFilter,
    source::FrameSource,
};
use crate::{
    config::PipelineConfig,
    error::{CaptureError, DetectError, PipelineError},
    types::{FrameHandle, FrameTimestamp, PoseResult},
};

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub ticks: u64,
    pub submitted: u64,
    pub dispatched: u64,
    pub busy_skips: u64,
    pub stale_skips: u64,
    pub unavailable_skips: u64,
    pub detection_failures: u64,
    pub sink_failures: u64,
}

/// Notifications for whoever owns the pipeline.
#[derive(Debug)]
pub enum PipelineEvent {
    CaptureLost(CaptureError),
    EngineStopped,
    SinkFailed {
        timestamp: FrameTimestamp,
        failure: SinkFailure,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Submitted(FrameTimestamp),
    /// A detection is still in flight.
    Busy,
    /// No frame available yet.
    Unavailable,
    /// The latest frame was already submitted.
    Stale,
    Rejected(DetectError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionOutcome {
    Dispatched { has_pose: bool },
    Failed,
    Discarded,
}

/// Paces frame acquisition, keeps at most one detection in flight, and
/// smooths and dispatches every completed detection.
///
/// All state lives on the thread that calls [`run`](Self::run); the
/// [`on_tick`](Self::on_tick) and [`on_completion`](Self::on_completion) steps
/// are public so the state machine can be driven directly.
pub struct PipelineScheduler<S, E> {
    source: S,
    engine: E,
    completions: Receiver<Detection>,
    filter: Option<SmoothingFilter>,
    dispatcher: Dispatcher,
    events: Sender<PipelineEvent>,
    interval: Duration,
    reset_after_missed: u32,
    in_flight: Option<FrameHandle>,
    last_submitted: Option<FrameTimestamp>,
    last_processed: Option<FrameTimestamp>,
    missed_streak: u32,
    live: bool,
    stats: CycleStats,
}

impl<S: FrameSource, E: DetectionEngine> PipelineScheduler<S, E> {
    pub fn new(
        config: &PipelineConfig,
        source: S,
        engine: E,
        dispatcher: Dispatcher,
        events: Sender<PipelineEvent>,
    ) -> Self {
        let completions = engine.completions();
        let filter = config
            .smoothing_enabled
            .then(|| SmoothingFilter::new(config.smoothing_factor));

        Self {
            source,
            engine,
            completions,
            filter,
            dispatcher,
            events,
            interval: config.target_interval(),
            reset_after_missed: config.reset_after_missed,
            in_flight: None,
            last_submitted: None,
            last_processed: None,
            missed_streak: 0,
            live: true,
            stats: CycleStats::default(),
        }
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn last_processed(&self) -> Option<FrameTimestamp> {
        self.last_processed
    }

    /// One pacing cycle. Only a lost capture device is an error.
    pub fn on_tick(&mut self) -> Result<TickOutcome, PipelineError> {
        self.stats.ticks += 1;

        if self.in_flight.is_some() {
            self.stats.busy_skips += 1;
            return Ok(TickOutcome::Busy);
        }

        let frame = match self.source.current_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.stats.unavailable_skips += 1;
                return Ok(TickOutcome::Unavailable);
            }
            Err(err) => {
                log::error!("capture lost: {err}");
                self.report(PipelineEvent::CaptureLost(err.clone()));
                return Err(err.into());
            }
        };

        let timestamp = frame.timestamp;
        if self.last_submitted.is_some_and(|last| timestamp <= last) {
            self.stats.stale_skips += 1;
            return Ok(TickOutcome::Stale);
        }

        match self.engine.detect(frame.clone(), timestamp) {
            Ok(()) => {
                log::trace!("submitted frame {timestamp}");
                self.in_flight = Some(frame);
                self.last_submitted = Some(timestamp);
                self.stats.submitted += 1;
                Ok(TickOutcome::Submitted(timestamp))
            }
            Err(err) => {
                log::warn!("detection rejected for frame {timestamp}: {err}");
                self.stats.detection_failures += 1;
                Ok(TickOutcome::Rejected(err))
            }
        }
    }

    pub fn on_completion(&mut self, detection: Detection) -> CompletionOutcome {
        let timestamp = detection.timestamp;
        if !self.live {
            log::debug!("dropping completion for frame {timestamp} after teardown");
            return CompletionOutcome::Discarded;
        }
        let Some(frame) = self.in_flight.take_if(|frame| frame.timestamp == timestamp) else {
            log::warn!("dropping completion for frame {timestamp} that is not in flight");
            return CompletionOutcome::Discarded;
        };

        let poses = match detection.outcome {
            Ok(poses) => poses,
            Err(err) => {
                log::warn!("detection failed for frame {timestamp}: {err:#}");
                self.stats.detection_failures += 1;
                return CompletionOutcome::Failed;
            }
        };

        // One tracked subject per pipeline.
        let pose = self.smooth(poses.into_iter().next());
        let failures = self.dispatcher.emit(&Emission {
            timestamp,
            frame: &frame,
            pose: pose.as_ref(),
        });
        self.stats.dispatched += 1;
        self.last_processed = Some(timestamp);

        for failure in failures {
            self.stats.sink_failures += 1;
            self.report(PipelineEvent::SinkFailed { timestamp, failure });
        }

        CompletionOutcome::Dispatched {
            has_pose: pose.is_some(),
        }
    }

    fn smooth(&mut self, raw: Option<PoseResult>) -> Option<PoseResult> {
        let Some(filter) = self.filter.as_mut() else {
            return raw;
        };

        if raw.is_some() {
            self.missed_streak = 0;
        } else {
            self.missed_streak = self.missed_streak.saturating_add(1);
            if self.missed_streak == self.reset_after_missed && filter.is_seeded() {
                log::debug!(
                    "no subject for {} detections, resetting smoothing",
                    self.missed_streak
                );
                filter.reset();
            }
        }

        filter.apply(raw)
    }

    fn report(&self, event: PipelineEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            log::debug!("event queue full, dropping {event:?}");
        }
    }

    /// Marks the pipeline dead, then releases the engine and the capture
    /// device. Safe to call more than once.
    pub fn teardown(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        self.in_flight = None;
        self.engine.shutdown();
        self.source.stop();
    }

    /// Drives the pipeline until `shutdown` fires (or disconnects), the
    /// capture device is lost, or the engine dies.
    pub fn run(mut self, shutdown: Receiver<()>) -> Result<CycleStats, PipelineError> {
        log::info!(
            "pipeline running every {:?} (smoothing {})",
            self.interval,
            if self.filter.is_some() { "on" } else { "off" }
        );

        let ticker = tick(self.interval);
        let completions = self.completions.clone();
        let mut last_report = Instant::now();

        let result = loop {
            select! {
                recv(shutdown) -> _ => break Ok(()),
                recv(ticker) -> _ => {
                    if let Err(err) = self.on_tick() {
                        break Err(err);
                    }
                }
                recv(completions) -> detection => match detection {
                    Ok(detection) => {
                        self.on_completion(detection);
                    }
                    Err(_) => {
                        log::error!("detection engine stopped delivering results");
                        self.report(PipelineEvent::EngineStopped);
                        break Err(PipelineError::EngineStopped);
                    }
                },
            }

            if last_report.elapsed() >= STATS_LOG_INTERVAL {
                log::debug!("pipeline stats: {:?}", self.stats);
                last_report = Instant::now();
            }
        };

        self.teardown();
        log::info!("pipeline stopped: {:?}", self.stats);
        result.map(|()| self.stats)
    }
}

/// A [`PipelineScheduler`] running on its own thread. Dropping the handle
/// stops the pipeline and waits for its teardown.
pub struct PipelineHandle {
    shutdown_tx: Option<Sender<()>>,
    events: Receiver<PipelineEvent>,
    handle: Option<thread::JoinHandle<Result<CycleStats, PipelineError>>>,
}

impl PipelineHandle {
    pub fn spawn<S, E>(
        config: &PipelineConfig,
        source: S,
        engine: E,
        dispatcher: Dispatcher,
    ) -> Result<Self, PipelineError>
    where
        S: FrameSource + Send + 'static,
        E: DetectionEngine + Send + 'static,
    {
        let (events_tx, events) = bounded(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let scheduler = PipelineScheduler::new(config, source, engine, dispatcher, events_tx);

        let handle = thread::Builder::new()
            .name("pipeline-scheduler".to_string())
            .spawn(move || scheduler.run(shutdown_rx))?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            events,
            handle: Some(handle),
        })
    }

    /// Owner notifications. Disconnects once the pipeline thread has ended.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    /// Stops the pipeline and returns how the run ended, or `None` if it was
    /// already stopped.
    pub fn stop(&mut self) -> Option<Result<CycleStats, PipelineError>> {
        drop(self.shutdown_tx.take());
        let handle = self.handle.take()?;
        Some(handle.join().unwrap_or_else(|_| Err(PipelineError::Panicked)))
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use anyhow::anyhow;
    use crossbeam_channel::unbounded;

    use super::*;
    use crate::{
        error::{SinkError, TransportError},
        pipeline::dispatch::Sink,
        types::{Frame, Landmark},
    };

    fn frame_at(ts: FrameTimestamp) -> FrameHandle {
        Arc::new(Frame {
            rgba: vec![0; 4],
            width: 1,
            height: 1,
            timestamp: ts,
        })
    }

    fn ms(value: u64) -> FrameTimestamp {
        FrameTimestamp::from_millis(value)
    }

    fn pose(x: f32) -> PoseResult {
        PoseResult::new(vec![Landmark::new(x, x, 0.0); 3])
    }

    #[derive(Default)]
    struct SourceState {
        frame: Option<FrameHandle>,
        failure: Option<CaptureError>,
        stopped: bool,
    }

    /// Frame source whose current frame is set by the test.
    #[derive(Clone, Default)]
    struct TestSource(Arc<Mutex<SourceState>>);

    impl TestSource {
        fn show(&self, ts: FrameTimestamp) {
            self.0.lock().unwrap().frame = Some(frame_at(ts));
        }

        fn fail(&self) {
            self.0.lock().unwrap().failure =
                Some(CaptureError::Disconnected("unplugged".to_string()));
        }

        fn stopped(&self) -> bool {
            self.0.lock().unwrap().stopped
        }
    }

    impl FrameSource for TestSource {
        fn current_frame(&mut self) -> Result<Option<FrameHandle>, CaptureError> {
            let state = self.0.lock().unwrap();
            if let Some(err) = &state.failure {
                return Err(err.clone());
            }
            Ok(state.frame.clone())
        }

        fn stop(&mut self) {
            self.0.lock().unwrap().stopped = true;
        }
    }

    /// Produces a fresh frame on every call.
    struct LiveSource {
        epoch: Instant,
    }

    impl FrameSource for LiveSource {
        fn current_frame(&mut self) -> Result<Option<FrameHandle>, CaptureError> {
            Ok(Some(frame_at(FrameTimestamp::from_elapsed(
                self.epoch.elapsed(),
            ))))
        }
    }

    #[derive(Clone, Copy)]
    enum Completion {
        /// The test feeds completions to the scheduler itself.
        Manual,
        After(Duration),
        Never,
        /// Completion channel is already disconnected.
        Dead,
    }

    #[derive(Default)]
    struct EngineProbe {
        submitted: Mutex<Vec<FrameTimestamp>>,
        outstanding: AtomicUsize,
        overlapping: AtomicUsize,
        shut_down: AtomicBool,
    }

    impl EngineProbe {
        fn submitted(&self) -> Vec<FrameTimestamp> {
            self.submitted.lock().unwrap().clone()
        }
    }

    /// Engine double that records every call and counts overlapping ones.
    struct TestEngine {
        mode: Completion,
        probe: Arc<EngineProbe>,
        tx: Option<Sender<Detection>>,
        rx: Receiver<Detection>,
    }

    impl TestEngine {
        fn new(mode: Completion) -> (Self, Arc<EngineProbe>) {
            let (tx, rx) = unbounded();
            let probe = Arc::new(EngineProbe::default());
            let tx = match mode {
                Completion::Dead => None,
                _ => Some(tx),
            };
            (
                Self {
                    mode,
                    probe: probe.clone(),
                    tx,
                    rx,
                },
                probe,
            )
        }
    }

    impl DetectionEngine for TestEngine {
        fn detect(
            &mut self,
            _frame: FrameHandle,
            timestamp: FrameTimestamp,
        ) -> Result<(), DetectError> {
            if self.probe.outstanding.fetch_add(1, Ordering::SeqCst) > 0 {
                self.probe.overlapping.fetch_add(1, Ordering::SeqCst);
            }
            self.probe.submitted.lock().unwrap().push(timestamp);

            if let (Completion::After(latency), Some(tx)) = (self.mode, self.tx.clone()) {
                let probe = self.probe.clone();
                thread::spawn(move || {
                    thread::sleep(latency);
                    probe.outstanding.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(Detection {
                        timestamp,
                        outcome: Ok(vec![pose(0.5)]),
                    });
                });
            }
            Ok(())
        }

        fn completions(&self) -> Receiver<Detection> {
            self.rx.clone()
        }

        fn shutdown(&mut self) {
            self.probe.shut_down.store(true, Ordering::SeqCst);
        }
    }

    type Recorded = Arc<Mutex<Vec<(FrameTimestamp, Option<PoseResult>)>>>;

    #[derive(Default)]
    struct Recorder {
        seen: Recorded,
    }

    impl Sink for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn send(&mut self, emission: &Emission<'_>) -> Result<(), SinkError> {
            self.seen
                .lock()
                .unwrap()
                .push((emission.timestamp, emission.pose.cloned()));
            Ok(())
        }
    }

    struct Broken;

    impl Sink for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn send(&mut self, _emission: &Emission<'_>) -> Result<(), SinkError> {
            Err(TransportError::Disconnected.into())
        }
    }

    struct Harness {
        scheduler: PipelineScheduler<TestSource, TestEngine>,
        source: TestSource,
        probe: Arc<EngineProbe>,
        seen: Recorded,
        events: Receiver<PipelineEvent>,
    }

    impl Harness {
        fn new(config: PipelineConfig) -> Self {
            Self::with_dispatcher(config, Dispatcher::new())
        }

        fn with_dispatcher(config: PipelineConfig, dispatcher: Dispatcher) -> Self {
            let source = TestSource::default();
            let (engine, probe) = TestEngine::new(Completion::Manual);
            let recorder = Recorder::default();
            let seen = recorder.seen.clone();
            let (events_tx, events) = bounded(EVENT_CAPACITY);
            let scheduler = PipelineScheduler::new(
                &config,
                source.clone(),
                engine,
                dispatcher.with_sink(recorder),
                events_tx,
            );
            Self {
                scheduler,
                source,
                probe,
                seen,
                events,
            }
        }

        fn finish(
            &mut self,
            ts: FrameTimestamp,
            outcome: anyhow::Result<Vec<PoseResult>>,
        ) -> CompletionOutcome {
            self.probe.outstanding.fetch_sub(1, Ordering::SeqCst);
            self.scheduler.on_completion(Detection {
                timestamp: ts,
                outcome,
            })
        }

        /// Submits a fresh frame and completes it with `poses`.
        fn cycle(&mut self, ts: FrameTimestamp, poses: Vec<PoseResult>) -> CompletionOutcome {
            self.source.show(ts);
            assert_eq!(self.scheduler.on_tick().unwrap(), TickOutcome::Submitted(ts));
            self.finish(ts, Ok(poses))
        }

        fn seen(&self) -> Vec<(FrameTimestamp, Option<PoseResult>)> {
            self.seen.lock().unwrap().clone()
        }

        fn last_x(&self) -> Option<f32> {
            self.seen()
                .last()
                .and_then(|(_, pose)| pose.as_ref().map(|pose| pose.landmarks()[0].x))
        }
    }

    fn config(target_fps: f64, smoothing_factor: f32) -> PipelineConfig {
        PipelineConfig {
            target_fps,
            smoothing_factor,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn two_spaced_frames_are_detected_and_dispatched_in_order() {
        // 10 fps ticks at 0, 100, 200, 300 ms; frames at 0 and 150 ms; the
        // engine finishes well within one interval.
        let mut h = Harness::new(config(10.0, 0.5));

        h.source.show(ms(0));
        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Submitted(ms(0)));
        assert_eq!(
            h.finish(ms(0), Ok(vec![pose(0.2)])),
            CompletionOutcome::Dispatched { has_pose: true }
        );

        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Stale);

        h.source.show(ms(150));
        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Submitted(ms(150)));
        assert_eq!(
            h.finish(ms(150), Ok(vec![pose(0.2)])),
            CompletionOutcome::Dispatched { has_pose: true }
        );

        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Stale);

        let order: Vec<_> = h.seen().into_iter().map(|(ts, _)| ts).collect();
        assert_eq!(order, vec![ms(0), ms(150)]);
        assert_eq!(h.probe.submitted(), vec![ms(0), ms(150)]);
        assert_eq!(h.scheduler.last_processed(), Some(ms(150)));
        let stats = h.scheduler.stats();
        assert_eq!((stats.ticks, stats.submitted, stats.dispatched), (4, 2, 2));
        assert_eq!(h.probe.overlapping.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn paced_run_detects_two_spaced_frames_once_each() {
        // Same scenario on a live 10 fps loop with a 20 ms engine: the first
        // frame is up before the first tick, the second appears 150 ms later.
        let (engine, probe) = TestEngine::new(Completion::After(Duration::from_millis(20)));
        let source = TestSource::default();
        let recorder = Recorder::default();
        let seen = recorder.seen.clone();

        source.show(ms(0));
        let mut handle = PipelineHandle::spawn(
            &config(10.0, 0.5),
            source.clone(),
            engine,
            Dispatcher::new().with_sink(recorder),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(150));
        source.show(ms(150));
        thread::sleep(Duration::from_millis(300));
        let stats = handle.stop().unwrap().unwrap();

        assert_eq!(probe.submitted(), vec![ms(0), ms(150)]);
        assert_eq!((stats.submitted, stats.dispatched), (2, 2), "{stats:?}");
        assert!(stats.stale_skips >= 1, "{stats:?}");
        assert_eq!(probe.overlapping.load(Ordering::SeqCst), 0);

        let seen = seen.lock().unwrap();
        let order: Vec<_> = seen.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(order, vec![ms(0), ms(150)]);
        assert!(seen.iter().all(|(_, pose)| pose.is_some()));
        assert!(source.stopped());
    }

    #[test]
    fn busy_cycles_skip_the_source_and_engine() {
        let mut h = Harness::new(PipelineConfig::default());

        h.source.show(ms(0));
        h.scheduler.on_tick().unwrap();
        h.source.show(ms(10));
        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Busy);
        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Busy);
        assert_eq!(h.probe.submitted(), vec![ms(0)]);
        assert_eq!(h.scheduler.stats().busy_skips, 2);

        h.finish(ms(0), Ok(vec![]));
        assert!(!h.scheduler.is_in_flight());
        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Submitted(ms(10)));
        assert_eq!(h.probe.overlapping.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn never_resubmits_a_seen_timestamp() {
        let mut h = Harness::new(PipelineConfig::default());

        h.cycle(ms(5), vec![pose(0.1)]);
        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Stale);
        h.source.show(ms(3));
        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Stale);

        assert_eq!(h.probe.submitted(), vec![ms(5)]);
        assert_eq!(h.scheduler.stats().stale_skips, 2);
    }

    #[test]
    fn unavailable_source_is_skipped() {
        let mut h = Harness::new(PipelineConfig::default());
        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Unavailable);
        assert_eq!(h.scheduler.stats().unavailable_skips, 1);
        assert!(h.probe.submitted().is_empty());
    }

    #[test]
    fn capture_loss_is_fatal_and_reported() {
        let mut h = Harness::new(PipelineConfig::default());
        h.source.fail();

        let result = h.scheduler.on_tick();
        assert!(matches!(
            result,
            Err(PipelineError::Capture(CaptureError::Disconnected(_)))
        ));
        assert!(matches!(
            h.events.try_recv(),
            Ok(PipelineEvent::CaptureLost(_))
        ));
    }

    #[test]
    fn failed_detection_clears_in_flight_without_dispatch() {
        let mut h = Harness::new(PipelineConfig::default());

        h.source.show(ms(1));
        h.scheduler.on_tick().unwrap();
        assert_eq!(
            h.finish(ms(1), Err(anyhow!("inference blew up"))),
            CompletionOutcome::Failed
        );

        assert!(!h.scheduler.is_in_flight());
        assert!(h.seen().is_empty());
        assert_eq!(h.scheduler.stats().detection_failures, 1);

        h.source.show(ms(2));
        assert_eq!(h.scheduler.on_tick().unwrap(), TickOutcome::Submitted(ms(2)));
    }

    #[test]
    fn missing_subject_is_dispatched_as_absent() {
        let mut h = Harness::new(config(30.0, 0.6));

        h.cycle(ms(1), vec![pose(0.0)]);
        assert_eq!(
            h.cycle(ms(2), vec![]),
            CompletionOutcome::Dispatched { has_pose: false }
        );
        assert_eq!(h.seen()[1], (ms(2), None));

        // A short gap keeps the smoothing state.
        h.cycle(ms(3), vec![pose(1.0)]);
        assert!((h.last_x().unwrap() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn repeated_misses_reset_smoothing() {
        let mut h = Harness::new(PipelineConfig {
            reset_after_missed: 3,
            ..config(30.0, 0.5)
        });

        h.cycle(ms(1), vec![pose(0.0)]);
        for ts in 2..5 {
            h.cycle(ms(ts), vec![]);
        }
        h.cycle(ms(5), vec![pose(1.0)]);
        assert_eq!(h.last_x(), Some(1.0));
    }

    #[test]
    fn disabled_smoothing_passes_raw_poses() {
        let mut h = Harness::new(PipelineConfig {
            smoothing_enabled: false,
            ..config(30.0, 0.9)
        });

        h.cycle(ms(1), vec![pose(0.0)]);
        h.cycle(ms(2), vec![pose(1.0), pose(0.3)]);
        assert_eq!(h.last_x(), Some(1.0));
    }

    #[test]
    fn completions_after_teardown_are_discarded() {
        let mut h = Harness::new(PipelineConfig::default());
        h.source.show(ms(1));
        h.scheduler.on_tick().unwrap();

        h.scheduler.teardown();
        assert!(h.probe.shut_down.load(Ordering::SeqCst));
        assert!(h.source.stopped());

        assert_eq!(
            h.finish(ms(1), Ok(vec![pose(0.1)])),
            CompletionOutcome::Discarded
        );
        assert!(h.seen().is_empty());
    }

    #[test]
    fn unexpected_completion_is_discarded() {
        let mut h = Harness::new(PipelineConfig::default());
        h.source.show(ms(5));
        h.scheduler.on_tick().unwrap();

        let outcome = h.scheduler.on_completion(Detection {
            timestamp: ms(4),
            outcome: Ok(vec![pose(0.1)]),
        });
        assert_eq!(outcome, CompletionOutcome::Discarded);
        assert!(h.scheduler.is_in_flight());
        assert!(h.seen().is_empty());
    }

    #[test]
    fn sink_failures_are_reported_not_fatal() {
        let dispatcher = Dispatcher::new().with_sink(Broken);
        let mut h = Harness::with_dispatcher(PipelineConfig::default(), dispatcher);

        h.cycle(ms(1), vec![pose(0.1)]);

        assert_eq!(h.seen().len(), 1);
        assert_eq!(h.scheduler.stats().sink_failures, 1);
        match h.events.try_recv() {
            Ok(PipelineEvent::SinkFailed { timestamp, failure }) => {
                assert_eq!(timestamp, ms(1));
                assert_eq!(failure.sink, "broken");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn hung_engine_keeps_ticking_and_still_tears_down() {
        let (engine, probe) = TestEngine::new(Completion::Never);
        let source = LiveSource {
            epoch: Instant::now(),
        };
        let mut handle =
            PipelineHandle::spawn(&config(30.0, 0.5), source, engine, Dispatcher::new()).unwrap();

        thread::sleep(Duration::from_millis(400));
        let stats = handle.stop().unwrap().unwrap();

        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.dispatched, 0);
        assert!(stats.busy_skips >= 2, "{stats:?}");
        assert_eq!(probe.submitted().len(), 1);
        assert!(probe.shut_down.load(Ordering::SeqCst));
        assert!(handle.stop().is_none());
    }

    #[test]
    fn slow_engine_never_queues_work() {
        let (engine, probe) = TestEngine::new(Completion::After(Duration::from_millis(100)));
        let source = LiveSource {
            epoch: Instant::now(),
        };
        let recorder = Recorder::default();
        let seen = recorder.seen.clone();
        let mut handle = PipelineHandle::spawn(
            &config(30.0, 0.5),
            source,
            engine,
            Dispatcher::new().with_sink(recorder),
        )
        .unwrap();

        let run_for = Duration::from_millis(700);
        thread::sleep(run_for);
        let stats = handle.stop().unwrap().unwrap();

        assert_eq!(probe.overlapping.load(Ordering::SeqCst), 0);
        assert!(stats.dispatched >= 2, "{stats:?}");
        assert!(stats.dispatched <= stats.ticks);
        assert!(stats.submitted <= stats.dispatched + 1);
        assert!(stats.busy_skips > 0);
        assert!((stats.dispatched as f64) <= run_for.as_secs_f64() * 30.0 + 1.0);

        let order: Vec<_> = seen.lock().unwrap().iter().map(|(ts, _)| *ts).collect();
        assert!(order.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn engine_death_halts_the_pipeline() {
        let (engine, _probe) = TestEngine::new(Completion::Dead);
        let source = LiveSource {
            epoch: Instant::now(),
        };
        let mut handle =
            PipelineHandle::spawn(&config(30.0, 0.5), source, engine, Dispatcher::new()).unwrap();

        let event = handle.events().recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, PipelineEvent::EngineStopped));
        assert!(matches!(
            handle.stop(),
            Some(Err(PipelineError::EngineStopped))
        ));
    }
}
