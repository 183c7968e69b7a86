//! Per-camera detection loop.
//!
//! While the gate is closed the stream is paused and the loop idles. When it
//! opens, the stream is resumed and every tick runs:
//! read frame, anomaly model, polygon extraction, classifier, upload, debug
//! artifacts. A failing tick is logged and followed by a short pause; it
//! never ends the loop.
//!
//! Pause and resume happen on gate edges only. A frame the feed serves again
//! (same buffer as the last one processed) counts as "no frame", so a stalled
//! or dead stream never produces repeated reports.

use anyhow::{anyhow, Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::api::ResilientHttpClient;
use crate::artifacts::write_debug_artifacts;
use crate::config::DetectionSettings;
use crate::detect::{ClassPrediction, DetectionCandidate, DetectorSet};
use crate::frame::Frame;
use crate::polygon::{extract_anomaly_polygon, NormalizedPolygon};
use crate::stream::BufferedStream;
use crate::watcher::StateWatcher;

const IDLE_SLEEP: Duration = Duration::from_millis(100);
const ERROR_PAUSE: Duration = Duration::from_millis(500);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Source of frames the orchestrator can pause and resume.
pub trait FrameFeed: Send + Sync {
    fn read(&self, timeout: Duration) -> Option<Frame>;
    fn pause(&self);
    fn resume(&self);
    fn is_reading(&self) -> bool;
    /// The feed gave up and will never deliver again.
    fn has_terminated(&self) -> bool {
        false
    }
}

/// External "should run" signal.
pub trait GateSignal: Send + Sync {
    fn is_open(&self) -> bool;
}

/// Where detections are reported.
pub trait DetectionSink: Send + Sync {
    fn submit(&self, post_id: i64, candidate: &DetectionCandidate, jpeg: Vec<u8>) -> Result<()>;
}

impl FrameFeed for BufferedStream {
    fn read(&self, timeout: Duration) -> Option<Frame> {
        BufferedStream::read(self, timeout)
    }

    fn pause(&self) {
        BufferedStream::pause(self)
    }

    fn resume(&self) {
        BufferedStream::resume(self)
    }

    fn is_reading(&self) -> bool {
        BufferedStream::is_reading(self)
    }

    fn has_terminated(&self) -> bool {
        self.status().terminated
    }
}

impl GateSignal for StateWatcher {
    fn is_open(&self) -> bool {
        self.get_state()
    }
}

impl DetectionSink for ResilientHttpClient {
    fn submit(&self, post_id: i64, candidate: &DetectionCandidate, jpeg: Vec<u8>) -> Result<()> {
        self.submit_detection(post_id, candidate, jpeg)
    }
}

/// Per-phase durations of one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickTimings {
    pub read: Duration,
    pub anomaly: Duration,
    pub post_process: Duration,
    pub classify: Duration,
    pub api: Duration,
    pub total: Duration,
}

impl TickTimings {
    pub fn summary(&self) -> String {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        format!(
            "read={:.2} anomaly={:.2} post_process={:.2} classify={:.2} api={:.2} total={:.2}",
            ms(self.read),
            ms(self.anomaly),
            ms(self.post_process),
            ms(self.classify),
            ms(self.api),
            ms(self.total)
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// Gate closed; stream paused.
    Idle,
    /// Gate open but no frame within the read timeout.
    NoFrame,
    BelowThreshold { score: f64 },
    Reported {
        candidate: DetectionCandidate,
        submitted: bool,
    },
}

pub struct DetectionOrchestrator {
    post_id: i64,
    feed: Arc<dyn FrameFeed>,
    gate: Arc<dyn GateSignal>,
    sink: Arc<dyn DetectionSink>,
    detectors: DetectorSet,
    settings: DetectionSettings,
    /// Gate seen open and feed resumed.
    active: bool,
    last_frame: Option<Frame>,
    dead_feed_logged: bool,
}

impl DetectionOrchestrator {
    pub fn new(
        post_id: i64,
        feed: Arc<dyn FrameFeed>,
        gate: Arc<dyn GateSignal>,
        sink: Arc<dyn DetectionSink>,
        detectors: DetectorSet,
        settings: DetectionSettings,
    ) -> Self {
        Self {
            post_id,
            feed,
            gate,
            sink,
            detectors,
            settings,
            active: false,
            last_frame: None,
            dead_feed_logged: false,
        }
    }

    pub fn post_id(&self) -> i64 {
        self.post_id
    }

    /// One iteration of the control loop.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        let po = self.post_id;
        if !self.gate.is_open() {
            if self.active || self.feed.is_reading() {
                log::info!("[PO {}] gate closed, pausing stream", po);
                self.feed.pause();
                self.active = false;
                self.last_frame = None;
            }
            return Ok(TickOutcome::Idle);
        }
        if !self.active {
            log::info!("[PO {}] gate open, resuming stream", po);
            self.feed.resume();
            self.active = true;
            std::thread::sleep(self.settings.resume_settle);
        }
        if !self.dead_feed_logged && self.feed.has_terminated() {
            log::error!("[PO {}] stream terminated; no frames until the camera is restarted", po);
            self.dead_feed_logged = true;
        }

        let mut timings = TickTimings::default();
        let started = Instant::now();

        let frame = self.feed.read(self.settings.read_timeout);
        timings.read = started.elapsed();
        let frame = frame.filter(|frame| {
            !self
                .last_frame
                .as_ref()
                .is_some_and(|last| last.same_buffer(frame))
        });
        let Some(frame) = frame else {
            log::debug!("[PO {}] no frame; timings ms: {}", po, TickTimings::default().summary());
            return Ok(TickOutcome::NoFrame);
        };
        self.last_frame = Some(frame.clone());

        let phase = Instant::now();
        let prediction = self
            .detectors
            .model
            .predict(&frame)
            .context("anomaly model failed")?;
        timings.anomaly = phase.elapsed();

        if prediction.score.is_nan() || prediction.score < self.settings.threshold {
            timings.total = started.elapsed();
            log::info!(
                "[PO {}] score={:.3} below threshold; timings ms: {}",
                po,
                prediction.score,
                timings.summary()
            );
            return Ok(TickOutcome::BelowThreshold {
                score: prediction.score,
            });
        }

        let phase = Instant::now();
        let polygon = extract_anomaly_polygon(
            &prediction.heat_map,
            frame.width,
            frame.height,
            &self.settings.polygon,
        );
        timings.post_process = phase.elapsed();

        let phase = Instant::now();
        let mut candidate =
            DetectionCandidate::unclassified(prediction.score, polygon, frame.captured_at);
        match self.classify(&frame, &candidate.polygon) {
            Ok(Some(class)) => candidate = candidate.with_class(class),
            Ok(None) => {}
            Err(err) => log::warn!("[PO {}] classification failed, reporting unclassified: {:#}", po, err),
        }
        timings.classify = phase.elapsed();

        let phase = Instant::now();
        let submitted = match frame
            .encode_jpeg(self.settings.jpeg_quality)
            .and_then(|jpeg| self.sink.submit(po, &candidate, jpeg))
        {
            Ok(()) => true,
            Err(err) => {
                log::warn!("[PO {}] detection upload failed: {:#}", po, err);
                false
            }
        };
        timings.api = phase.elapsed();

        if let Some(root) = &self.settings.debug_dir {
            if let Err(err) = write_debug_artifacts(
                root,
                po,
                &frame,
                &candidate,
                Some(&prediction.heat_map),
                self.settings.jpeg_quality,
            ) {
                log::warn!("[PO {}] debug artifacts not written: {:#}", po, err);
            }
        }

        timings.total = started.elapsed();
        log::info!(
            "[PO {}] detection score={:.3} class={} submitted={}; timings ms: {}",
            po,
            candidate.score,
            candidate.class_name.as_deref().unwrap_or("-"),
            submitted,
            timings.summary()
        );
        Ok(TickOutcome::Reported {
            candidate,
            submitted,
        })
    }

    /// Embed and classify the region. Panics are turned into errors.
    fn classify(&mut self, frame: &Frame, polygon: &NormalizedPolygon) -> Result<Option<ClassPrediction>> {
        let Some(classifier) = self.detectors.classifier.as_mut() else {
            return Ok(None);
        };
        let embedder = &mut self.detectors.embedder;
        panic::catch_unwind(AssertUnwindSafe(|| {
            let embedding = embedder.embed(frame, polygon)?;
            classifier.classify(&embedding)
        }))
        .map_err(|payload| anyhow!("classifier panicked: {}", panic_message(&payload)))?
        .map(Some)
    }

    /// Run ticks until `stop` is signalled. The feed is paused on exit.
    pub fn run(mut self, stop: &StopSignal) {
        log::info!("[PO {}] orchestrator started ({})", self.post_id, self.detectors.describe());
        while !stop.is_set() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.tick()));
            let pause = match outcome {
                Ok(Ok(TickOutcome::Idle)) => IDLE_SLEEP,
                Ok(Ok(_)) => Duration::ZERO,
                Ok(Err(err)) => {
                    log::error!("[PO {}] tick failed: {:#}", self.post_id, err);
                    ERROR_PAUSE
                }
                Err(payload) => {
                    log::error!("[PO {}] tick panicked: {}", self.post_id, panic_message(&payload));
                    ERROR_PAUSE
                }
            };
            if !pause.is_zero() && stop.wait(pause) {
                break;
            }
        }
        self.feed.pause();
        log::info!("[PO {}] orchestrator stopped", self.post_id);
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<OrchestratorHandle> {
        let post_id = self.post_id;
        let stop = Arc::new(StopSignal::default());
        let thread_stop = Arc::clone(&stop);
        stop.set_alive(true);
        let thread = std::thread::Builder::new()
            .name(format!("orchestrator-{}", post_id))
            .spawn(move || {
                let _alive = AliveGuard(&thread_stop);
                self.run(&thread_stop);
            })
            .map_err(|e| {
                stop.set_alive(false);
                anyhow!("spawn orchestrator for PO {}: {}", post_id, e)
            })?;
        Ok(OrchestratorHandle {
            post_id,
            stop,
            thread: Mutex::new(Some(thread)),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        })
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Default)]
struct StopState {
    stop: bool,
    alive: bool,
}

/// Wakeable stop flag shared by a loop and its handle.
#[derive(Default)]
pub struct StopSignal {
    state: Mutex<StopState>,
    changed: Condvar,
}

impl StopSignal {
    fn lock(&self) -> MutexGuard<'_, StopState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set(&self) {
        self.lock().stop = true;
        self.changed.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.lock().stop
    }

    /// Sleep up to `timeout`; true if stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| !s.stop)
            .unwrap_or_else(|p| p.into_inner());
        guard.stop
    }

    fn set_alive(&self, alive: bool) {
        self.lock().alive = alive;
        self.changed.notify_all();
    }

    fn is_alive(&self) -> bool {
        self.lock().alive
    }

    /// Wait up to `timeout` for the loop to exit; true if it did.
    fn wait_exit(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| s.alive)
            .unwrap_or_else(|p| p.into_inner());
        !guard.alive
    }
}

struct AliveGuard<'a>(&'a StopSignal);

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.set_alive(false);
    }
}

/// Owner-side handle of a running orchestrator thread.
pub struct OrchestratorHandle {
    post_id: i64,
    stop: Arc<StopSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl OrchestratorHandle {
    pub fn post_id(&self) -> i64 {
        self.post_id
    }

    pub fn is_alive(&self) -> bool {
        self.stop.is_alive()
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Signal the loop and wait (bounded) for it. Idempotent.
    pub fn stop(&self) {
        self.stop.set();
        let Some(handle) = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return;
        };
        if self.stop.wait_exit(self.join_timeout) {
            if handle.join().is_err() {
                log::warn!("[PO {}] orchestrator thread panicked", self.post_id);
            }
        } else {
            log::warn!(
                "[PO {}] orchestrator did not exit within {:?}; detaching",
                self.post_id,
                self.join_timeout
            );
        }
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{
        AnomalyModel, AnomalyPrediction, Classifier, HistogramEmbedder, StubAnomalyModel,
    };
    use crate::backoff::Backoff;
    use crate::frame::PixelLayout;
    use crate::ingest::CaptureBackend;
    use crate::stream::StreamConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeFeed {
        frames: Mutex<VecDeque<Frame>>,
        reading: AtomicBool,
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl FrameFeed for FakeFeed {
        fn read(&self, _timeout: Duration) -> Option<Frame> {
            self.frames.lock().unwrap().pop_front()
        }
        fn pause(&self) {
            self.reading.store(false, Ordering::SeqCst);
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }
        fn resume(&self) {
            self.reading.store(true, Ordering::SeqCst);
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
        fn is_reading(&self) -> bool {
            self.reading.load(Ordering::SeqCst)
        }
    }

    struct FixedGate(AtomicBool);

    impl GateSignal for FixedGate {
        fn is_open(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        submitted: Mutex<Vec<DetectionCandidate>>,
        fail: AtomicBool,
    }

    impl DetectionSink for RecordingSink {
        fn submit(&self, _post_id: i64, candidate: &DetectionCandidate, jpeg: Vec<u8>) -> Result<()> {
            assert!(!jpeg.is_empty());
            self.submitted.lock().unwrap().push(candidate.clone());
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("503"));
            }
            Ok(())
        }
    }

    /// Panics on the first call, then always answers class 9.
    struct FlakyClassifier {
        calls: usize,
    }

    impl Classifier for FlakyClassifier {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn classify(&mut self, _embedding: &[f32]) -> Result<ClassPrediction> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("classifier exploded");
            }
            Ok(ClassPrediction {
                class_id: 9,
                class_name: "burr".to_string(),
                confidence: 0.8,
            })
        }
    }

    struct FailingModel;

    impl AnomalyModel for FailingModel {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn predict(&mut self, _frame: &Frame) -> Result<AnomalyPrediction> {
            Err(anyhow!("tensor shape mismatch"))
        }
    }

    fn bright_frame() -> Frame {
        let (w, h) = (64u32, 48u32);
        let mut pixels = vec![10u8; (w * h) as usize];
        for y in 16..32 {
            for x in 24..40 {
                pixels[(y * w + x) as usize] = 250;
            }
        }
        Frame::new(pixels, w, h, PixelLayout::Mono8).unwrap()
    }

    fn dark_frame() -> Frame {
        Frame::new(vec![10u8; 64 * 48], 64, 48, PixelLayout::Mono8).unwrap()
    }

    struct Rig {
        feed: Arc<FakeFeed>,
        gate: Arc<FixedGate>,
        sink: Arc<RecordingSink>,
        orchestrator: DetectionOrchestrator,
    }

    fn rig(model: Box<dyn AnomalyModel>, classifier: Option<Box<dyn Classifier>>) -> Rig {
        let feed = Arc::new(FakeFeed::default());
        let gate = Arc::new(FixedGate(AtomicBool::new(true)));
        let sink = Arc::new(RecordingSink::default());
        let detectors = DetectorSet {
            model,
            embedder: Box::new(HistogramEmbedder::new()),
            classifier,
        };
        let settings = DetectionSettings {
            resume_settle: Duration::from_millis(1),
            read_timeout: Duration::from_millis(1),
            ..DetectionSettings::default()
        };
        let orchestrator = DetectionOrchestrator::new(
            7,
            feed.clone(),
            gate.clone(),
            sink.clone(),
            detectors,
            settings,
        );
        Rig {
            feed,
            gate,
            sink,
            orchestrator,
        }
    }

    #[test]
    fn closed_gate_pauses_once_and_open_gate_resumes() -> Result<()> {
        let mut rig = rig(Box::new(StubAnomalyModel::new(8, 6)), None);
        rig.gate.0.store(false, Ordering::SeqCst);
        rig.feed.reading.store(true, Ordering::SeqCst);
        assert_eq!(rig.orchestrator.tick()?, TickOutcome::Idle);
        assert_eq!(rig.orchestrator.tick()?, TickOutcome::Idle);
        assert_eq!(rig.feed.pauses.load(Ordering::SeqCst), 1);

        rig.gate.0.store(true, Ordering::SeqCst);
        assert_eq!(rig.orchestrator.tick()?, TickOutcome::NoFrame);
        assert_eq!(rig.orchestrator.tick()?, TickOutcome::NoFrame);
        assert_eq!(rig.feed.resumes.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn dark_frames_stay_below_threshold() -> Result<()> {
        let mut rig = rig(Box::new(StubAnomalyModel::new(8, 6)), None);
        rig.feed.frames.lock().unwrap().push_back(dark_frame());
        assert!(matches!(
            rig.orchestrator.tick()?,
            TickOutcome::BelowThreshold { .. }
        ));
        assert!(rig.sink.submitted.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn classifier_panic_degrades_to_unclassified_and_next_tick_recovers() -> Result<()> {
        let mut rig = rig(
            Box::new(StubAnomalyModel::new(8, 6)),
            Some(Box::new(FlakyClassifier { calls: 0 })),
        );
        {
            let mut frames = rig.feed.frames.lock().unwrap();
            frames.push_back(bright_frame());
            frames.push_back(bright_frame());
        }

        let TickOutcome::Reported { candidate, submitted } = rig.orchestrator.tick()? else {
            panic!("expected a report");
        };
        assert!(submitted);
        assert!(!candidate.is_classified());
        assert!(candidate.polygon.len() >= 3);

        let TickOutcome::Reported { candidate, .. } = rig.orchestrator.tick()? else {
            panic!("expected a report");
        };
        assert_eq!(candidate.class_id, Some(9));
        assert_eq!(rig.sink.submitted.lock().unwrap().len(), 2);
        Ok(())
    }

    #[test]
    fn failed_upload_is_not_a_tick_error() -> Result<()> {
        let mut rig = rig(Box::new(StubAnomalyModel::new(8, 6)), None);
        rig.sink.fail.store(true, Ordering::SeqCst);
        rig.feed.frames.lock().unwrap().push_back(bright_frame());
        assert!(matches!(
            rig.orchestrator.tick()?,
            TickOutcome::Reported { submitted: false, .. }
        ));
        Ok(())
    }

    #[test]
    fn model_errors_surface_from_tick_but_not_from_the_loop() -> Result<()> {
        let mut rig = rig(Box::new(FailingModel), None);
        rig.feed.frames.lock().unwrap().push_back(dark_frame());
        assert!(rig.orchestrator.tick().is_err());

        let feed = rig.feed.clone();
        feed.frames.lock().unwrap().push_back(dark_frame());
        let handle = rig
            .orchestrator
            .spawn()?
            .with_join_timeout(Duration::from_secs(2));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !feed.frames.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_alive());
        handle.stop();
        assert!(!handle.is_alive());
        assert!(!feed.is_reading());
        Ok(())
    }

    #[test]
    fn re_served_frame_is_reported_once() -> Result<()> {
        let mut rig = rig(Box::new(StubAnomalyModel::new(8, 6)), None);
        let frame = bright_frame();
        {
            let mut frames = rig.feed.frames.lock().unwrap();
            frames.push_back(frame.clone());
            frames.push_back(frame.clone());
            frames.push_back(frame);
        }
        assert!(matches!(rig.orchestrator.tick()?, TickOutcome::Reported { .. }));
        assert_eq!(rig.orchestrator.tick()?, TickOutcome::NoFrame);
        assert_eq!(rig.orchestrator.tick()?, TickOutcome::NoFrame);
        assert_eq!(rig.sink.submitted.lock().unwrap().len(), 1);

        rig.feed.frames.lock().unwrap().push_back(bright_frame());
        assert!(matches!(rig.orchestrator.tick()?, TickOutcome::Reported { .. }));
        assert_eq!(rig.sink.submitted.lock().unwrap().len(), 2);
        Ok(())
    }

    /// Serves one bright frame, then the device drops and never comes back.
    struct OneShotCamera {
        connects: u32,
        grabs: u32,
    }

    impl CaptureBackend for OneShotCamera {
        fn name(&self) -> String {
            "one-shot".to_string()
        }
        fn connect(&mut self) -> Result<()> {
            self.connects += 1;
            if self.connects == 1 {
                Ok(())
            } else {
                Err(anyhow!("device unavailable"))
            }
        }
        fn grab(&mut self) -> Result<Option<Frame>> {
            self.grabs += 1;
            if self.grabs == 1 {
                return Ok(Some(bright_frame()));
            }
            std::thread::sleep(Duration::from_millis(50));
            Err(anyhow!("usb disconnect"))
        }
        fn close(&mut self) {}
        fn is_connected(&self) -> bool {
            self.connects == 1
        }
    }

    struct CountingFeed {
        stream: BufferedStream,
        resumes: AtomicUsize,
    }

    impl FrameFeed for CountingFeed {
        fn read(&self, timeout: Duration) -> Option<Frame> {
            self.stream.read(timeout)
        }
        fn pause(&self) {
            self.stream.pause();
        }
        fn resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            self.stream.resume();
        }
        fn is_reading(&self) -> bool {
            self.stream.is_reading()
        }
        fn has_terminated(&self) -> bool {
            FrameFeed::has_terminated(&self.stream)
        }
    }

    #[test]
    fn terminated_stream_is_resumed_once_and_never_re_reported() -> Result<()> {
        let stream = BufferedStream::new(
            Box::new(OneShotCamera { connects: 0, grabs: 0 }),
            StreamConfig {
                max_retries: Some(2),
                reconnect: Backoff::new(
                    Duration::from_millis(2),
                    Duration::from_millis(5),
                    Duration::from_millis(1),
                ),
                start_paused: true,
                join_timeout: Duration::from_secs(1),
                idle_poll: Duration::from_millis(5),
            },
        );
        stream.start()?;
        let feed = Arc::new(CountingFeed {
            stream,
            resumes: AtomicUsize::new(0),
        });
        let gate = Arc::new(FixedGate(AtomicBool::new(true)));
        let sink = Arc::new(RecordingSink::default());
        let detectors = DetectorSet {
            model: Box::new(StubAnomalyModel::new(8, 6)),
            embedder: Box::new(HistogramEmbedder::new()),
            classifier: None,
        };
        let settings = DetectionSettings {
            resume_settle: Duration::from_millis(1),
            read_timeout: Duration::from_millis(500),
            ..DetectionSettings::default()
        };
        let mut orchestrator =
            DetectionOrchestrator::new(7, feed.clone(), gate, sink.clone(), detectors, settings);

        assert!(matches!(orchestrator.tick()?, TickOutcome::Reported { .. }));

        let deadline = Instant::now() + Duration::from_secs(2);
        while !feed.has_terminated() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(feed.has_terminated());

        orchestrator.settings.read_timeout = Duration::from_millis(5);
        for _ in 0..5 {
            assert_eq!(orchestrator.tick()?, TickOutcome::NoFrame);
        }
        assert_eq!(feed.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.submitted.lock().unwrap().len(), 1);
        feed.stream.stop();
        Ok(())
    }

    #[test]
    fn stub_model_heat_map_is_frame_aligned() -> Result<()> {
        let mut model = StubAnomalyModel::new(8, 6);
        let prediction = model.predict(&bright_frame())?;
        assert_eq!(prediction.heat_map.peak(), (3, 2));
        Ok(())
    }
}
