//! Buffered capture stream.
//!
//! `BufferedStream` owns one capture backend and a background thread that
//! keeps it connected. The thread publishes frames into a single-frame slot:
//! - the slot holds at most one pending frame; a new frame replaces it
//!   (drop-oldest) and the producer never blocks on the consumer
//! - `read()` takes the pending frame, or serves the last delivered frame
//! - `pause()` keeps the connection but drops and stops publishing frames
//!
//! State machine:
//! `Stopped -> Connecting -> Streaming <-> Paused -> Stopping -> Stopped`
//!
//! A capture failure closes the backend and goes back to `Connecting`. With
//! `max_retries` configured, exhausting the budget terminates the thread for
//! good; that is visible through `status().terminated`, and from then on
//! `read()` returns `None`.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::frame::Frame;
use crate::ingest::CaptureBackend;

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(100);
const EMPTY_GRAB_YIELD: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub reconnect: Backoff,
    pub start_paused: bool,
    pub join_timeout: Duration,
    /// How long the paused loop sleeps between checks for resume/stop.
    pub idle_poll: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            reconnect: Backoff::default(),
            start_paused: true,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Stopped,
    Connecting,
    Streaming,
    Paused,
    Stopping,
}

/// Snapshot returned by `BufferedStream::status()`.
#[derive(Clone, Debug, Serialize)]
pub struct StreamStatus {
    pub connected: bool,
    pub paused: bool,
    pub retry_count: u32,
    pub last_frame_age_ms: Option<u64>,
    pub buffered_count: usize,
    pub state: StreamState,
    /// Background thread is running.
    pub alive: bool,
    /// Retry budget exhausted; the stream must be recreated.
    pub terminated: bool,
    pub device: String,
}

struct Inner {
    slot: Option<Frame>,
    last_frame: Option<Frame>,
    last_frame_at: Option<Instant>,
    state: StreamState,
    paused: bool,
    stop_requested: bool,
    retry_count: u32,
    connected: bool,
    terminated: bool,
    alive: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled when a frame lands in the slot.
    frame_ready: Condvar,
    /// Signalled on pause/resume/stop and when the loop exits.
    control: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep up to `duration`, waking early on stop. Returns true when a stop
    /// was requested.
    fn sleep_interruptible(&self, duration: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .control
            .wait_timeout_while(guard, duration, |inner| !inner.stop_requested)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.stop_requested
    }
}

pub struct BufferedStream {
    device: String,
    config: StreamConfig,
    shared: Arc<Shared>,
    backend: Mutex<Option<Box<dyn CaptureBackend>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedStream {
    pub fn new(backend: Box<dyn CaptureBackend>, config: StreamConfig) -> Self {
        let device = backend.name();
        let inner = Inner {
            slot: None,
            last_frame: None,
            last_frame_at: None,
            state: StreamState::Stopped,
            paused: config.start_paused,
            stop_requested: false,
            retry_count: 0,
            connected: false,
            terminated: false,
            alive: false,
        };
        Self {
            device,
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                frame_ready: Condvar::new(),
                control: Condvar::new(),
            }),
            backend: Mutex::new(Some(backend)),
            worker: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Spawn the capture thread. Calling it again while running is a no-op;
    /// a stream that was stopped cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if worker.is_some() {
            return Ok(());
        }
        let backend = self
            .backend
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| anyhow!("stream {} was stopped and cannot be restarted", self.device))?;

        {
            let mut inner = self.shared.lock();
            inner.alive = true;
            inner.state = StreamState::Connecting;
        }
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name(format!("stream-{}", thread_label(&self.device)))
            .spawn(move || capture_loop(shared, backend, config));
        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                log::info!("stream {}: capture thread started", self.device);
                Ok(())
            }
            Err(err) => {
                let mut inner = self.shared.lock();
                inner.alive = false;
                inner.state = StreamState::Stopped;
                Err(anyhow!("spawn capture thread for {}: {}", self.device, err))
            }
        }
    }

    /// Take the pending frame. With a non-zero `timeout`, wait for one up to
    /// `timeout`. Falls back to the last delivered frame, then to `None`.
    pub fn read(&self, timeout: Duration) -> Option<Frame> {
        let mut inner = self.shared.lock();
        if let Some(frame) = inner.slot.take() {
            return Some(frame);
        }
        if !timeout.is_zero() {
            let (guard, _) = self
                .shared
                .frame_ready
                .wait_timeout_while(inner, timeout, |inner| {
                    inner.slot.is_none() && !inner.stop_requested
                })
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner = guard;
            if let Some(frame) = inner.slot.take() {
                return Some(frame);
            }
        }
        inner.last_frame.clone()
    }

    /// Stop publishing frames and forget everything already captured. The
    /// backend stays connected.
    pub fn pause(&self) {
        let mut inner = self.shared.lock();
        inner.paused = true;
        inner.slot = None;
        inner.last_frame = None;
        inner.last_frame_at = None;
        if inner.state == StreamState::Streaming {
            inner.state = StreamState::Paused;
        }
        self.shared.control.notify_all();
    }

    pub fn resume(&self) {
        let mut inner = self.shared.lock();
        inner.paused = false;
        if inner.state == StreamState::Paused {
            inner.state = StreamState::Streaming;
        }
        self.shared.control.notify_all();
    }

    pub fn is_reading(&self) -> bool {
        let inner = self.shared.lock();
        inner.alive && !inner.paused
    }

    /// Request shutdown and wait up to the join timeout for the capture
    /// thread. Safe to call repeatedly and from any state.
    pub fn stop(&self) {
        {
            let mut inner = self.shared.lock();
            if !inner.stop_requested {
                inner.stop_requested = true;
                if inner.alive {
                    inner.state = StreamState::Stopping;
                }
            }
            self.shared.control.notify_all();
            self.shared.frame_ready.notify_all();
        }

        // Never started: release the backend here.
        if let Some(mut backend) = self.backend.lock().unwrap_or_else(|p| p.into_inner()).take() {
            backend.close();
        }

        let Some(handle) = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return;
        };
        let exited = {
            let guard = self.shared.lock();
            let (guard, _) = self
                .shared
                .control
                .wait_timeout_while(guard, self.config.join_timeout, |inner| inner.alive)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            !guard.alive
        };
        if exited {
            if handle.join().is_err() {
                log::warn!("stream {}: capture thread panicked", self.device);
            }
        } else {
            log::warn!(
                "stream {}: capture thread did not exit within {:?}; detaching",
                self.device,
                self.config.join_timeout
            );
        }
        let mut inner = self.shared.lock();
        inner.slot = None;
        if !inner.alive {
            inner.state = StreamState::Stopped;
        }
    }

    pub fn status(&self) -> StreamStatus {
        let inner = self.shared.lock();
        StreamStatus {
            connected: inner.connected,
            paused: inner.paused,
            retry_count: inner.retry_count,
            last_frame_age_ms: inner
                .last_frame_at
                .map(|at| at.elapsed().as_millis() as u64),
            buffered_count: usize::from(inner.slot.is_some()),
            state: inner.state,
            alive: inner.alive,
            terminated: inner.terminated,
            device: self.device.clone(),
        }
    }
}

impl Drop for BufferedStream {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---- Capture loop ----

/// Marks the stream dead when the capture thread exits, even by panic. A
/// dead stream has nothing to serve, so the buffered frames go too.
struct AliveGuard {
    shared: Arc<Shared>,
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.alive = false;
        inner.connected = false;
        inner.state = StreamState::Stopped;
        inner.slot = None;
        inner.last_frame = None;
        inner.last_frame_at = None;
        self.shared.control.notify_all();
        self.shared.frame_ready.notify_all();
    }
}

enum Step {
    Continue,
    Exit,
}

fn capture_loop(shared: Arc<Shared>, mut backend: Box<dyn CaptureBackend>, config: StreamConfig) {
    let _guard = AliveGuard {
        shared: Arc::clone(&shared),
    };
    let device = backend.name();

    loop {
        {
            let mut inner = shared.lock();
            if inner.stop_requested {
                break;
            }
            if inner.paused {
                if inner.connected {
                    inner.state = StreamState::Paused;
                }
                let _ = shared
                    .control
                    .wait_timeout_while(inner, config.idle_poll, |inner| {
                        inner.paused && !inner.stop_requested
                    })
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                continue;
            }
        }

        if !backend.is_connected() {
            if let Step::Exit = connect_step(&shared, backend.as_mut(), &config, &device) {
                break;
            }
            continue;
        }

        if let Step::Exit = grab_step(&shared, backend.as_mut(), &config, &device) {
            break;
        }
    }

    backend.close();
    log::info!("stream {}: capture thread exiting", device);
}

fn connect_step(
    shared: &Shared,
    backend: &mut dyn CaptureBackend,
    config: &StreamConfig,
    device: &str,
) -> Step {
    shared.lock().state = StreamState::Connecting;
    match backend.connect() {
        Ok(()) => {
            let mut inner = shared.lock();
            inner.connected = true;
            inner.retry_count = 0;
            inner.state = if inner.paused {
                StreamState::Paused
            } else {
                StreamState::Streaming
            };
            log::info!("stream {}: connected", device);
            Step::Continue
        }
        Err(err) => {
            let retry = record_failure(shared);
            log::warn!("stream {}: connect failed (retry {}): {:#}", device, retry, err);
            if retries_exhausted(shared, config, retry, device) {
                return Step::Exit;
            }
            if shared.sleep_interruptible(config.reconnect.delay(retry)) {
                Step::Exit
            } else {
                Step::Continue
            }
        }
    }
}

fn grab_step(
    shared: &Shared,
    backend: &mut dyn CaptureBackend,
    config: &StreamConfig,
    device: &str,
) -> Step {
    match backend.grab() {
        Ok(Some(frame)) => {
            let mut inner = shared.lock();
            if inner.paused || inner.stop_requested {
                return Step::Continue;
            }
            inner.slot = Some(frame.clone());
            inner.last_frame = Some(frame);
            inner.last_frame_at = Some(Instant::now());
            shared.frame_ready.notify_all();
            Step::Continue
        }
        Ok(None) => {
            std::thread::sleep(EMPTY_GRAB_YIELD);
            Step::Continue
        }
        Err(err) => {
            backend.close();
            let retry = record_failure(shared);
            log::warn!("stream {}: capture failed (retry {}): {:#}", device, retry, err);
            if retries_exhausted(shared, config, retry, device) {
                return Step::Exit;
            }
            if shared.sleep_interruptible(config.reconnect.mini_delay()) {
                Step::Exit
            } else {
                Step::Continue
            }
        }
    }
}

fn record_failure(shared: &Shared) -> u32 {
    let mut inner = shared.lock();
    inner.connected = false;
    inner.state = StreamState::Connecting;
    inner.retry_count = inner.retry_count.saturating_add(1);
    inner.retry_count
}

fn retries_exhausted(shared: &Shared, config: &StreamConfig, retry: u32, device: &str) -> bool {
    match config.max_retries {
        Some(max) if retry >= max => {
            shared.lock().terminated = true;
            log::error!(
                "stream {}: giving up after {} consecutive failures",
                device,
                retry
            );
            true
        }
        _ => false,
    }
}

fn thread_label(device: &str) -> String {
    device
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
