//! External gate-state watcher.
//!
//! `StateWatcher` polls a boolean "should run" signal on a background thread:
//! - one poll immediately on start, then one per `interval`
//! - failed polls keep the last good value and back off exponentially
//! - every wait is interruptible by `stop()`
//! - the optional change callback fires once per observed transition,
//!   outside the internal lock

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::api::ResilientHttpClient;
use crate::backoff::Backoff;

/// Source of the gate signal.
pub trait StateReader: Send + Sync {
    fn poll_state(&self) -> Result<bool>;

    fn describe(&self) -> String;
}

/// Gate signal read from the remote API's dynamic post info.
pub struct GateReader {
    client: Arc<ResilientHttpClient>,
    post_id: i64,
    info_id: i64,
    run_value: String,
}

impl GateReader {
    pub fn new(
        client: Arc<ResilientHttpClient>,
        post_id: i64,
        info_id: i64,
        run_value: impl Into<String>,
    ) -> Self {
        Self {
            client,
            post_id,
            info_id,
            run_value: run_value.into(),
        }
    }
}

impl StateReader for GateReader {
    fn poll_state(&self) -> Result<bool> {
        self.client
            .fetch_gate_state(self.post_id, self.info_id, &self.run_value)
    }

    fn describe(&self) -> String {
        format!("PO {} info {}", self.post_id, self.info_id)
    }
}

pub type ChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    pub interval: Duration,
    /// Applied per consecutive failure.
    pub backoff: Backoff,
    pub join_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            backoff: Backoff::new(
                Duration::from_millis(500),
                Duration::from_secs(30),
                Duration::from_millis(300),
            ),
            join_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WatcherStatus {
    pub post_id: i64,
    pub state: bool,
    pub last_update_age_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub alive: bool,
}

struct Inner {
    state: bool,
    last_update: Option<Instant>,
    consecutive_failures: u32,
    last_error: Option<String>,
    stop_requested: bool,
    alive: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns true when a stop was requested during the wait.
    fn wait(&self, duration: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |inner| !inner.stop_requested)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.stop_requested
    }
}

pub struct StateWatcher {
    post_id: i64,
    reader: Arc<dyn StateReader>,
    config: WatcherConfig,
    on_change: Option<ChangeCallback>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StateWatcher {
    pub fn new(post_id: i64, reader: Arc<dyn StateReader>, config: WatcherConfig) -> Self {
        Self {
            post_id,
            reader,
            config,
            on_change: None,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: false,
                    last_update: None,
                    consecutive_failures: 0,
                    last_error: None,
                    stop_requested: false,
                    alive: false,
                }),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn with_on_change(mut self, callback: ChangeCallback) -> Self {
        self.on_change = Some(callback);
        self
    }

    /// Spawn the poll thread. No-op while already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if worker.is_some() {
            return Ok(());
        }
        {
            let mut inner = self.shared.lock();
            if inner.stop_requested {
                return Err(anyhow!("watcher for PO {} was stopped", self.post_id));
            }
            inner.alive = true;
        }
        let poller = Poller {
            post_id: self.post_id,
            reader: Arc::clone(&self.reader),
            config: self.config.clone(),
            on_change: self.on_change.clone(),
            shared: Arc::clone(&self.shared),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("watcher-{}", self.post_id))
            .spawn(move || poller.run());
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                log::info!(
                    "[PO {}] state watcher started ({})",
                    self.post_id,
                    self.reader.describe()
                );
                Ok(())
            }
            Err(err) => {
                self.shared.lock().alive = false;
                Err(anyhow!("spawn watcher thread for PO {}: {}", self.post_id, err))
            }
        }
    }

    /// Last successfully polled value; `false` until the first good poll.
    pub fn get_state(&self) -> bool {
        self.shared.lock().state
    }

    pub fn status(&self) -> WatcherStatus {
        let inner = self.shared.lock();
        WatcherStatus {
            post_id: self.post_id,
            state: inner.state,
            last_update_age_ms: inner
                .last_update
                .map(|at| at.elapsed().as_millis() as u64),
            consecutive_failures: inner.consecutive_failures,
            last_error: inner.last_error.clone(),
            alive: inner.alive,
        }
    }

    /// Signal the poll thread and wait up to the join timeout. Idempotent.
    pub fn stop(&self) {
        {
            let mut inner = self.shared.lock();
            inner.stop_requested = true;
            self.shared.wake.notify_all();
        }
        let Some(handle) = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return;
        };
        let exited = {
            let guard = self.shared.lock();
            let (guard, _) = self
                .shared
                .wake
                .wait_timeout_while(guard, self.config.join_timeout, |inner| inner.alive)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            !guard.alive
        };
        if exited {
            if handle.join().is_err() {
                log::warn!("[PO {}] watcher thread panicked", self.post_id);
            }
        } else {
            log::warn!(
                "[PO {}] watcher did not exit within {:?}; detaching",
                self.post_id,
                self.config.join_timeout
            );
        }
    }
}

impl Drop for StateWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---- Poll loop ----

struct Poller {
    post_id: i64,
    reader: Arc<dyn StateReader>,
    config: WatcherConfig,
    on_change: Option<ChangeCallback>,
    shared: Arc<Shared>,
}

impl Poller {
    fn run(self) {
        let mut stopped = self.poll_once();
        while !stopped {
            if self.shared.wait(self.config.interval) {
                break;
            }
            stopped = self.poll_once();
        }
        let mut inner = self.shared.lock();
        inner.alive = false;
        self.shared.wake.notify_all();
        log::info!("[PO {}] state watcher stopped", self.post_id);
    }

    /// Poll once. On failure waits out the backoff. Returns true when a stop
    /// was requested.
    fn poll_once(&self) -> bool {
        let polled = panic::catch_unwind(AssertUnwindSafe(|| self.reader.poll_state()))
            .unwrap_or_else(|_| Err(anyhow!("state reader panicked")));
        match polled {
            Ok(new_state) => {
                let changed = {
                    let mut inner = self.shared.lock();
                    inner.consecutive_failures = 0;
                    inner.last_error = None;
                    inner.last_update = Some(Instant::now());
                    let changed = inner.state != new_state;
                    inner.state = new_state;
                    changed
                };
                if changed {
                    log::info!("[PO {}] gate state changed to {}", self.post_id, new_state);
                    self.notify(new_state);
                }
                false
            }
            Err(err) => {
                let failures = {
                    let mut inner = self.shared.lock();
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.last_error = Some(format!("{:#}", err));
                    inner.consecutive_failures
                };
                log::error!(
                    "[PO {}] state poll failed ({} in a row): {:#}",
                    self.post_id,
                    failures,
                    err
                );
                self.shared.wait(self.config.backoff.delay(failures))
            }
        }
    }

    fn notify(&self, state: bool) {
        let Some(callback) = &self.on_change else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
            log::error!("[PO {}] state change callback panicked", self.post_id);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
