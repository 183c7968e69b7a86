//! Multi-camera supervisor.
//!
//! Every camera is an independent `CameraUnit`: its own API client and auth
//! session, capture stream, gate watcher, detectors and orchestrator thread.
//! A camera that fails to build is skipped; a camera whose stream dies keeps
//! its orchestrator ticking on "no frame" without touching the others.

use anyhow::{anyhow, Context, Result};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crate::api::ResilientHttpClient;
use crate::config::{CameraSettings, DetectionSettings, SentinelConfig};
use crate::detect::DetectorSet;
use crate::ingest::FrameSource;
use crate::orchestrator::{DetectionOrchestrator, DetectionSink, OrchestratorHandle};
use crate::stream::{BufferedStream, StreamStatus};
use crate::watcher::{GateReader, StateWatcher, WatcherStatus};

pub struct CameraUnit {
    post_id: i64,
    stream: Arc<BufferedStream>,
    watcher: Arc<StateWatcher>,
    orchestrator: OrchestratorHandle,
}

impl CameraUnit {
    /// Build and start one camera from configuration.
    pub fn build(config: &SentinelConfig, camera: &CameraSettings) -> Result<Self> {
        let po = camera.post_id;
        let client = Arc::new(ResilientHttpClient::new(config.client_settings())?);
        if let Err(err) = client.authenticate() {
            // The client re-authenticates on the first 401.
            log::warn!("[PO {}] initial authentication failed: {:#}", po, err);
        }

        let source = FrameSource::open(&camera.source_config())
            .with_context(|| format!("open capture source {}", camera.url))?;
        let stream = BufferedStream::new(Box::new(source), config.stream_config());

        let reader = GateReader::new(
            Arc::clone(&client),
            po,
            config.gate.info_id,
            config.gate.run_value.clone(),
        );
        let watcher = StateWatcher::new(po, Arc::new(reader), config.watcher_config());

        let detectors = DetectorSet::from_settings(&config.model)?;
        Self::assemble(po, stream, watcher, client, detectors, config.detection.clone())
    }

    /// Start the given parts as one unit. On failure everything already
    /// started is stopped again.
    pub fn assemble(
        post_id: i64,
        stream: BufferedStream,
        watcher: StateWatcher,
        sink: Arc<dyn DetectionSink>,
        detectors: DetectorSet,
        settings: DetectionSettings,
    ) -> Result<Self> {
        let watcher = watcher.with_on_change(Arc::new(move |open| {
            log::info!(
                "[PO {}] gate {}",
                post_id,
                if open { "opened" } else { "closed" }
            );
        }));
        let stream = Arc::new(stream);
        let watcher = Arc::new(watcher);

        stream.start()?;
        if let Err(err) = watcher.start() {
            stream.stop();
            return Err(err);
        }
        let orchestrator = DetectionOrchestrator::new(
            post_id,
            stream.clone(),
            watcher.clone(),
            sink,
            detectors,
            settings,
        );
        let orchestrator = match orchestrator.spawn() {
            Ok(handle) => handle,
            Err(err) => {
                watcher.stop();
                stream.stop();
                return Err(err);
            }
        };
        Ok(Self {
            post_id,
            stream,
            watcher,
            orchestrator,
        })
    }

    pub fn post_id(&self) -> i64 {
        self.post_id
    }

    pub fn stream_status(&self) -> StreamStatus {
        self.stream.status()
    }

    pub fn watcher_status(&self) -> WatcherStatus {
        self.watcher.status()
    }

    pub fn health_line(&self) -> String {
        let stream = self.stream.status();
        let gate = self.watcher.status();
        let age = |ms: Option<u64>| ms.map_or_else(|| "-".to_string(), |v| v.to_string());
        format!(
            "[PO {}] health: stream={:?} connected={} paused={} retries={} terminated={} \
             last_frame_ms={} gate={} gate_age_ms={} gate_failures={} orchestrator_alive={}",
            self.post_id,
            stream.state,
            stream.connected,
            stream.paused,
            stream.retry_count,
            stream.terminated,
            age(stream.last_frame_age_ms),
            gate.state,
            age(gate.last_update_age_ms),
            gate.consecutive_failures,
            self.orchestrator.is_alive()
        )
    }

    /// Orchestrator first, then stream, then watcher. Each step is bounded.
    pub fn stop(&self) {
        self.orchestrator.stop();
        self.stream.pause();
        self.stream.stop();
        self.watcher.stop();
        log::info!("[PO {}] camera stopped", self.post_id);
    }
}

pub struct FleetSupervisor {
    units: Vec<CameraUnit>,
    health_interval: Duration,
}

impl FleetSupervisor {
    /// Start every configured camera. Cameras that fail to build are logged
    /// and skipped; it is an error only if none start.
    pub fn start(config: &SentinelConfig) -> Result<Self> {
        let mut units = Vec::with_capacity(config.cameras.len());
        for camera in &config.cameras {
            match CameraUnit::build(config, camera) {
                Ok(unit) => {
                    log::info!("[PO {}] camera started ({})", camera.post_id, camera.url);
                    units.push(unit);
                }
                Err(err) => {
                    log::error!("[PO {}] camera skipped: {:#}", camera.post_id, err);
                }
            }
        }
        if units.is_empty() {
            return Err(anyhow!("no camera could be started"));
        }
        Ok(Self::from_units(units, config.health_log_interval))
    }

    pub fn from_units(units: Vec<CameraUnit>, health_interval: Duration) -> Self {
        Self {
            units,
            health_interval,
        }
    }

    pub fn units(&self) -> &[CameraUnit] {
        &self.units
    }

    pub fn log_health(&self) {
        for unit in &self.units {
            log::info!("{}", unit.health_line());
        }
    }

    /// Block until a shutdown message arrives (or the sender is dropped),
    /// logging fleet health every interval.
    pub fn run_until(&self, shutdown: &Receiver<()>) {
        loop {
            match shutdown.recv_timeout(self.health_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.log_health(),
            }
        }
    }

    /// Stop all cameras.
    pub fn shutdown(self) {
        log::info!("shutting down {} camera(s)", self.units.len());
        for unit in &self.units {
            unit.stop();
        }
    }
}
