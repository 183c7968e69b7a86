//! Anomaly Sentinel
//!
//! Unattended visual anomaly detection across a fleet of cameras, reporting
//! to a remote API over an unreliable network.
//!
//! # Architecture
//!
//! Each camera runs as an independent unit of three threads:
//!
//! 1. **Capture**: `BufferedStream` keeps a `CaptureBackend` connected and
//!    publishes the newest frame into a one-slot, drop-oldest buffer.
//! 2. **Gate**: `StateWatcher` polls the remote "should run" signal and keeps
//!    the last good value.
//! 3. **Detection**: `DetectionOrchestrator` pauses or resumes the stream by
//!    gate state, scores frames, extracts an anomaly polygon, classifies the
//!    region and uploads the detection through `ResilientHttpClient`.
//!
//! `FleetSupervisor` starts one unit per configured camera and stops them all
//! with bounded waits.
//!
//! # Module Structure
//!
//! - `frame`: immutable captured frames
//! - `ingest`: capture backends (synthetic, HTTP MJPEG, RTSP, V4L2)
//! - `backoff`: jittered exponential backoff
//! - `stream`: `BufferedStream`
//! - `watcher`: `StateWatcher`
//! - `api`: `ResilientHttpClient` and its transport
//! - `polygon`: heat map to normalised polygon
//! - `detect`: anomaly model, embedder and classifier contracts
//! - `orchestrator`: per-camera detection loop
//! - `artifacts`: debug artifacts on disk
//! - `fleet`: `FleetSupervisor`
//! - `config`: file + environment configuration

pub mod api;
pub mod artifacts;
pub mod backoff;
pub mod config;
pub mod detect;
pub mod fleet;
pub mod frame;
pub mod ingest;
pub mod orchestrator;
pub mod polygon;
pub mod stream;
pub mod watcher;

pub use api::{ClientSettings, HttpResponse, ResilientHttpClient, RetryableRequest};
pub use backoff::Backoff;
pub use config::SentinelConfig;
pub use detect::{AnomalyModel, Classifier, DetectionCandidate, DetectorSet, RegionEmbedder};
pub use fleet::{CameraUnit, FleetSupervisor};
pub use frame::{Frame, PixelLayout};
pub use ingest::{BackendKind, CaptureBackend, FrameSource, SourceConfig};
pub use orchestrator::{DetectionOrchestrator, OrchestratorHandle, TickOutcome, TickTimings};
pub use polygon::{extract_anomaly_polygon, HeatMap, NormalizedPolygon, PolygonParams};
pub use stream::{BufferedStream, StreamConfig, StreamState, StreamStatus};
pub use watcher::{GateReader, StateReader, StateWatcher, WatcherConfig, WatcherStatus};
