use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ClientSettings;
use crate::backoff::Backoff;
use crate::ingest::{BackendKind, SourceConfig};
use crate::polygon::PolygonParams;
use crate::stream::StreamConfig;
use crate::watcher::WatcherConfig;

const DEFAULT_API_TIMEOUT_SECS: u64 = 5;
const DEFAULT_GATE_INFO_ID: i64 = 1;
const DEFAULT_GATE_RUN_VALUE: &str = "6";
const DEFAULT_GATE_POLL_MS: u64 = 3_000;
const DEFAULT_GATE_MIN_BACKOFF_MS: u64 = 500;
const DEFAULT_GATE_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_STREAM_MIN_BACKOFF_MS: u64 = 500;
const DEFAULT_STREAM_MAX_BACKOFF_MS: u64 = 8_000;
const DEFAULT_JITTER_MS: u64 = 300;
const DEFAULT_DETECT_THRESHOLD: f64 = 0.8;
const DEFAULT_READ_TIMEOUT_MS: u64 = 200;
const DEFAULT_RESUME_SETTLE_MS: u64 = 100;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_MODEL_INPUT: u32 = 256;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_HEALTH_LOG_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    api: Option<ApiConfigFile>,
    gate: Option<GateConfigFile>,
    stream: Option<StreamConfigFile>,
    detection: Option<DetectionConfigFile>,
    model: Option<ModelConfigFile>,
    fleet: Option<FleetConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    url: Option<String>,
    login: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct GateConfigFile {
    info_id: Option<i64>,
    run_value: Option<String>,
    poll_interval_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    min_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    jitter_ms: Option<u64>,
    max_retries: Option<u32>,
    start_paused: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    threshold: Option<f64>,
    read_timeout_ms: Option<u64>,
    resume_settle_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    debug_dir: Option<PathBuf>,
    polygon: Option<PolygonConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PolygonConfigFile {
    tau: Option<f64>,
    tau_strong: Option<f64>,
    min_area_frac: Option<f64>,
    approx_eps_frac: Option<f64>,
    morph_kernel: Option<usize>,
    morph_iters: Option<usize>,
    min_box_frac: Option<f64>,
    min_box_px: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    kind: Option<ModelKind>,
    path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    classifier_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct FleetConfigFile {
    health_log_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    post_id: Option<i64>,
    url: Option<String>,
    backend: Option<BackendKind>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    force_mono: Option<bool>,
    exposure_us: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub api: ApiSettings,
    pub gate: GateSettings,
    pub stream: StreamSettings,
    pub detection: DetectionSettings,
    pub model: ModelSettings,
    pub health_log_interval: Duration,
    pub cameras: Vec<CameraSettings>,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub url: String,
    pub login: String,
    pub password: String,
    pub client_id: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub info_id: i64,
    /// Value of the gate field that means "run".
    pub run_value: String,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
    pub max_retries: Option<u32>,
    pub start_paused: bool,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub threshold: f64,
    pub read_timeout: Duration,
    pub resume_settle: Duration,
    pub jpeg_quality: u8,
    /// Root for debug artifacts; `None` disables them.
    pub debug_dir: Option<PathBuf>,
    pub polygon: PolygonParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Stub,
    Onnx,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub kind: ModelKind,
    pub path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub classifier_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub post_id: i64,
    pub url: String,
    pub backend: BackendKind,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub force_mono: bool,
    pub exposure_us: Option<u32>,
}

impl ModelSettings {
    /// The stub model scores brightness, not defects.
    pub fn is_placeholder(&self) -> bool {
        self.kind == ModelKind::Stub
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            kind: ModelKind::Stub,
            path: None,
            input_width: DEFAULT_MODEL_INPUT,
            input_height: DEFAULT_MODEL_INPUT,
            classifier_path: None,
        }
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DETECT_THRESHOLD,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            resume_settle: Duration::from_millis(DEFAULT_RESUME_SETTLE_MS),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            debug_dir: None,
            polygon: PolygonParams::default(),
        }
    }
}

impl SentinelConfig {
    /// Load from `SENTINEL_CONFIG` (if set), then apply env overrides and
    /// validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file; env overrides still apply.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let api = file.api.unwrap_or_default();
        let api = ApiSettings {
            url: api.url.unwrap_or_default(),
            login: api.login.unwrap_or_default(),
            password: api.password.unwrap_or_default(),
            client_id: api.client_id.unwrap_or_default(),
            timeout: Duration::from_secs(api.timeout_secs.unwrap_or(DEFAULT_API_TIMEOUT_SECS)),
        };

        let gate = file.gate.unwrap_or_default();
        let gate = GateSettings {
            info_id: gate.info_id.unwrap_or(DEFAULT_GATE_INFO_ID),
            run_value: gate
                .run_value
                .unwrap_or_else(|| DEFAULT_GATE_RUN_VALUE.to_string()),
            poll_interval: Duration::from_millis(
                gate.poll_interval_ms.unwrap_or(DEFAULT_GATE_POLL_MS),
            ),
            max_backoff: Duration::from_millis(
                gate.max_backoff_ms.unwrap_or(DEFAULT_GATE_MAX_BACKOFF_MS),
            ),
        };

        let stream = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            min_backoff: Duration::from_millis(
                stream.min_backoff_ms.unwrap_or(DEFAULT_STREAM_MIN_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(
                stream.max_backoff_ms.unwrap_or(DEFAULT_STREAM_MAX_BACKOFF_MS),
            ),
            jitter: Duration::from_millis(stream.jitter_ms.unwrap_or(DEFAULT_JITTER_MS)),
            max_retries: stream.max_retries,
            start_paused: stream.start_paused.unwrap_or(true),
        };

        let detection = file.detection.unwrap_or_default();
        let polygon = detection.polygon.unwrap_or_default();
        let defaults = PolygonParams::default();
        let detection = DetectionSettings {
            threshold: detection.threshold.unwrap_or(DEFAULT_DETECT_THRESHOLD),
            read_timeout: Duration::from_millis(
                detection.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            resume_settle: Duration::from_millis(
                detection.resume_settle_ms.unwrap_or(DEFAULT_RESUME_SETTLE_MS),
            ),
            jpeg_quality: detection.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            debug_dir: detection.debug_dir,
            polygon: PolygonParams {
                tau: polygon.tau.unwrap_or(defaults.tau),
                tau_strong: polygon.tau_strong.unwrap_or(defaults.tau_strong),
                min_area_frac: polygon.min_area_frac.unwrap_or(defaults.min_area_frac),
                approx_eps_frac: polygon.approx_eps_frac.unwrap_or(defaults.approx_eps_frac),
                morph_kernel: polygon.morph_kernel.unwrap_or(defaults.morph_kernel),
                morph_iters: polygon.morph_iters.unwrap_or(defaults.morph_iters),
                min_box_frac: polygon.min_box_frac.unwrap_or(defaults.min_box_frac),
                min_box_px: polygon.min_box_px.unwrap_or(defaults.min_box_px),
            },
        };

        let model = file.model.unwrap_or_default();
        let model = ModelSettings {
            kind: model.kind.unwrap_or(ModelKind::Stub),
            path: model.path,
            input_width: model.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
            input_height: model.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            classifier_path: model.classifier_path,
        };

        let health_log_interval = Duration::from_secs(
            file.fleet
                .and_then(|fleet| fleet.health_log_secs)
                .unwrap_or(DEFAULT_HEALTH_LOG_SECS),
        );

        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, camera)| {
                let post_id = camera
                    .post_id
                    .ok_or_else(|| anyhow!("cameras[{}].post_id is required", index))?;
                Ok(CameraSettings {
                    post_id,
                    url: camera
                        .url
                        .ok_or_else(|| anyhow!("cameras[{}].url is required", index))?,
                    backend: camera.backend.unwrap_or(BackendKind::Stream),
                    width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                    height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                    target_fps: camera.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
                    force_mono: camera.force_mono.unwrap_or(false),
                    exposure_us: camera.exposure_us,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            api,
            gate,
            stream,
            detection,
            model,
            health_log_interval,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("SENTINEL_API_URL") {
            if !url.trim().is_empty() {
                self.api.url = url;
            }
        }
        if let Ok(login) = std::env::var("SENTINEL_API_LOGIN") {
            if !login.trim().is_empty() {
                self.api.login = login;
            }
        }
        if let Ok(password) = std::env::var("SENTINEL_API_PASSWORD") {
            if !password.is_empty() {
                self.api.password = password;
            }
        }
        if let Ok(client_id) = std::env::var("SENTINEL_API_CLIENT") {
            if !client_id.trim().is_empty() {
                self.api.client_id = client_id;
            }
        }
        if let Ok(dir) = std::env::var("SENTINEL_DEBUG_DIR") {
            self.detection.debug_dir = if dir.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Ok(threshold) = std::env::var("SENTINEL_DETECT_THRESHOLD") {
            self.detection.threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("SENTINEL_DETECT_THRESHOLD must be a number"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let url = url::Url::parse(&self.api.url)
            .map_err(|e| anyhow!("api.url '{}' is invalid: {}", self.api.url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("api.url must be http or https, got {}", url.scheme()));
        }
        self.api.url = self.api.url.trim_end_matches('/').to_string();
        for (name, value) in [
            ("api.login", &self.api.login),
            ("api.password", &self.api.password),
            ("api.client_id", &self.api.client_id),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{} must be set", name));
            }
        }

        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.post_id) {
                return Err(anyhow!("duplicate camera post_id {}", camera.post_id));
            }
            if camera.width == 0 || camera.height == 0 {
                return Err(anyhow!("camera {} has zero dimensions", camera.post_id));
            }
        }

        let polygon = &self.detection.polygon;
        for (name, value) in [
            ("detection.threshold", self.detection.threshold),
            ("polygon.tau", polygon.tau),
            ("polygon.tau_strong", polygon.tau_strong),
            ("polygon.min_area_frac", polygon.min_area_frac),
            ("polygon.approx_eps_frac", polygon.approx_eps_frac),
            ("polygon.min_box_frac", polygon.min_box_frac),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if polygon.morph_kernel % 2 == 0 {
            return Err(anyhow!(
                "polygon.morph_kernel must be odd, got {}",
                polygon.morph_kernel
            ));
        }
        if !(1..=100).contains(&self.detection.jpeg_quality) {
            return Err(anyhow!("detection.jpeg_quality must be within 1..=100"));
        }
        if self.stream.min_backoff > self.stream.max_backoff {
            return Err(anyhow!("stream.min_backoff_ms exceeds stream.max_backoff_ms"));
        }
        if self.gate.poll_interval.is_zero() {
            return Err(anyhow!("gate.poll_interval_ms must be greater than zero"));
        }
        if self.model.kind == ModelKind::Onnx && self.model.path.is_none() {
            return Err(anyhow!("model.path is required when model.kind is onnx"));
        }
        Ok(())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.api.url.clone(),
            login: self.api.login.clone(),
            password: self.api.password.clone(),
            client_id: self.api.client_id.clone(),
            timeout: self.api.timeout,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            max_retries: self.stream.max_retries,
            reconnect: Backoff::new(
                self.stream.min_backoff,
                self.stream.max_backoff,
                self.stream.jitter,
            ),
            start_paused: self.stream.start_paused,
            ..StreamConfig::default()
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            interval: self.gate.poll_interval,
            backoff: Backoff::new(
                Duration::from_millis(DEFAULT_GATE_MIN_BACKOFF_MS),
                self.gate.max_backoff,
                Duration::from_millis(DEFAULT_JITTER_MS),
            ),
            ..WatcherConfig::default()
        }
    }
}

impl CameraSettings {
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            kind: self.backend,
            url: self.url.clone(),
            width: self.width,
            height: self.height,
            target_fps: self.target_fps,
            force_mono: self.force_mono,
            exposure_us: self.exposure_us,
        }
    }
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
