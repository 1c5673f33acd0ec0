use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectorSettings;
use crate::ingest::SourceConfig;
use crate::pipeline::{DetectionFailurePolicy, PipelineConfig};
use crate::stream::EncoderConfig;
use crate::telemetry::DEFAULT_LOCATION;

pub const CONFIG_ENV: &str = "DRONEWATCH_CONFIG";

const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_LOG_PATH: &str = "detections_log.csv";
const DEFAULT_CONFIDENCE: f32 = 0.30;
const DEFAULT_READ_BACKOFF_MS: u64 = 500;
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_CLIENT_BUFFER: usize = 4;
const DEFAULT_MAX_READ_FAILURES: u32 = 10;
const DEFAULT_PREVIEW_EVERY: u64 = 1;

// -------------------- File layout --------------------

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct DetectdConfigFile {
    log_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    read_backoff_ms: Option<u64>,
    detection_failure: Option<DetectionFailurePolicy>,
    source: SourceConfigFile,
    detector: DetectorConfigFile,
    preview: PreviewConfigFile,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct StreamServerConfigFile {
    api_addr: Option<String>,
    transform: Option<String>,
    confidence_threshold: Option<f32>,
    jpeg_quality: Option<u8>,
    client_buffer: Option<usize>,
    max_read_failures: Option<u32>,
    read_backoff_ms: Option<u64>,
    telemetry_location: Option<String>,
    source: SourceConfigFile,
    detector: DetectorConfigFile,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct SourceConfigFile {
    url: Option<String>,
    read_timeout_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<u32>,
    motion_cell_size: Option<u32>,
    motion_pixel_delta: Option<f32>,
    motion_min_cells: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct PreviewConfigFile {
    path: Option<PathBuf>,
    every: Option<u64>,
}

// -------------------- Resolved settings --------------------

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub read_timeout: Duration,
    pub width: u32,
    pub height: u32,
    /// 0 keeps the origin's own rate.
    pub target_fps: u32,
}

impl SourceSettings {
    fn from_file(file: SourceConfigFile) -> Self {
        Self {
            url: file.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            read_timeout: Duration::from_millis(
                file.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            width: file.width.unwrap_or(DEFAULT_WIDTH),
            height: file.height.unwrap_or(DEFAULT_HEIGHT),
            target_fps: file.target_fps.unwrap_or(0),
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            url: self.url.clone(),
            read_timeout: self.read_timeout,
            width: self.width,
            height: self.height,
            target_fps: self.target_fps,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(anyhow!("source url must not be empty"));
        }
        if self.read_timeout.is_zero() {
            return Err(anyhow!("source read timeout must be greater than zero"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("source width and height must be non-zero"));
        }
        Ok(())
    }
}

fn detector_settings(file: DetectorConfigFile) -> DetectorSettings {
    let defaults = DetectorSettings::default();
    DetectorSettings {
        backend: file.backend.unwrap_or(defaults.backend),
        model_path: file.model_path.or(defaults.model_path),
        labels_path: file.labels_path.or(defaults.labels_path),
        input_size: file.input_size.unwrap_or(defaults.input_size),
        motion_cell_size: file.motion_cell_size.unwrap_or(defaults.motion_cell_size),
        motion_pixel_delta: file
            .motion_pixel_delta
            .unwrap_or(defaults.motion_pixel_delta),
        motion_min_cells: file.motion_min_cells.unwrap_or(defaults.motion_min_cells),
    }
}

/// Which transform the stream server applies before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransform {
    Placeholder,
    Detect,
    Passthrough,
}

impl std::str::FromStr for StreamTransform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "placeholder" => Ok(Self::Placeholder),
            "detect" => Ok(Self::Detect),
            "passthrough" | "none" => Ok(Self::Passthrough),
            other => Err(anyhow!(
                "unknown stream transform '{}'; expected placeholder, detect or passthrough",
                other
            )),
        }
    }
}

/// Settings for the detection daemon.
#[derive(Debug, Clone)]
pub struct DetectdConfig {
    pub source: SourceSettings,
    pub log_path: PathBuf,
    pub detector: DetectorSettings,
    pub confidence_threshold: f32,
    pub read_backoff: Duration,
    pub detection_failure: DetectionFailurePolicy,
    /// Annotated frames are written here when set.
    pub preview_path: Option<PathBuf>,
    pub preview_every: u64,
}

impl DetectdConfig {
    /// Load from the file named by `DRONEWATCH_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg: DetectdConfigFile = match path {
            Some(path) => read_config_file(path)?,
            None => DetectdConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DetectdConfigFile) -> Self {
        Self {
            source: SourceSettings::from_file(file.source),
            log_path: file
                .log_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH)),
            detector: detector_settings(file.detector),
            confidence_threshold: file.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
            read_backoff: Duration::from_millis(
                file.read_backoff_ms.unwrap_or(DEFAULT_READ_BACKOFF_MS),
            ),
            detection_failure: file.detection_failure.unwrap_or_default(),
            preview_path: file.preview.path,
            preview_every: file.preview.every.unwrap_or(DEFAULT_PREVIEW_EVERY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("DRONEWATCH_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(path) = env_string("DRONEWATCH_LOG_PATH") {
            self.log_path = PathBuf::from(path);
        }
        if let Some(threshold) = env_confidence()? {
            self.confidence_threshold = threshold;
        }
        if let Some(backend) = env_string("DRONEWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_string("DRONEWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_string("DRONEWATCH_PREVIEW_PATH") {
            self.preview_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.source.validate()?;
        validate_threshold(self.confidence_threshold)?;
        if self.read_backoff.is_zero() {
            return Err(anyhow!("read backoff must be greater than zero"));
        }
        if self.log_path.as_os_str().is_empty() {
            return Err(anyhow!("log path must not be empty"));
        }
        if self.preview_every == 0 {
            return Err(anyhow!("preview interval must be at least 1 frame"));
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            confidence_threshold: self.confidence_threshold,
            read_backoff: self.read_backoff,
            detection_failure: self.detection_failure,
            ..PipelineConfig::default()
        }
    }
}

/// Settings for the stream server.
#[derive(Debug, Clone)]
pub struct StreamServerConfig {
    pub api_addr: String,
    pub source: SourceSettings,
    pub transform: StreamTransform,
    pub detector: DetectorSettings,
    pub confidence_threshold: f32,
    pub jpeg_quality: u8,
    pub client_buffer: usize,
    pub max_read_failures: u32,
    pub read_backoff: Duration,
    pub telemetry_location: String,
}

impl StreamServerConfig {
    /// Load from the file named by `DRONEWATCH_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg: StreamServerConfigFile = match path {
            Some(path) => read_config_file(path)?,
            None => StreamServerConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamServerConfigFile) -> Result<Self> {
        let transform = match file.transform.as_deref() {
            Some(name) => name.parse()?,
            None => StreamTransform::Placeholder,
        };
        Ok(Self {
            api_addr: file
                .api_addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            source: SourceSettings::from_file(file.source),
            transform,
            detector: detector_settings(file.detector),
            confidence_threshold: file.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
            jpeg_quality: file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            client_buffer: file.client_buffer.unwrap_or(DEFAULT_CLIENT_BUFFER),
            max_read_failures: file.max_read_failures.unwrap_or(DEFAULT_MAX_READ_FAILURES),
            read_backoff: Duration::from_millis(
                file.read_backoff_ms.unwrap_or(DEFAULT_READ_BACKOFF_MS),
            ),
            telemetry_location: file
                .telemetry_location
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_string("DRONEWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = env_string("DRONEWATCH_STREAM_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(threshold) = env_confidence()? {
            self.confidence_threshold = threshold;
        }
        if let Some(backend) = env_string("DRONEWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_string("DRONEWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.source.validate()?;
        validate_threshold(self.confidence_threshold)?;
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.api_addr, e))?;
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        if self.client_buffer == 0 {
            return Err(anyhow!("client buffer must hold at least 1 part"));
        }
        if self.max_read_failures == 0 {
            return Err(anyhow!("max read failures must be at least 1"));
        }
        if self.read_backoff.is_zero() {
            return Err(anyhow!("read backoff must be greater than zero"));
        }
        Ok(())
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            jpeg_quality: self.jpeg_quality,
            max_read_failures: self.max_read_failures,
            read_backoff: self.read_backoff,
        }
    }
}

fn validate_threshold(threshold: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(anyhow!(
            "confidence threshold must be within [0, 1], got {}",
            threshold
        ));
    }
    Ok(())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_confidence() -> Result<Option<f32>> {
    match env_string("DRONEWATCH_CONFIDENCE") {
        Some(raw) => raw
            .parse::<f32>()
            .map(Some)
            .map_err(|_| anyhow!("DRONEWATCH_CONFIDENCE must be a number, got '{}'", raw)),
        None => Ok(None),
    }
}

/// JSON or TOML, chosen by extension. Anything but `.toml` is read as JSON.
fn read_config_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    }
}
